//! POSIX-style combined return code (spec §4.3, §4.6).
//!
//! A 16-bit value: bits 0-6 are a signal number (0 means "no signal, exited
//! normally"), bit 7 is unused, bits 8-15 are the exit code and are only
//! meaningful when the signal bits are zero. GC3Pie extends the signal
//! namespace with pseudo-signals past the POSIX range (1-31) to describe
//! failure modes that never correspond to an actual Unix signal.

use std::fmt;

const SIGNAL_MASK: u16 = 0x7f;
const EXIT_SHIFT: u16 = 8;

/// Pseudo-signal numbers, chosen past `SIGRTMAX` (typically 64) so they never
/// collide with a real signal delivered by a back-end.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PseudoSignal {
    CancelledByUser,
    ResourceLimitExceeded,
    SubmissionFailed,
    DataStagingFailed,
    RemoteError,
}

impl PseudoSignal {
    const fn code(self) -> u16 {
        match self {
            PseudoSignal::CancelledByUser => 70,
            PseudoSignal::ResourceLimitExceeded => 71,
            PseudoSignal::SubmissionFailed => 72,
            PseudoSignal::DataStagingFailed => 73,
            PseudoSignal::RemoteError => 74,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            70 => PseudoSignal::CancelledByUser,
            71 => PseudoSignal::ResourceLimitExceeded,
            72 => PseudoSignal::SubmissionFailed,
            73 => PseudoSignal::DataStagingFailed,
            74 => PseudoSignal::RemoteError,
            _ => return None,
        })
    }
}

impl fmt::Display for PseudoSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PseudoSignal::CancelledByUser => "cancelled-by-user",
            PseudoSignal::ResourceLimitExceeded => "resource-limit-exceeded",
            PseudoSignal::SubmissionFailed => "submission-failed",
            PseudoSignal::DataStagingFailed => "data-staging-failed",
            PseudoSignal::RemoteError => "remote-error",
        };
        write!(f, "{s}")
    }
}

/// The decoded form of a [`ReturnCode`]: either a plain exit code, a real
/// POSIX signal number, or a GC3Pie pseudo-signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    Exited(u8),
    Signalled(u8),
    Pseudo(PseudoSignal),
}

/// The 16-bit combined return code stored in a Task's run record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct ReturnCode(u16);

impl ReturnCode {
    pub fn from_exit(code: u8) -> Self {
        ReturnCode((code as u16) << EXIT_SHIFT)
    }

    pub fn from_signal(signal: u8) -> Self {
        ReturnCode((signal as u16) & SIGNAL_MASK)
    }

    pub fn from_pseudo(signal: PseudoSignal) -> Self {
        ReturnCode(signal.code())
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome(), Outcome::Exited(0))
    }

    pub fn outcome(&self) -> Outcome {
        let signal_bits = self.0 & SIGNAL_MASK;
        if signal_bits == 0 {
            Outcome::Exited((self.0 >> EXIT_SHIFT) as u8)
        } else if let Some(pseudo) = PseudoSignal::from_code(signal_bits) {
            Outcome::Pseudo(pseudo)
        } else {
            Outcome::Signalled(signal_bits as u8)
        }
    }

    pub fn raw(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome() {
            Outcome::Exited(code) => write!(f, "exit={code}"),
            Outcome::Signalled(sig) => write!(f, "signal={sig}"),
            Outcome::Pseudo(p) => write!(f, "{p}"),
        }
    }
}
