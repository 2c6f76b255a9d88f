//! Error taxonomy (spec §7): one `thiserror` enum per concern, composed into
//! [`Gc3Error`] so callers can propagate with `?` regardless of which layer
//! raised it. Mirrors the teacher's split of small per-subsystem error enums
//! feeding a top-level error (`fetiche_engine::SchedulerError` /
//! `EngineStatus`), except here every subsystem gets its own enum instead of
//! two ad hoc ones.

use std::path::PathBuf;

use thiserror::Error;

pub use gc3_common::{ConfigError, QuantityError};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown auth descriptor {0:?}")]
    Unknown(String),
    #[error("credentials rejected for {0:?}")]
    Rejected(String),
    #[error("auth descriptor {0:?} missing required key {1:?}")]
    MissingKey(String, &'static str),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("host key verification failed for {0}")]
    HostKeyMismatch(String),
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this failure should be retried (§4.1: transient vs permanent).
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_) | TransportError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("submission permanently rejected: {0}")]
    SubmissionRejected(String),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("resource permanently unusable: {0}")]
    Fatal(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Transient(_) => true,
            BackendError::Transport(t) => t.is_transient(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("cannot write {0}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("object {0} not found")]
    NotFound(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("(de)serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unsupported store URL: {0}")]
    UnsupportedUrl(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Quantity(#[from] QuantityError),
    #[error("no resource can accommodate task {0}")]
    NoSuitableResource(String),
    #[error("task or group {0} is not managed by this engine")]
    NodeNotFound(String),
    #[error("task {0} is not in a redo-able (terminated) state")]
    NotTerminated(String),
    #[error("actor call failed: {0}")]
    Actor(String),
}

/// Top-level error type: everything an `Engine`/`Session` operation can
/// return. `eyre::Result` is used at application-boundary entry points (the
/// `demos/` binary), this type is the library-boundary error the teacher's
/// `thiserror` enums play at the `fetiche-engine` crate root.
#[derive(Debug, Error)]
pub enum Gc3Error {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ractor::ActorProcessingErr> for EngineError {
    fn from(e: ractor::ActorProcessingErr) -> Self {
        EngineError::Actor(e.to_string())
    }
}
