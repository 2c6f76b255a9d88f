//! Physical quantities used for resource requirements (spec §3/§6): memory
//! per core and wall-clock limits. A `Quantity` pairs an integer value with a
//! unit and refuses to let you add a memory amount to a duration.
//!
//! Parsing follows the teacher's `Storage::parse_rotation` idiom: a `nom`
//! combinator peeling a suffix off an integer, generalized to the wider unit
//! set spec §6 requires.

use std::cmp::Ordering;
use std::fmt;

use nom::character::complete::{alpha1, i64 as nom_i64};
use nom::combinator::map_res;
use nom::sequence::pair;
use nom::IResult;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Dimension {
    Memory,
    Time,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[allow(non_camel_case_types)]
pub enum MemoryUnit {
    B,
    kB,
    KiB,
    MB,
    MiB,
    GB,
    GiB,
    TB,
    TiB,
    PB,
    PiB,
}

impl MemoryUnit {
    /// Number of bytes in one unit.
    const fn bytes_per_unit(self) -> i64 {
        match self {
            MemoryUnit::B => 1,
            MemoryUnit::kB => 1_000,
            MemoryUnit::KiB => 1 << 10,
            MemoryUnit::MB => 1_000_000,
            MemoryUnit::MiB => 1 << 20,
            MemoryUnit::GB => 1_000_000_000,
            MemoryUnit::GiB => 1 << 30,
            MemoryUnit::TB => 1_000_000_000_000,
            MemoryUnit::TiB => 1 << 40,
            MemoryUnit::PB => 1_000_000_000_000_000,
            MemoryUnit::PiB => 1 << 50,
        }
    }

    fn parse_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "B" => MemoryUnit::B,
            "kB" => MemoryUnit::kB,
            "KiB" => MemoryUnit::KiB,
            "MB" => MemoryUnit::MB,
            "MiB" => MemoryUnit::MiB,
            "GB" => MemoryUnit::GB,
            "GiB" => MemoryUnit::GiB,
            "TB" => MemoryUnit::TB,
            "TiB" => MemoryUnit::TiB,
            "PB" => MemoryUnit::PB,
            "PiB" => MemoryUnit::PiB,
            _ => return None,
        })
    }
}

impl fmt::Display for MemoryUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemoryUnit::B => "B",
            MemoryUnit::kB => "kB",
            MemoryUnit::KiB => "KiB",
            MemoryUnit::MB => "MB",
            MemoryUnit::MiB => "MiB",
            MemoryUnit::GB => "GB",
            MemoryUnit::GiB => "GiB",
            MemoryUnit::TB => "TB",
            MemoryUnit::TiB => "TiB",
            MemoryUnit::PB => "PB",
            MemoryUnit::PiB => "PiB",
        };
        write!(f, "{s}")
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    const fn seconds_per_unit(self) -> i64 {
        match self {
            TimeUnit::Seconds => 1,
            TimeUnit::Minutes => 60,
            TimeUnit::Hours => 3_600,
            TimeUnit::Days => 86_400,
        }
    }

    fn parse_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "s" | "S" | "seconds" => TimeUnit::Seconds,
            "m" | "minutes" => TimeUnit::Minutes,
            "h" | "H" | "hours" => TimeUnit::Hours,
            "d" | "D" | "days" => TimeUnit::Days,
            _ => return None,
        })
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeUnit::Seconds => "s",
            TimeUnit::Minutes => "m",
            TimeUnit::Hours => "h",
            TimeUnit::Days => "d",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum QuantityError {
    #[error("cannot combine a {0:?} quantity with a {1:?} quantity")]
    DimensionMismatch(Dimension, Dimension),
    #[error("invalid quantity string: {0}")]
    Parse(String),
}

/// An integer value paired with a unit, internally normalised to bytes (for
/// `Dimension::Memory`) or seconds (for `Dimension::Time`) so comparisons and
/// same-dimension arithmetic never need to look at the original unit.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct Quantity {
    dimension: Dimension,
    /// Value in the canonical unit (bytes, or seconds).
    canonical: i64,
}

impl Quantity {
    pub fn memory(value: i64, unit: MemoryUnit) -> Self {
        Quantity {
            dimension: Dimension::Memory,
            canonical: value * unit.bytes_per_unit(),
        }
    }

    pub fn time(value: i64, unit: TimeUnit) -> Self {
        Quantity {
            dimension: Dimension::Time,
            canonical: value * unit.seconds_per_unit(),
        }
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    /// Value expressed in the canonical unit (bytes, or seconds).
    pub fn canonical_value(&self) -> i64 {
        self.canonical
    }

    /// Convert to an arbitrary unit of a compatible dimension. Fails (returns
    /// `None`) silently is not an option here: a caller asking for bytes of a
    /// duration is a programming error, caught via `as_memory`/`as_time`
    /// instead, which are dimension-checked at the type level.
    pub fn as_memory(&self, unit: MemoryUnit) -> Result<i64, QuantityError> {
        match self.dimension {
            Dimension::Memory => Ok(self.canonical / unit.bytes_per_unit()),
            Dimension::Time => Err(QuantityError::DimensionMismatch(Dimension::Memory, Dimension::Time)),
        }
    }

    pub fn as_time(&self, unit: TimeUnit) -> Result<i64, QuantityError> {
        match self.dimension {
            Dimension::Time => Ok(self.canonical / unit.seconds_per_unit()),
            Dimension::Memory => Err(QuantityError::DimensionMismatch(Dimension::Time, Dimension::Memory)),
        }
    }

    pub fn checked_add(&self, other: &Quantity) -> Result<Quantity, QuantityError> {
        if self.dimension != other.dimension {
            return Err(QuantityError::DimensionMismatch(self.dimension, other.dimension));
        }
        Ok(Quantity {
            dimension: self.dimension,
            canonical: self.canonical + other.canonical,
        })
    }

    pub fn scale(&self, factor: i64) -> Quantity {
        Quantity {
            dimension: self.dimension,
            canonical: self.canonical * factor,
        }
    }

    /// Dimensionless ratio between two same-dimension quantities.
    pub fn checked_div(&self, other: &Quantity) -> Result<f64, QuantityError> {
        if self.dimension != other.dimension {
            return Err(QuantityError::DimensionMismatch(self.dimension, other.dimension));
        }
        Ok(self.canonical as f64 / other.canonical as f64)
    }

    /// Parse strings like `"4GiB"`, `"512MB"`, `"2h"`, `"90s"`.
    pub fn parse(input: &str) -> Result<Quantity, QuantityError> {
        fn parser(input: &str) -> IResult<&str, (i64, &str)> {
            map_res(pair(nom_i64, alpha1), Ok::<_, ()>)(input)
        }
        let (_, (value, tag)) = parser(input).map_err(|_| QuantityError::Parse(input.to_string()))?;

        if let Some(unit) = MemoryUnit::parse_tag(tag) {
            return Ok(Quantity::memory(value, unit));
        }
        if let Some(unit) = TimeUnit::parse_tag(tag) {
            return Ok(Quantity::time(value, unit));
        }
        Err(QuantityError::Parse(input.to_string()))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dimension {
            Dimension::Memory => write!(f, "{}B", self.canonical),
            Dimension::Time => write!(f, "{}s", self.canonical),
        }
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.dimension == other.dimension && self.canonical == other.canonical
    }
}
impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.dimension != other.dimension {
            return None;
        }
        Some(self.canonical.cmp(&other.canonical))
    }
}
