//! Ambient stack shared by every GC3Pie-rs crate: layered configuration
//! loading, `tracing` setup, the physical-`Quantity` type used for resource
//! requirements, and the `Versioned` trait used by the Store's schema
//! evolution hook.

mod config;
mod logging;
mod quantity;
mod versioned;

pub use config::{ConfigError, ConfigEngine};
pub use logging::{close_logging, init_logging, LoggingError};
pub use quantity::{Dimension, MemoryUnit, Quantity, QuantityError, TimeUnit};
pub use versioned::{apply_upgrades, UpgradeStep, Versioned};

/// Crate name/version tag, used in logs the way the teacher tags every
/// component (`fetiche-engine/0.25.0`-style strings).
pub fn version() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
