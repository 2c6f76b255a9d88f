//! `tracing` initialization shared by the Engine, every Resource adapter and
//! the Store. Mirrors the teacher's `fetiche-common::logging` setup: an
//! `EnvFilter` sourced from `RUST_LOG`, plus an optional hierarchical tree
//! layer for interactive runs.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_tree::HierarchicalLayer;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("tracing subscriber already installed")]
    AlreadyInit,
}

/// Install the global `tracing` subscriber. `use_tree` selects the
/// human-friendly hierarchical renderer (for a terminal session); when
/// `false`, a plain `EnvFilter`-only registry is installed so a daemon can
/// pair it with its own formatting layer downstream.
pub fn init_logging(use_tree: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let tree = use_tree.then(|| {
        HierarchicalLayer::new(2)
            .with_ansi(true)
            .with_span_retrace(true)
            .with_span_modes(true)
            .with_targets(true)
            .with_verbose_entry(true)
            .with_verbose_exit(true)
            .with_bracketed_fields(true)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tree)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInit)
}

/// No-op today; kept as a symmetric counterpart to `init_logging` so call
/// sites don't need to change if a flush-on-shutdown exporter is added later.
pub fn close_logging() {}
