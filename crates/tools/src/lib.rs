//! Brainflow Tools
//!
//! Run configuration, demo networks and helpers for the `brainflow-run` CLI.

pub mod config;
pub mod demos;
pub mod dump;
pub mod error;

use tracing_subscriber::{EnvFilter, fmt};

pub use config::RunConfig;
pub use demos::Demo;
pub use error::{Error, Result};

/// Filter used when neither `RUST_LOG` nor the run config sets one.
pub const DEFAULT_LOG_FILTER: &str = "info,brainflow_runtime=debug,brainflow_tools=debug";

/// Initialize logging.
///
/// `RUST_LOG` wins over `filter`, which wins over [`DEFAULT_LOG_FILTER`].
pub fn init_logging(filter: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter.unwrap_or(DEFAULT_LOG_FILTER)));

    fmt().with_env_filter(filter).with_target(false).init();
}
