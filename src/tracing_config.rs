//! Subscriber setup for programs and tests driving the model
//!
//! The crate logs through `tracing` only. Construction, checkpoint and mode
//! summaries go out at INFO; per-step loss terms and mode dispatch go out at
//! DEBUG under `inade::model`, and are only computed when that level is on.

use crate::error::{Result, SynthesisError};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Construction and checkpoint messages from the crate, warnings from dependencies
pub const DEFAULT_DIRECTIVES: &str = "warn,inade=info";

/// Adds per-step loss terms and mode dispatch from the orchestrator
pub const LOSS_DIRECTIVES: &str = "warn,inade=info,inade::model=debug";

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Single-line human-readable records
    #[default]
    Compact,
    /// One JSON object per record, for training logs collected by other tools
    Json,
}

/// `RUST_LOG` when set and valid, `fallback` otherwise
pub fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber for a training or inference program
///
/// # Examples
///
/// ```rust
/// use inade::tracing_config::{self, LogFormat};
///
/// // RUST_LOG=inade::model=debug adds every loss term per step
/// tracing_config::init(LogFormat::Compact).ok();
/// ```
pub fn init(format: LogFormat) -> Result<()> {
    let filter = env_filter(DEFAULT_DIRECTIVES);
    let installed = match format {
        LogFormat::Compact => tracing_subscriber::registry()
            .with(fmt::layer().compact().with_target(true))
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .with(filter)
            .try_init(),
    };
    installed
        .map_err(|e| SynthesisError::InvalidConfig(format!("tracing subscriber not installed: {e}")))
}

/// Subscriber for tests: captured per test, loss terms included
///
/// Safe to call from every test.
pub fn init_test() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false).with_test_writer())
        .with(EnvFilter::new(LOSS_DIRECTIVES))
        .try_init();
}
