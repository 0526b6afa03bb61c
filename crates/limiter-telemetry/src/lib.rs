//! # Limiter Telemetry
//!
//! Structured logging for the IP limiter process.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use limiter_telemetry::{init_logging, TelemetryConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&TelemetryConfig::from_env())?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `LIMITER_SERVICE_NAME` | `ip-limiter` | Service name in log records |
//! | `LIMITER_LOG_LEVEL` / `RUST_LOG` | `info` | Filter directives |
//! | `LIMITER_JSON_LOGS` | `false` (`true` in containers) | JSON output |
//! | `NO_COLOR` | unset | Disable colors |

mod config;
mod logging;

pub use config::{TelemetryConfig, DEFAULT_SERVICE_NAME};
pub use logging::{env_filter, init_logging};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter {0}")]
    Filter(String),

    #[error("Failed to install log subscriber: {0}")]
    Init(String),
}
