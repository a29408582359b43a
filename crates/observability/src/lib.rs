//! Process-wide logging setup shared by the logistics services.

/// Initialize logging filtered by `RUST_LOG` (default `info`), as JSON
/// unless `LOG_FORMAT=pretty`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    match tracing::LogConfig::from_env() {
        Ok(config) => {
            tracing::init(&config);
        }
        Err(e) => {
            tracing::init(&tracing::LogConfig::default());
            ::tracing::warn!(error = %e, "ignoring LOG_FORMAT, logging as json");
        }
    }
}

/// Subscriber configuration and install.
pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat};
