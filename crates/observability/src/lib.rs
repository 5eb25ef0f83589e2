//! Tracing and logging setup shared by the binaries.

pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat};

/// Initialize process-wide tracing from explicit settings.
pub fn init_with(config: &LogConfig) {
    tracing::init(config);
}
