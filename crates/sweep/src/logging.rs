//! Logging configuration
//!
//! Installs a stdout tracing subscriber for hosts that do not bring their own.

use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize the tracing subscriber for stdout logging.
///
/// Call once at startup, before spawning any sweep. Subsequent calls are
/// safe but have no effect, and a subscriber installed by the host wins.
///
/// # Arguments
///
/// * `level` - Log filter (e.g., "debug", "info", "sweep=trace"). Falls back
///   to "info" when it does not parse.
pub fn init_logging(level: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

        if fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_ansi(false)
            .try_init()
            .is_err()
        {
            tracing::debug!("A global tracing subscriber is already installed");
        }
    });
}
