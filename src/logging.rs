// src/logging.rs
use tracing_subscriber::EnvFilter;

use crate::config::Settings;

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise connection chatter is shown at `info`
/// with console status on and only warnings without it. Calling this twice
/// is harmless.
pub fn init_tracing(settings: &Settings) {
    let default_level = if settings.console_status { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
