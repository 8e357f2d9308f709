//! Tracing setup for binaries and tests.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LOG_ENV_VAR;

/// Level used when `MKTL_LOG` is unset.
pub fn default_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Initialize the global subscriber. `MKTL_LOG` overrides the level derived
/// from `verbosity`. Safe to call more than once; later calls are no-ops.
pub fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbosity)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
