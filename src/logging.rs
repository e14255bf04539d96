//! Tracing setup for embedders that do not install their own subscriber.

use tracing_subscriber::EnvFilter;

/// Default filter directive for this crate
pub const DEFAULT_DIRECTIVE: &str = "nexus_frame_bridge=info";

/// Install a formatting subscriber filtered by `RUST_LOG`
///
/// Falls back to `default_directive` when `RUST_LOG` is unset or invalid.
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
