//! Tracing setup.
//!
//! The library only emits `tracing` events; installing a subscriber is up to
//! the host. These helpers cover the common cases.

use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "pex_kernel=info";

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_DIRECTIVE`]. Returns `false` if a global subscriber was already
/// installed.
pub fn init() -> bool {
    init_with(DEFAULT_DIRECTIVE)
}

pub fn init_with(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Subscriber routed through the test harness' captured output.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("pex_kernel=debug,pex_core=debug")
        .with_test_writer()
        .try_init();
}
