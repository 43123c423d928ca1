//! Shared helpers for unit and integration tests.

/// Initializes test logging once per process.
///
/// With the `tracing-integration` feature this installs a fmt subscriber
/// honoring `RUST_LOG`; without it, a no-op. Safe to call from every test.
#[cfg(feature = "tracing-integration")]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Initializes test logging once per process (no-op without the
/// `tracing-integration` feature).
#[cfg(not(feature = "tracing-integration"))]
pub fn init_test_logging() {}
