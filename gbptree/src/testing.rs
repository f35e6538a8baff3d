//! Helpers shared by unit tests.

use tracing_subscriber::EnvFilter;

/// Route tracing output to the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
