//! Test-only helpers shared between this crate's unit tests and the
//! `tests/scenarios.rs` integration suite.

use once_cell::sync::OnceCell;

static INIT: OnceCell<()> = OnceCell::new();

/// Initialize `env_logger` at most once per test binary. Safe to call
/// from every test; later calls are no-ops.
pub fn init_test_logger() {
    INIT.get_or_init(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
