//! Logging bootstrap for embedders and tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install the default tracing subscriber once. Embedders with their own
/// subscriber simply skip this.
pub fn init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_target(false).try_init();
    });
}
