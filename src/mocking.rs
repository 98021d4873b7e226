//! Process-global test switches.
//!
//! Mock mode diverts the snapshot, function-call and MPI clients into
//! in-process logs instead of the network. Test mode additionally makes the
//! scheduler record every admitted message. Both default to off.

use std::sync::atomic::{AtomicBool, Ordering};

static MOCK_MODE: AtomicBool = AtomicBool::new(false);
static TEST_MODE: AtomicBool = AtomicBool::new(false);

/// Divert outbound client calls into the per-client mock logs.
pub fn set_mock_mode(enabled: bool) {
    MOCK_MODE.store(enabled, Ordering::SeqCst);
}

pub fn is_mock_mode() -> bool {
    MOCK_MODE.load(Ordering::SeqCst)
}

/// Make the scheduler keep recorded-message logs.
pub fn set_test_mode(enabled: bool) {
    TEST_MODE.store(enabled, Ordering::SeqCst);
}

pub fn is_test_mode() -> bool {
    TEST_MODE.load(Ordering::SeqCst)
}
