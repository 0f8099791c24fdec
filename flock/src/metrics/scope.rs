//! Execution scope of a recorded call: which worker thread issued it, and which per-fragment state it belonged to.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_SLOT: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_SLOT: u64 = NEXT_THREAD_SLOT.fetch_add(1, Ordering::Relaxed);
}

/// Stable numeric id for the current OS thread, assigned on first use.
pub fn current_thread_slot() -> u64 {
    THREAD_SLOT.with(|slot| *slot)
}

/// Identifier of one execution state (a scalar fragment or an aggregate group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(pub u64);

/// Where a call was issued from.
///
/// The thread is captured when the state starts executing; a state never moves between scopes even if the runtime
/// migrates its task later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricsScope {
    pub thread: String,
    pub state: StateId,
}

impl MetricsScope {
    pub fn new(thread: impl Into<String>, state: StateId) -> Self {
        Self {
            thread: thread.into(),
            state,
        }
    }

    /// Scope for `state` on the calling thread.
    pub fn current(state: StateId) -> Self {
        Self::new(current_thread_slot().to_string(), state)
    }
}
