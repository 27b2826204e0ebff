//! Observer capability implemented by pipeline stages.
//!
//! A pool never owns its observers; it keeps weak references and notifies
//! whichever are still alive. Around every publish the pool brackets the
//! notifications with [`PoolObserver::lock_for_publish`] and
//! [`PoolObserver::unlock_after_publish`] so an observer can keep its own
//! state coherent while callbacks land.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

/// Receives immediate publish notifications from a pool.
///
/// Callbacks run synchronously on the publishing thread, before `publish`
/// returns. They must not subscribe or unsubscribe on the notifying pool.
pub trait PoolObserver: Send + Sync {
    /// A property was published for `request_id`.
    fn on_property_update(&self, id: u32, request_id: u64, pipeline_id: u32);

    /// A metadata tag was published for `request_id`.
    fn on_metadata_update(&self, tag: u32, request_id: u64, pipeline_id: u32);

    /// A property will not be produced for `request_id`.
    fn on_property_failure(&self, id: u32, request_id: u64, pipeline_id: u32);

    /// A metadata tag will not be produced for `request_id`.
    fn on_metadata_failure(&self, tag: u32, request_id: u64, pipeline_id: u32);

    /// Called before any notification of a publish reaches this observer.
    ///
    /// May be called more than once per publish when the observer is both a
    /// per-tag and a global subscriber; the lock must be re-entrant.
    fn lock_for_publish(&self) {}

    /// Called once per preceding `lock_for_publish`.
    fn unlock_after_publish(&self) {}
}

// ---------------------------------------------------------------------------
// PublishGate
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct GateState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Thread-reentrant gate for implementing the publish lock hooks.
///
/// `lock` blocks while another thread holds the gate and nests on the owning
/// thread. Observers typically call [`lock`](Self::lock) from
/// `lock_for_publish`, [`unlock`](Self::unlock) from `unlock_after_publish`,
/// and take a [`guard`](Self::guard) around their own reads.
#[derive(Debug, Default)]
pub struct PublishGate {
    state: Mutex<GateState>,
    released: Condvar,
}

impl PublishGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the gate, nesting if this thread already holds it.
    pub fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    /// Release one level of the gate.
    pub fn unlock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            log::warn!("[PublishGate] unlock from a thread that does not hold the gate");
            return;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
    }

    /// Whether any thread holds the gate.
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Hold the gate for the lifetime of the returned guard.
    pub fn guard(&self) -> PublishGateGuard<'_> {
        self.lock();
        PublishGateGuard { gate: self }
    }
}

/// RAII guard returned by [`PublishGate::guard`].
#[derive(Debug)]
pub struct PublishGateGuard<'a> {
    gate: &'a PublishGate,
}

impl Drop for PublishGateGuard<'_> {
    fn drop(&mut self) {
        self.gate.unlock();
    }
}
