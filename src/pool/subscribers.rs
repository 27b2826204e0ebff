//! Per-tag and global subscriber lists with the publish fan-out.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{PoolError, PoolResult};
use crate::observer::PoolObserver;

/// Bound on the subscribe-all list.
pub const MAX_GLOBAL_SUBSCRIBERS: usize = 8;

#[derive(Clone)]
struct SubscriberEntry {
    observer: Weak<dyn PoolObserver>,
    name: String,
}

impl SubscriberEntry {
    fn new(observer: &Arc<dyn PoolObserver>, name: &str) -> Self {
        Self {
            observer: Arc::downgrade(observer),
            name: name.to_string(),
        }
    }

    fn is(&self, observer: &Arc<dyn PoolObserver>) -> bool {
        self.observer.as_ptr() as *const () == Arc::as_ptr(observer) as *const ()
    }
}

/// A live observer captured for one notification round.
pub(crate) struct Notified {
    pub observer: Arc<dyn PoolObserver>,
    pub name: String,
}

/// Which callback pair a notification uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Update,
    Failure,
}

/// Subscriber bookkeeping for one pool.
pub(crate) struct Subscribers {
    log_prefix: String,
    per_tag: DashMap<u32, Vec<SubscriberEntry>>,
    global: RwLock<Vec<SubscriberEntry>>,
}

impl Subscribers {
    pub fn new(log_prefix: String) -> Self {
        Self {
            log_prefix,
            per_tag: DashMap::new(),
            global: RwLock::new(Vec::with_capacity(MAX_GLOBAL_SUBSCRIBERS)),
        }
    }

    pub fn add_for_tag(&self, tag_index: u32, observer: &Arc<dyn PoolObserver>, name: &str) {
        self.per_tag
            .entry(tag_index)
            .or_default()
            .push(SubscriberEntry::new(observer, name));
    }

    pub fn add_global(&self, observer: &Arc<dyn PoolObserver>, name: &str) -> PoolResult<()> {
        let mut global = self.global.write();
        if global.len() >= MAX_GLOBAL_SUBSCRIBERS {
            return Err(PoolError::NoMemory(format!(
                "{} subscribe-all list full ({} entries), rejecting {}",
                self.log_prefix, MAX_GLOBAL_SUBSCRIBERS, name
            )));
        }
        global.push(SubscriberEntry::new(observer, name));
        Ok(())
    }

    /// Remove `observer` from the global list. Returns the number removed.
    pub fn remove_global(&self, observer: &Arc<dyn PoolObserver>) -> usize {
        let mut global = self.global.write();
        let before = global.len();
        global.retain(|entry| !entry.is(observer));
        before - global.len()
    }

    /// Remove `observer` from every list. Returns the number removed.
    pub fn remove_everywhere(&self, observer: &Arc<dyn PoolObserver>) -> usize {
        let mut removed = self.remove_global(observer);
        for mut list in self.per_tag.iter_mut() {
            let before = list.len();
            list.retain(|entry| !entry.is(observer));
            removed += before - list.len();
        }
        self.per_tag.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn tag_subscriber_count(&self, tag_index: u32) -> usize {
        self.per_tag.get(&tag_index).map_or(0, |list| list.len())
    }

    pub fn global_subscriber_count(&self) -> usize {
        self.global.read().len()
    }

    /// Live observers for `tag_index`, per-tag list first, then global.
    fn collect(&self, tag_index: u32) -> Vec<Notified> {
        let mut live = Vec::new();
        if let Some(list) = self.per_tag.get(&tag_index) {
            self.upgrade_into(list.value(), &mut live);
        }
        self.upgrade_into(&self.global.read(), &mut live);
        live
    }

    fn upgrade_into(&self, entries: &[SubscriberEntry], live: &mut Vec<Notified>) {
        for entry in entries {
            match entry.observer.upgrade() {
                Some(observer) => live.push(Notified {
                    observer,
                    name: entry.name.clone(),
                }),
                None => log::warn!(
                    "{} subscriber {} dropped without unsubscribing",
                    self.log_prefix,
                    entry.name
                ),
            }
        }
    }

    /// Lock every subscriber, deliver one callback each, then unlock.
    ///
    /// Observers are snapshotted before any callback runs, so no list lock is
    /// held while observer code executes.
    pub fn notify(
        &self,
        tag: u32,
        tag_index: u32,
        is_property: bool,
        request_id: u64,
        pipeline_id: u32,
        outcome: Outcome,
    ) -> usize {
        let targets = self.collect(tag_index);
        let locked = PublishLocks::acquire(&targets);
        for target in locked.targets {
            log::trace!(
                "{} notifying {} of {:?} for request {} tag {:#x}",
                self.log_prefix,
                target.name,
                outcome,
                request_id,
                tag
            );
            let observer = &target.observer;
            match (outcome, is_property) {
                (Outcome::Update, true) => observer.on_property_update(tag, request_id, pipeline_id),
                (Outcome::Update, false) => observer.on_metadata_update(tag, request_id, pipeline_id),
                (Outcome::Failure, true) => {
                    observer.on_property_failure(tag, request_id, pipeline_id)
                }
                (Outcome::Failure, false) => {
                    observer.on_metadata_failure(tag, request_id, pipeline_id)
                }
            }
        }
        drop(locked);
        targets.len()
    }
}

/// Observers locked for one notification round. Unlocks them on drop, so a
/// panicking callback does not leave the others locked.
struct PublishLocks<'a> {
    targets: &'a [Notified],
    held: usize,
}

impl<'a> PublishLocks<'a> {
    fn acquire(targets: &'a [Notified]) -> Self {
        let mut locks = Self { targets, held: 0 };
        for target in targets {
            target.observer.lock_for_publish();
            locks.held += 1;
        }
        locks
    }
}

impl Drop for PublishLocks<'_> {
    fn drop(&mut self) {
        for target in &self.targets[..self.held] {
            target.observer.unlock_after_publish();
        }
    }
}
