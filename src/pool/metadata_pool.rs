//! The metadata pool: a fixed window of slots plus the subscription and
//! flush machinery shared by them.
//!
//! Slots are allocated once, either on the caller's thread or on a
//! [`Worker`]. Until allocation finishes every slot access waits on a
//! condition variable, bounded by the configured creation timeout.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::buffer::{MetaBuffer, MetaBufferHandle};
use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::observer::PoolObserver;
use crate::pool::blob::BlobLayout;
use crate::pool::slot::{MetadataSlot, SlotHandle};
use crate::pool::subscribers::{Outcome, Subscribers};
use crate::pool::types::{PoolStatus, PoolType, StorageMode, Subscription};
use crate::tags::{TagDescriptor, TagRegistry};
use crate::worker::{Job, Worker};

/// Bookkeeping guarded by the pool mutex.
#[derive(Debug, Default)]
struct FlushState {
    /// `last_valid` of the most recent flush that refreshed the sticky
    /// buffer; 0 before the first one.
    previous_last_valid: u64,
}

/// Fixed-capacity circular window of slots for one pipeline role.
pub struct MetadataPool {
    config: PoolConfig,
    log_prefix: String,
    registry: Arc<dyn TagRegistry>,
    slots: OnceCell<Box<[MetadataSlot]>>,
    status: Mutex<PoolStatus>,
    status_changed: Condvar,
    pool_lock: Mutex<FlushState>,
    last_flush: AtomicU64,
    sticky: Option<MetaBufferHandle>,
    subscribers: Subscribers,
    publish_set: RwLock<BTreeSet<u32>>,
    early_tags: Box<[AtomicU32]>,
}

impl std::fmt::Debug for MetadataPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataPool")
            .field("name", &self.config.name)
            .field("pool_type", &self.config.pool_type)
            .field("capacity", &self.config.capacity)
            .field("status", &*self.status.lock())
            .finish()
    }
}

impl MetadataPool {
    /// Validate `config`, build the pool and allocate its slots.
    ///
    /// With a `worker` the allocation is posted as a job and this returns
    /// immediately; slot access then waits for it. If the job cannot be
    /// posted the pool is initialized on the calling thread instead.
    pub fn create(
        config: PoolConfig,
        registry: Arc<dyn TagRegistry>,
        worker: Option<&dyn Worker>,
    ) -> PoolResult<Arc<Self>> {
        if let Err(e) = config.validate() {
            log::error!(
                "[{} {}] rejected configuration ({}): {}",
                config.name,
                config.pool_type,
                e.kind(),
                e
            );
            return Err(e);
        }
        let pool = Arc::new(Self::new(config, registry));

        match worker {
            Some(worker) => {
                let deferred = Arc::clone(&pool);
                let job: Job = Box::new(move || {
                    // Failure is recorded in the pool status.
                    let _ = deferred.initialize();
                });
                if let Err(e) = worker.post_job("metapool-init", job) {
                    log::warn!(
                        "{} could not post init job ({}), initializing inline",
                        pool.log_prefix,
                        e
                    );
                    pool.initialize()?;
                }
            }
            None => pool.initialize()?,
        }
        Ok(pool)
    }

    fn new(config: PoolConfig, registry: Arc<dyn TagRegistry>) -> Self {
        let log_prefix = format!("[{} {}]", config.name, config.pool_type);
        let sticky = config.pool_type.is_result().then(MetaBuffer::new);
        let early_tags = (0..config.capacity).map(|_| AtomicU32::new(0)).collect();
        Self {
            subscribers: Subscribers::new(log_prefix.clone()),
            log_prefix,
            registry,
            slots: OnceCell::new(),
            status: Mutex::new(PoolStatus::Uninitialized),
            status_changed: Condvar::new(),
            pool_lock: Mutex::new(FlushState::default()),
            last_flush: AtomicU64::new(0),
            sticky,
            publish_set: RwLock::new(BTreeSet::new()),
            early_tags,
            config,
        }
    }

    /// Allocate every slot, record the outcome and wake waiters.
    fn initialize(&self) -> PoolResult<()> {
        let result = self.allocate_slots();
        let mut status = self.status.lock();
        match &result {
            Ok(()) => {
                *status = PoolStatus::Initialized;
                log::info!(
                    "{} metadata pool initialized with {} slots",
                    self.log_prefix,
                    self.config.capacity
                );
            }
            Err(e) => {
                *status = PoolStatus::Error;
                log::error!(
                    "{} metadata pool initialize failed ({}): {}",
                    self.log_prefix,
                    e.kind(),
                    e
                );
            }
        }
        self.status_changed.notify_all();
        result
    }

    fn allocate_slots(&self) -> PoolResult<()> {
        let pool_type = self.config.pool_type;
        let layout = match pool_type.storage_mode() {
            StorageMode::Blob => Some(BlobLayout::new(
                self.registry.as_ref(),
                self.config.max_blob_bytes,
            )?),
            StorageMode::Buffer => None,
        };
        let max_tag_count = self.registry.max_tag_count();
        let slots = (0..self.config.capacity)
            .map(|_| MetadataSlot::new(pool_type, max_tag_count, layout.as_ref()))
            .collect::<PoolResult<Vec<_>>>()?;
        self.slots
            .set(slots.into_boxed_slice())
            .map_err(|_| PoolError::InvalidState(format!("{} already initialized", self.log_prefix)))
    }

    /// Block until deferred initialization has finished.
    ///
    /// Returns `Timeout` if it does not finish within the configured bound
    /// and `InvalidState` if it failed.
    pub fn wait_for_creation(&self) -> PoolResult<()> {
        let mut status = self.status.lock();
        if *status == PoolStatus::Uninitialized {
            let timeout = self.config.creation_timeout();
            let waited = self.status_changed.wait_while_for(
                &mut status,
                |status| *status == PoolStatus::Uninitialized,
                timeout,
            );
            if waited.timed_out() {
                log::warn!(
                    "{} pool creation did not finish within {:?}",
                    self.log_prefix,
                    timeout
                );
                return Err(PoolError::Timeout(format!(
                    "{} creation exceeded {:?}",
                    self.log_prefix, timeout
                )));
            }
        }
        match *status {
            PoolStatus::Initialized => Ok(()),
            PoolStatus::Error => Err(PoolError::InvalidState(format!(
                "{} initialization failed",
                self.log_prefix
            ))),
            PoolStatus::Uninitialized => Err(PoolError::Timeout(format!(
                "{} still uninitialized",
                self.log_prefix
            ))),
        }
    }

    fn slots(&self) -> PoolResult<&[MetadataSlot]> {
        if let Some(slots) = self.slots.get() {
            return Ok(&slots[..]);
        }
        self.wait_for_creation()?;
        self.slots
            .get()
            .map(|slots| &slots[..])
            .ok_or_else(|| PoolError::InvalidState(format!("{} has no slots", self.log_prefix)))
    }

    /// Slot for `request_id`, at index `request_id % capacity`.
    pub fn get_slot(&self, request_id: u64) -> PoolResult<SlotHandle<'_>> {
        let slots = self.slots()?;
        let index = (request_id % slots.len() as u64) as usize;
        Ok(SlotHandle::new(self, &slots[index], index))
    }

    // -----------------------------------------------------------------------
    // Subscription
    // -----------------------------------------------------------------------

    /// Register `observer` for each tag in `subscriptions`.
    ///
    /// Unregistered tags are logged and skipped.
    pub fn subscribe(
        &self,
        subscriptions: &[Subscription],
        observer: &Arc<dyn PoolObserver>,
        name: &str,
    ) -> PoolResult<()> {
        if !self.config.pool_type.supports_subscription() {
            log::error!("{} {} cannot subscribe to this pool", self.log_prefix, name);
            return Err(PoolError::Unsupported(format!(
                "{} does not accept subscriptions",
                self.log_prefix
            )));
        }
        let max_tags = self.registry.max_tag_count();
        if subscriptions.len() > max_tags {
            log::error!(
                "{} {} subscribed to {} tags, registry has {}",
                self.log_prefix,
                name,
                subscriptions.len(),
                max_tags
            );
            return Err(PoolError::InvalidArg(format!(
                "{} subscriptions exceed the {} registered tags",
                subscriptions.len(),
                max_tags
            )));
        }
        for subscription in subscriptions {
            match self.registry.descriptor(subscription.unit_id) {
                Some(descriptor) => self.subscribers.add_for_tag(descriptor.index, observer, name),
                None => log::error!(
                    "{} {} subscribed to unregistered {:?} {:#x}",
                    self.log_prefix,
                    name,
                    subscription.unit_type,
                    subscription.unit_id
                ),
            }
        }
        Ok(())
    }

    /// Register `observer` for every tag. At most
    /// [`MAX_GLOBAL_SUBSCRIBERS`](crate::pool::MAX_GLOBAL_SUBSCRIBERS) may be
    /// registered at once.
    pub fn subscribe_all(&self, observer: &Arc<dyn PoolObserver>, name: &str) -> PoolResult<()> {
        self.subscribers.add_global(observer, name).map_err(|e| {
            log::error!("{} {}", self.log_prefix, e);
            e
        })
    }

    /// Remove `observer` from the subscribe-all list. Returns the number of
    /// entries removed.
    pub fn unsubscribe_all(&self, observer: &Arc<dyn PoolObserver>) -> usize {
        self.subscribers.remove_global(observer)
    }

    /// Remove `observer` from every list of this pool.
    pub fn unsubscribe(&self, observer: &Arc<dyn PoolObserver>) -> usize {
        self.subscribers.remove_everywhere(observer)
    }

    /// Number of per-tag subscribers for `tag`.
    pub fn subscriber_count(&self, tag: u32) -> usize {
        self.registry
            .descriptor(tag)
            .map_or(0, |d| self.subscribers.tag_subscriber_count(d.index))
    }

    /// Number of subscribe-all observers.
    pub fn global_subscriber_count(&self) -> usize {
        self.subscribers.global_subscriber_count()
    }

    // -----------------------------------------------------------------------
    // Request lifecycle
    // -----------------------------------------------------------------------

    /// Bind the slot for `request_id` to it and reset its per-request state.
    pub fn update_request_id(&self, request_id: u64) -> PoolResult<()> {
        let slot = self.get_slot(request_id)?;
        let _pool = self.pool_lock.lock();
        slot.set_slot_request_id(request_id)?;
        self.early_tags[slot.index()].store(0, Ordering::Release);
        Ok(())
    }

    /// Invalidate the slot for `request_id`.
    pub fn invalidate(&self, request_id: u64) -> PoolResult<()> {
        let slot = self.get_slot(request_id)?;
        let _pool = self.pool_lock.lock();
        slot.invalidate();
        Ok(())
    }

    /// Reclaim the slots of requests `last_valid..=flush_to`.
    ///
    /// Result pools first snapshot the slot of `last_valid` into the sticky
    /// buffer. Repeating a flush with the same `last_valid` leaves the sticky
    /// buffer and the slots untouched; `flush_to` is always recorded.
    pub fn flush(&self, last_valid: u64, flush_to: u64) -> PoolResult<()> {
        if last_valid > flush_to {
            return Err(PoolError::InvalidArg(format!(
                "flush range {}..={} is reversed",
                last_valid, flush_to
            )));
        }
        let slots = self.slots()?;
        let mut state = self.pool_lock.lock();
        log::debug!(
            "{} flush last valid {} to {} (previous last valid {}, last flush {})",
            self.log_prefix,
            last_valid,
            flush_to,
            state.previous_last_valid,
            self.last_flush.load(Ordering::Acquire)
        );

        if state.previous_last_valid == 0 || state.previous_last_valid != last_valid {
            if let Some(sticky) = &self.sticky {
                let source = self.handle(slots, last_valid);
                sticky.invalidate(true);
                let guard = source.read();
                if let Some(buffer) = guard.metabuffer() {
                    sticky.copy_from(buffer, false)?;
                }
            }
            if !self.config.pool_type.is_single_slot() {
                let uses_buffers = self.config.pool_type.uses_meta_buffers();
                for request_id in (last_valid..=flush_to).take(slots.len()) {
                    let slot = self.handle(slots, request_id);
                    if uses_buffers {
                        // An empty slot has nothing to detach.
                        let _ = slot.detach_metabuffer();
                    }
                    slot.invalidate();
                }
            }
            state.previous_last_valid = last_valid;
        } else {
            log::debug!("{} sticky metadata unchanged", self.log_prefix);
        }

        self.last_flush.store(flush_to, Ordering::Release);
        Ok(())
    }

    fn handle<'a>(&'a self, slots: &'a [MetadataSlot], request_id: u64) -> SlotHandle<'a> {
        let index = (request_id % slots.len() as u64) as usize;
        SlotHandle::new(self, &slots[index], index)
    }

    /// Add `tags` to the set of tags a result pool expects published early.
    pub fn update_publish_set(&self, tags: &[u32]) -> PoolResult<()> {
        if !self.config.pool_type.is_result() {
            return Err(PoolError::Unsupported(format!(
                "{} has no publish set",
                self.log_prefix
            )));
        }
        let mut set = self.publish_set.write();
        for &tag in tags {
            if self.registry.descriptor(tag).is_some() {
                set.insert(tag);
            } else {
                log::warn!("{} publish set ignores unregistered tag {:#x}", self.log_prefix, tag);
            }
        }
        Ok(())
    }

    /// Tags in the publish set, ascending.
    pub fn publish_set(&self) -> Vec<u32> {
        self.publish_set.read().iter().copied().collect()
    }

    /// How many publish-set tags have been published for `request_id`'s slot.
    pub fn current_early_tag_count(&self, request_id: u64) -> u32 {
        let index = (request_id % self.early_tags.len() as u64) as usize;
        self.early_tags[index].load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Initialization status.
    pub fn status(&self) -> PoolStatus {
        *self.status.lock()
    }

    /// Role of the pool.
    pub fn pool_type(&self) -> PoolType {
        self.config.pool_type
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Pipeline reported to observers.
    pub fn pipeline_id(&self) -> u32 {
        self.config.pipeline_id
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Width of the sticky window.
    pub fn early_tag_count(&self) -> u32 {
        self.config.early_tag_count
    }

    /// `flush_to` of the latest flush.
    pub fn last_flush_request_id(&self) -> u64 {
        self.last_flush.load(Ordering::Acquire)
    }

    /// The configuration the pool was built from.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The tag registry.
    pub fn registry(&self) -> &Arc<dyn TagRegistry> {
        &self.registry
    }

    /// The sticky buffer of a result pool.
    pub fn sticky_metabuffer(&self) -> Option<MetaBufferHandle> {
        self.sticky.clone()
    }

    // -----------------------------------------------------------------------
    // Slot support
    // -----------------------------------------------------------------------

    pub(crate) fn registry_ref(&self) -> &dyn TagRegistry {
        self.registry.as_ref()
    }

    pub(crate) fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    pub(crate) fn sticky(&self) -> Option<&MetaBufferHandle> {
        self.sticky.as_ref()
    }

    /// Whether a result-pool slot bound to `request_id` still answers from
    /// the sticky buffer.
    pub(crate) fn in_sticky_window(&self, request_id: u64) -> bool {
        self.sticky.is_some()
            && request_id
                < self
                    .last_flush
                    .load(Ordering::Acquire)
                    .saturating_add(u64::from(self.config.early_tag_count))
    }

    pub(crate) fn note_published(&self, slot_index: usize, tag: u32) {
        if self.config.pool_type.is_result() && self.publish_set.read().contains(&tag) {
            self.early_tags[slot_index].fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn notify(&self, descriptor: &TagDescriptor, request_id: u64, outcome: Outcome) {
        let notified = self.subscribers.notify(
            descriptor.tag,
            descriptor.index,
            descriptor.is_property(),
            request_id,
            self.config.pipeline_id,
            outcome,
        );
        log::trace!(
            "{} {:?} of {} for request {} reached {} observers",
            self.log_prefix,
            outcome,
            descriptor.name,
            request_id,
            notified
        );
    }
}

impl Drop for MetadataPool {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.get_mut() {
            for slot in slots.iter_mut() {
                slot.release_attached();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::testutil::*;
    use crate::pool::MAX_GLOBAL_SUBSCRIBERS;
    use crate::worker::ThreadWorker;
    use parking_lot::Mutex as PlMutex;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_create_rejects_bad_pairing() {
        init_logging();
        let result = MetadataPool::create(PoolConfig::new(PoolType::Static, 3), registry(), None);
        assert!(matches!(result, Err(PoolError::InvalidArg(_))));
        let result =
            MetadataPool::create(PoolConfig::new(PoolType::PerFrameResult, 1), registry(), None);
        assert!(matches!(result, Err(PoolError::InvalidArg(_))));
    }

    #[test]
    fn test_slot_index_wraps() {
        let pool = pool(PoolType::PerFrameResult, 4);
        assert_eq!(pool.status(), PoolStatus::Initialized);
        for id in 0..20u64 {
            let base = pool.get_slot(id).unwrap().index();
            assert_eq!(base, (id % 4) as usize);
            for k in 1..4u64 {
                assert_eq!(pool.get_slot(id + k * 4).unwrap().index(), base);
            }
        }
    }

    #[test]
    fn test_update_request_id_resets_published() {
        let pool = pool(PoolType::PerFrameInternal, 3);
        pool.update_request_id(1).unwrap();
        let slot = pool.get_slot(1).unwrap();
        slot.set_by_tag(AE_MODE, &[1], 1).unwrap();
        slot.publish(AEC_FRAME).unwrap();
        assert!(slot.is_published(AE_MODE));
        assert!(slot.is_published(AEC_FRAME));

        pool.update_request_id(4).unwrap();
        for tag in [AE_MODE, EXPOSURE, GAINS, AEC_FRAME, STATS] {
            assert!(!slot.is_published(tag));
        }
        assert_eq!(slot.request_id(), 4);
    }

    #[test]
    fn test_publish_notifies_before_returning() {
        let pool = pool_with(
            PoolConfig::new(PoolType::PerFrameInternal, 4)
                .with_name("internal")
                .with_pipeline_id(7),
        );
        let recorder = Recorder::new("x");
        let other = Recorder::new("other");
        pool.subscribe(
            &[Subscription::property(AEC_FRAME)],
            &as_observer(&recorder),
            "x",
        )
        .unwrap();
        pool.subscribe(&[Subscription::metadata(GAINS)], &as_observer(&other), "other")
            .unwrap();

        pool.update_request_id(9).unwrap();
        let slot = pool.get_slot(9).unwrap();
        slot.set_by_tag(AEC_FRAME, &[3u8; 8], 1).unwrap();
        slot.publish(AEC_FRAME).unwrap();

        assert_eq!(recorder.entries(), vec!["x property 0x30000000 9 7"]);
        assert!(other.entries().is_empty());
    }

    #[test]
    fn test_per_tag_then_global_order() {
        let pool = pool(PoolType::PerFrameResult, 4);
        let log = Arc::new(PlMutex::new(Vec::new()));
        let x = Recorder::sharing("x", Arc::clone(&log));
        let y = Recorder::sharing("y", Arc::clone(&log));
        pool.subscribe(&[Subscription::metadata(GAINS)], &as_observer(&x), "x")
            .unwrap();
        pool.subscribe_all(&as_observer(&y), "y").unwrap();

        pool.update_request_id(2).unwrap();
        pool.get_slot(2).unwrap().publish(GAINS).unwrap();

        assert_eq!(
            *log.lock(),
            vec!["x metadata 0x10002 2 0", "y metadata 0x10002 2 0"]
        );
    }

    #[test]
    fn test_observer_in_both_lists_is_locked_reentrantly() {
        let pool = pool(PoolType::PerFrameResult, 4);
        let x = Recorder::new("x");
        let observer = as_observer(&x);
        pool.subscribe(&[Subscription::metadata(AE_MODE)], &observer, "x")
            .unwrap();
        pool.subscribe_all(&observer, "x").unwrap();

        pool.update_request_id(1).unwrap();
        pool.get_slot(1).unwrap().publish(AE_MODE).unwrap();
        assert_eq!(x.entries().len(), 2);
        assert!(!x.gate.is_locked());
    }

    #[test]
    fn test_result_pool_sticky_scenario() {
        let pool = pool_with(
            PoolConfig::new(PoolType::PerFrameResult, 4)
                .with_name("result")
                .with_pipeline_id(3),
        );
        let recorder = Recorder::new("x");
        pool.subscribe(&[Subscription::property(STATS)], &as_observer(&recorder), "x")
            .unwrap();

        pool.update_request_id(5).unwrap();
        let slot = pool.get_slot(5).unwrap();
        assert_eq!(slot.index(), 1);
        let buffer = MetaBuffer::new();
        slot.attach_metabuffer(&buffer).unwrap();
        let value = [0xabu8; 16];
        slot.set_by_tag(STATS, &value, 1).unwrap();
        slot.publish(STATS).unwrap();
        assert_eq!(recorder.entries(), vec!["x property 0x30000001 5 3"]);

        pool.update_request_id(6).unwrap();
        pool.flush(5, 6).unwrap();

        assert!(!pool.get_slot(5).unwrap().read().is_valid());
        assert!(!pool.get_slot(6).unwrap().read().is_valid());
        assert_eq!(pool.last_flush_request_id(), 6);
        assert_eq!(buffer.reference_count(), 0);

        let reread = pool.get_slot(1).unwrap();
        assert_eq!(reread.get_by_tag(STATS).unwrap().as_ref(), &value);
    }

    #[test]
    fn test_flush_idempotent_for_same_last_valid() {
        let pool = pool(PoolType::PerFrameResult, 4);
        pool.update_request_id(1).unwrap();
        let first = MetaBuffer::new();
        pool.get_slot(1).unwrap().attach_metabuffer(&first).unwrap();
        pool.get_slot(1).unwrap().set_by_tag(AE_MODE, &[1], 1).unwrap();
        pool.flush(1, 1).unwrap();
        let sticky = pool.sticky_metabuffer().unwrap();
        assert_eq!(sticky.get_tag(AE_MODE).unwrap().as_ref(), &[1]);

        // A new value lands in slot 1 but the repeated flush leaves both
        // the sticky buffer and the slot alone.
        pool.update_request_id(5).unwrap();
        let second = MetaBuffer::new();
        pool.get_slot(5).unwrap().attach_metabuffer(&second).unwrap();
        pool.get_slot(5).unwrap().set_by_tag(AE_MODE, &[2], 1).unwrap();
        pool.flush(1, 2).unwrap();
        assert_eq!(sticky.get_tag(AE_MODE).unwrap().as_ref(), &[1]);
        assert!(pool.get_slot(5).unwrap().read().is_valid());
        assert_eq!(pool.last_flush_request_id(), 2);

        // A different last-valid id refreshes the snapshot.
        pool.flush(5, 5).unwrap();
        assert_eq!(sticky.get_tag(AE_MODE).unwrap().as_ref(), &[2]);
        assert!(!pool.get_slot(5).unwrap().read().is_valid());
    }

    #[test]
    fn test_flush_rejects_reversed_range() {
        let pool = pool(PoolType::PerFrameInput, 2);
        assert!(matches!(pool.flush(4, 3), Err(PoolError::InvalidArg(_))));
    }

    #[test]
    fn test_flush_input_pool_detaches() {
        let pool = pool(PoolType::PerFrameInput, 4);
        let buffers: Vec<_> = (1..=3u64)
            .map(|id| {
                pool.update_request_id(id).unwrap();
                let buffer = MetaBuffer::new();
                pool.get_slot(id).unwrap().attach_metabuffer(&buffer).unwrap();
                buffer
            })
            .collect();
        pool.flush(1, 3).unwrap();
        for (id, buffer) in (1..=3u64).zip(&buffers) {
            assert_eq!(buffer.reference_count(), 0);
            assert!(pool.get_slot(id).unwrap().get_metabuffer().is_err());
        }
        assert!(pool.sticky_metabuffer().is_none());
    }

    #[test]
    fn test_invalidate_slot() {
        let pool = pool(PoolType::PerFrameInternal, 2);
        pool.update_request_id(3).unwrap();
        pool.get_slot(3).unwrap().publish(AE_MODE).unwrap();
        pool.invalidate(3).unwrap();
        let slot = pool.get_slot(3).unwrap();
        assert_eq!(slot.request_id(), 0);
        assert!(!slot.is_slot_valid());
        assert!(!slot.is_published(AE_MODE));
    }

    #[test]
    fn test_concurrent_readers_see_same_value() {
        let pool = pool(PoolType::PerFrameInternal, 2);
        pool.update_request_id(1).unwrap();
        let value = [7u8; 16];
        pool.get_slot(1).unwrap().set_by_tag(STATS, &value, 1).unwrap();

        // Every reader holds its guard until all have acquired one.
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let slot = pool.get_slot(1).unwrap();
                    let guard = slot.read();
                    barrier.wait();
                    let value = guard.blob_value(STATS).map(<[u8]>::to_vec);
                    value
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), value.to_vec());
        }
    }

    #[test]
    fn test_subscribe_rules() {
        let observer = as_observer(&Recorder::new("x"));
        let input = pool(PoolType::PerFrameInput, 2);
        assert!(matches!(
            input.subscribe(&[Subscription::metadata(AE_MODE)], &observer, "x"),
            Err(PoolError::Unsupported(_))
        ));
        let debug = pool(PoolType::PerFrameDebugData, 2);
        assert!(matches!(
            debug.subscribe(&[Subscription::metadata(AE_MODE)], &observer, "x"),
            Err(PoolError::Unsupported(_))
        ));

        let result = pool(PoolType::PerFrameResult, 2);
        let too_many = vec![Subscription::metadata(AE_MODE); 6];
        assert!(matches!(
            result.subscribe(&too_many, &observer, "x"),
            Err(PoolError::InvalidArg(_))
        ));
        result
            .subscribe(
                &[Subscription::metadata(0xdead), Subscription::metadata(GAINS)],
                &observer,
                "x",
            )
            .unwrap();
        assert_eq!(result.subscriber_count(GAINS), 1);
        assert_eq!(result.subscriber_count(0xdead), 0);
    }

    #[test]
    fn test_subscribe_all_bounded_and_unsubscribe() {
        let pool = pool(PoolType::PerFrameResult, 2);
        let recorders: Vec<_> = (0..MAX_GLOBAL_SUBSCRIBERS)
            .map(|_| Recorder::new("g"))
            .collect();
        for recorder in &recorders {
            pool.subscribe_all(&as_observer(recorder), "g").unwrap();
        }
        let extra = as_observer(&Recorder::new("extra"));
        assert!(matches!(
            pool.subscribe_all(&extra, "extra"),
            Err(PoolError::NoMemory(_))
        ));

        let first = as_observer(&recorders[0]);
        pool.subscribe(&[Subscription::metadata(AE_MODE)], &first, "g")
            .unwrap();
        assert_eq!(pool.unsubscribe_all(&first), 1);
        assert_eq!(pool.subscriber_count(AE_MODE), 1);
        pool.subscribe_all(&extra, "extra").unwrap();
        assert_eq!(pool.unsubscribe(&first), 1);
        assert_eq!(pool.subscriber_count(AE_MODE), 0);
        assert_eq!(pool.global_subscriber_count(), MAX_GLOBAL_SUBSCRIBERS);
    }

    #[test]
    fn test_unsubscribed_observer_gets_no_callbacks() {
        let pool = pool(PoolType::PerFrameResult, 4);
        let log = Arc::new(PlMutex::new(Vec::new()));
        let leaving = Recorder::sharing("leaving", Arc::clone(&log));
        let staying = Recorder::sharing("staying", Arc::clone(&log));
        pool.subscribe_all(&as_observer(&leaving), "leaving").unwrap();
        pool.subscribe_all(&as_observer(&staying), "staying").unwrap();

        pool.update_request_id(1).unwrap();
        pool.get_slot(1).unwrap().publish(AE_MODE).unwrap();
        assert_eq!(pool.unsubscribe_all(&as_observer(&leaving)), 1);

        pool.update_request_id(2).unwrap();
        pool.get_slot(2).unwrap().publish(AE_MODE).unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                "leaving metadata 0x10000 1 0",
                "staying metadata 0x10000 1 0",
                "staying metadata 0x10000 2 0",
            ]
        );
        assert!(!leaving.gate.is_locked());
    }

    #[test]
    fn test_dropped_observer_is_skipped() {
        let pool = pool(PoolType::PerFrameResult, 2);
        {
            let gone = as_observer(&Recorder::new("gone"));
            pool.subscribe(&[Subscription::metadata(AE_MODE)], &gone, "gone")
                .unwrap();
        }
        pool.update_request_id(1).unwrap();
        assert!(pool.get_slot(1).unwrap().publish(AE_MODE).is_ok());
    }

    #[test]
    fn test_publish_set_and_early_counts() {
        let internal = pool(PoolType::PerFrameInternal, 2);
        assert!(matches!(
            internal.update_publish_set(&[AE_MODE]),
            Err(PoolError::Unsupported(_))
        ));

        let pool = pool(PoolType::PerFrameResult, 4);
        pool.update_publish_set(&[AE_MODE, 0xdead]).unwrap();
        pool.update_publish_set(&[EXPOSURE]).unwrap();
        assert_eq!(pool.publish_set(), vec![AE_MODE, EXPOSURE]);

        pool.update_request_id(2).unwrap();
        let slot = pool.get_slot(2).unwrap();
        slot.publish_list(&[AE_MODE, EXPOSURE, GAINS]).unwrap();
        assert_eq!(pool.current_early_tag_count(2), 2);
        assert_eq!(pool.current_early_tag_count(6), 2);

        pool.update_request_id(6).unwrap();
        assert_eq!(pool.current_early_tag_count(6), 0);
    }

    #[test]
    fn test_deferred_creation_on_thread_worker() {
        init_logging();
        let worker = ThreadWorker::new("metapool-test");
        let pool = MetadataPool::create(
            PoolConfig::new(PoolType::PerFrameResult, 8),
            registry(),
            Some(&worker),
        )
        .unwrap();
        pool.wait_for_creation().unwrap();
        assert_eq!(pool.status(), PoolStatus::Initialized);
        assert_eq!(pool.get_slot(9).unwrap().index(), 1);
    }

    #[test]
    fn test_deferred_creation_on_runtime_worker() {
        init_logging();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let worker = crate::worker::RuntimeWorker::new(runtime.handle().clone());
        let pool = MetadataPool::create(
            PoolConfig::new(PoolType::PerFrameInternal, 4),
            registry(),
            Some(&worker),
        )
        .unwrap();
        // get_slot waits for the job.
        assert_eq!(pool.get_slot(6).unwrap().index(), 2);
    }

    struct RefusingWorker;

    impl Worker for RefusingWorker {
        fn post_job(&self, _name: &str, _job: Job) -> PoolResult<()> {
            Err(PoolError::NoMemory("queue full".to_string()))
        }
    }

    #[test]
    fn test_refused_job_falls_back_to_inline_init() {
        init_logging();
        let pool = MetadataPool::create(
            PoolConfig::new(PoolType::PerFrameResult, 2),
            registry(),
            Some(&RefusingWorker),
        )
        .unwrap();
        assert_eq!(pool.status(), PoolStatus::Initialized);
    }

    /// Accepts jobs and never runs them.
    #[derive(Default)]
    struct StalledWorker {
        jobs: PlMutex<Vec<Job>>,
    }

    impl Worker for StalledWorker {
        fn post_job(&self, _name: &str, job: Job) -> PoolResult<()> {
            self.jobs.lock().push(job);
            Ok(())
        }
    }

    #[test]
    fn test_wait_for_creation_times_out() {
        init_logging();
        let worker = StalledWorker::default();
        let pool = MetadataPool::create(
            PoolConfig::new(PoolType::PerFrameResult, 2)
                .with_creation_timeout(Duration::from_millis(20)),
            registry(),
            Some(&worker),
        )
        .unwrap();
        assert!(matches!(pool.get_slot(0), Err(PoolError::Timeout(_))));
        assert_eq!(pool.status(), PoolStatus::Uninitialized);

        // Running the job late still completes creation.
        for job in worker.jobs.lock().drain(..) {
            job();
        }
        assert!(pool.get_slot(0).is_ok());
    }

    #[test]
    fn test_initialization_failure() {
        init_logging();
        let config = PoolConfig::new(PoolType::PerFrameInternal, 2).with_max_blob_bytes(8);
        let result = MetadataPool::create(config.clone(), registry(), None);
        assert!(matches!(result, Err(PoolError::NoMemory(_))));

        let worker = ThreadWorker::new("metapool-test");
        let pool = MetadataPool::create(config, registry(), Some(&worker)).unwrap();
        assert!(matches!(pool.get_slot(0), Err(PoolError::InvalidState(_))));
        assert_eq!(pool.status(), PoolStatus::Error);
    }

    #[test]
    fn test_drop_releases_attached_buffers() {
        let buffer = MetaBuffer::new();
        {
            let pool = pool(PoolType::PerFrameInput, 2);
            pool.update_request_id(1).unwrap();
            pool.get_slot(1).unwrap().attach_metabuffer(&buffer).unwrap();
            assert_eq!(buffer.reference_count(), 1);
        }
        assert_eq!(buffer.reference_count(), 0);
    }
}
