//! One request's worth of tagged values inside a pool.
//!
//! A [`MetadataSlot`] is owned by its pool and never reallocated; callers reach
//! it through a [`SlotHandle`], which pairs the slot with the pool so that
//! reads can fall back to the sticky buffer and publishes can reach the
//! subscribers.
//!
//! Locking: every slot has its own read-write lock. `set_by_tag`,
//! attach/detach, `invalidate` and `set_slot_request_id` take it for writing;
//! reads take it shared and recursively, so a thread already holding a
//! [`SlotReadGuard`] may call the getters even while a writer is queued.
//! Observer callbacks never run while a slot lock is held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::buffer::{MetaBuffer, MetaBufferHandle};
use crate::config::{InputZeroFill, MAX_INPLACE_TAG_SIZE};
use crate::error::{PoolError, PoolResult};
use crate::pool::blob::{BlobLayout, PropertyBlob};
use crate::pool::metadata_pool::MetadataPool;
use crate::pool::subscribers::Outcome;
use crate::pool::types::{PoolType, StorageMode};
use crate::tags::{TagDescriptor, TagRegistry};

/// Usage flag carried by the client id a slot registers on an attached buffer.
pub const SLOT_CLIENT_FLAG: u32 = 1 << 30;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum SlotStorage {
    Blob(PropertyBlob),
    Buffer(Option<MetaBufferHandle>),
}

#[derive(Debug)]
pub(crate) struct SlotState {
    request_id: u64,
    valid: bool,
    storage: SlotStorage,
    /// Client id registered on the attached buffer.
    client_id: Option<u32>,
}

impl SlotState {
    fn buffer(&self) -> Option<&MetaBufferHandle> {
        match &self.storage {
            SlotStorage::Buffer(buffer) => buffer.as_ref(),
            SlotStorage::Blob(_) => None,
        }
    }

    fn blob(&self) -> Option<&PropertyBlob> {
        match &self.storage {
            SlotStorage::Blob(blob) => Some(blob),
            SlotStorage::Buffer(_) => None,
        }
    }

    fn blob_value<'s>(&'s self, registry: &dyn TagRegistry, tag: u32) -> Option<&'s [u8]> {
        let index = registry.descriptor(tag)?.index;
        self.blob()?.read(index)
    }

    fn stored_count(&self, registry: &dyn TagRegistry, tag: u32) -> u32 {
        match &self.storage {
            SlotStorage::Blob(blob) => registry
                .descriptor(tag)
                .map_or(0, |descriptor| blob.count(descriptor.index)),
            SlotStorage::Buffer(buffer) => buffer.as_ref().map_or(0, |b| b.tag_count(tag)),
        }
    }
}

/// Storage and state for one slot of a pool.
#[derive(Debug)]
pub(crate) struct MetadataSlot {
    state: RwLock<SlotState>,
    published: Box<[AtomicBool]>,
}

impl MetadataSlot {
    pub(crate) fn new(
        pool_type: PoolType,
        max_tag_count: usize,
        layout: Option<&Arc<BlobLayout>>,
    ) -> PoolResult<Self> {
        let storage = match (pool_type.storage_mode(), layout) {
            (StorageMode::Blob, Some(layout)) => {
                SlotStorage::Blob(PropertyBlob::new(Arc::clone(layout)))
            }
            (StorageMode::Blob, None) => {
                return Err(PoolError::InvalidState(format!(
                    "{} slot needs a blob layout",
                    pool_type
                )))
            }
            // Per-usecase slots own their buffer for the pool's lifetime.
            (StorageMode::Buffer, _) if pool_type == PoolType::PerUsecase => {
                SlotStorage::Buffer(Some(MetaBuffer::new()))
            }
            (StorageMode::Buffer, _) => SlotStorage::Buffer(None),
        };
        Ok(Self {
            state: RwLock::new(SlotState {
                request_id: 0,
                valid: pool_type.is_single_slot(),
                storage,
                client_id: None,
            }),
            published: (0..max_tag_count).map(|_| AtomicBool::new(false)).collect(),
        })
    }

    fn reset_published(&self) {
        for bit in self.published.iter() {
            bit.store(false, Ordering::Release);
        }
    }

    fn mark_published(&self, index: u32) {
        if let Some(bit) = self.published.get(index as usize) {
            bit.store(true, Ordering::Release);
        }
    }

    fn published_bit(&self, index: u32) -> bool {
        self.published
            .get(index as usize)
            .is_some_and(|bit| bit.load(Ordering::Acquire))
    }

    /// Release the reference held on an attached buffer. Used when the pool
    /// is torn down.
    pub(crate) fn release_attached(&mut self) {
        let state = self.state.get_mut();
        if let (SlotStorage::Buffer(Some(buffer)), Some(client_id)) =
            (&state.storage, state.client_id.take())
        {
            buffer.release_reference(client_id, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Shared lock on a slot.
///
/// Blob values borrowed through [`blob_value`](Self::blob_value) stay valid for
/// the guard's lifetime; no writer can touch the slot meanwhile.
pub struct SlotReadGuard<'a> {
    registry: &'a dyn TagRegistry,
    state: RwLockReadGuard<'a, SlotState>,
}

impl SlotReadGuard<'_> {
    /// Request id the slot is bound to.
    pub fn request_id(&self) -> u64 {
        self.state.request_id
    }

    /// Raw valid flag, without the sticky window.
    pub fn is_valid(&self) -> bool {
        self.state.valid
    }

    /// Zero-copy view of a blob-mode value.
    pub fn blob_value(&self, tag: u32) -> Option<&[u8]> {
        self.state.blob_value(self.registry, tag)
    }

    /// Element count stored for `tag`.
    pub fn count(&self, tag: u32) -> u32 {
        self.state.stored_count(self.registry, tag)
    }

    /// Attached buffer, if any.
    pub fn metabuffer(&self) -> Option<&MetaBufferHandle> {
        self.state.buffer()
    }
}

/// Exclusive lock on a slot.
pub struct SlotWriteGuard<'a> {
    registry: &'a dyn TagRegistry,
    state: RwLockWriteGuard<'a, SlotState>,
}

impl SlotWriteGuard<'_> {
    /// Request id the slot is bound to.
    pub fn request_id(&self) -> u64 {
        self.state.request_id
    }

    /// Raw valid flag, without the sticky window.
    pub fn is_valid(&self) -> bool {
        self.state.valid
    }

    /// Zero-copy view of a blob-mode value.
    pub fn blob_value(&self, tag: u32) -> Option<&[u8]> {
        self.state.blob_value(self.registry, tag)
    }

    /// Element count stored for `tag`.
    pub fn count(&self, tag: u32) -> u32 {
        self.state.stored_count(self.registry, tag)
    }
}

// ---------------------------------------------------------------------------
// SlotHandle
// ---------------------------------------------------------------------------

/// A slot together with the pool it belongs to.
#[derive(Clone, Copy)]
pub struct SlotHandle<'a> {
    pool: &'a MetadataPool,
    slot: &'a MetadataSlot,
    index: usize,
}

impl<'a> SlotHandle<'a> {
    pub(crate) fn new(pool: &'a MetadataPool, slot: &'a MetadataSlot, index: usize) -> Self {
        Self { pool, slot, index }
    }

    /// Position of the slot in the pool's window.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Request id the slot is currently bound to.
    pub fn request_id(&self) -> u64 {
        self.slot.state.read_recursive().request_id
    }

    /// Take the slot's lock shared.
    pub fn read(&self) -> SlotReadGuard<'a> {
        SlotReadGuard {
            registry: self.pool.registry_ref(),
            state: self.slot.state.read_recursive(),
        }
    }

    /// Take the slot's lock exclusively.
    pub fn write(&self) -> SlotWriteGuard<'a> {
        SlotWriteGuard {
            registry: self.pool.registry_ref(),
            state: self.slot.state.write(),
        }
    }

    /// Whether reads may be served, including the sticky window of result
    /// pools.
    pub fn is_slot_valid(&self) -> bool {
        let state = self.slot.state.read_recursive();
        self.valid_with(&state)
    }

    fn valid_with(&self, state: &SlotState) -> bool {
        self.pool.in_sticky_window(state.request_id) || state.valid
    }

    fn pool_type(&self) -> PoolType {
        self.pool.pool_type()
    }

    fn prefix(&self) -> &str {
        self.pool.log_prefix()
    }

    fn resolve(&self, tag: u32) -> Option<&'a TagDescriptor> {
        self.pool.registry_ref().descriptor(tag)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Current value of `tag`.
    ///
    /// Buffer-mode slots read the attached buffer and, inside a result pool's
    /// sticky window, fall back to the sticky buffer. Blob-mode reads copy
    /// out of the blob; use [`read`](Self::read) for a zero-copy view.
    pub fn get_by_tag(&self, tag: u32) -> Option<Bytes> {
        let state = self.slot.state.read_recursive();
        if let Some(blob) = state.blob() {
            let descriptor = self.resolve(tag)?;
            return blob.read(descriptor.index).map(Bytes::copy_from_slice);
        }

        let Some(descriptor) = self.resolve(tag) else {
            log::debug!("{} get of unregistered tag {:#x}", self.prefix(), tag);
            return None;
        };
        if !self.valid_with(&state) {
            log::trace!(
                "{} invalid slot {} for tag {:#x} request {}",
                self.prefix(),
                self.index,
                tag,
                state.request_id
            );
            return None;
        }
        let attached = state.buffer();
        if let Some(value) = attached.and_then(|buffer| buffer.get_tag(tag)) {
            return Some(value);
        }
        if self.pool.in_sticky_window(state.request_id) {
            return self.pool.sticky().and_then(|sticky| sticky.get_tag(tag));
        }
        match attached {
            Some(buffer) if self.pool_type() == PoolType::PerFrameInput => {
                self.zero_fill(buffer, descriptor)
            }
            _ => None,
        }
    }

    fn zero_fill(&self, buffer: &MetaBuffer, descriptor: &TagDescriptor) -> Option<Bytes> {
        let fill = match self.pool.config().zero_fill_input {
            InputZeroFill::Off => false,
            InputZeroFill::Small => {
                descriptor.size() <= MAX_INPLACE_TAG_SIZE || descriptor.is_property()
            }
            InputZeroFill::All => true,
        };
        if !fill {
            return None;
        }
        log::debug!(
            "{} zero-filling missing input tag {:#x} ({})",
            self.prefix(),
            descriptor.tag,
            descriptor.name
        );
        let zeros = Bytes::from(vec![0u8; descriptor.size()]);
        buffer
            .set_tag(descriptor.tag, zeros.clone(), descriptor.count)
            .ok()
            .map(|_| zeros)
    }

    /// Value of `tag` as seen by one camera of a multi-camera buffer.
    ///
    /// Only input and result pools hold per-camera values.
    pub fn get_by_camera_id(&self, tag: u32, camera_id: u32) -> Option<Bytes> {
        if !matches!(
            self.pool_type(),
            PoolType::PerFrameInput | PoolType::PerFrameResult
        ) {
            log::debug!(
                "{} camera lookup unsupported for tag {:#x}",
                self.prefix(),
                tag
            );
            return None;
        }
        let state = self.slot.state.read_recursive();
        if !self.valid_with(&state) {
            return None;
        }
        if let Some(value) = state
            .buffer()
            .and_then(|buffer| buffer.get_tag_by_camera_id(tag, camera_id))
        {
            return Some(value);
        }
        if self.pool.in_sticky_window(state.request_id) {
            return self
                .pool
                .sticky()
                .and_then(|sticky| sticky.get_tag_by_camera_id(tag, camera_id));
        }
        None
    }

    /// Element count currently stored for `tag`, 0 when absent.
    pub fn get_count_by_tag(&self, tag: u32) -> u32 {
        let state = self.slot.state.read_recursive();
        if !state.valid {
            log::debug!(
                "{} count of tag {:#x} on invalid slot {}",
                self.prefix(),
                tag,
                self.index
            );
            return 0;
        }
        let Some(descriptor) = self.resolve(tag) else {
            return 0;
        };
        match &state.storage {
            SlotStorage::Blob(blob) => blob.count(descriptor.index),
            SlotStorage::Buffer(buffer) => {
                let visible = self.pool_type() == PoolType::PerFrameInput
                    || self.slot.published_bit(descriptor.index);
                match buffer {
                    Some(buffer) if visible => buffer.tag_count(tag),
                    _ => 0,
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Store `count` elements of `tag` from `data` and mark the tag
    /// published.
    ///
    /// Properties are stored as their full registered size. A count equal to
    /// the tag's byte size that would overflow it is read as one element.
    pub fn set_by_tag(&self, tag: u32, data: &[u8], count: u32) -> PoolResult<()> {
        if self.pool_type() == PoolType::PerFrameInput {
            log::error!("{} set of tag {:#x} on input pool", self.prefix(), tag);
            return Err(PoolError::Unsupported(format!(
                "{} input pools are read-only",
                self.prefix()
            )));
        }
        if data.is_empty() || count == 0 {
            log::error!(
                "{} empty set of tag {:#x} ({} bytes, count {})",
                self.prefix(),
                tag,
                data.len(),
                count
            );
            return Err(PoolError::InvalidArg(format!(
                "empty payload for tag {:#x}",
                tag
            )));
        }
        let Some(descriptor) = self.resolve(tag) else {
            log::error!("{} set of unregistered tag {:#x}", self.prefix(), tag);
            return Err(PoolError::NoSuch(format!("tag {:#x} not registered", tag)));
        };

        let max_size = descriptor.size();
        let (unit_size, mut count) = if descriptor.is_property() {
            (1, max_size as u32)
        } else {
            (descriptor.element_type.unit_size(), count)
        };
        if unit_size * count as usize > max_size && count as usize == max_size {
            log::debug!(
                "{} count {} for tag {:#x} is its byte size, storing one element",
                self.prefix(),
                count,
                tag
            );
            count = 1;
        }
        let needed = unit_size * count as usize;
        if needed > max_size {
            log::error!(
                "{} tag {:#x} ({}) needs {} bytes, max {}",
                self.prefix(),
                tag,
                descriptor.name,
                needed,
                max_size
            );
            return Err(PoolError::InvalidArg(format!(
                "tag {:#x} payload of {} bytes exceeds {}",
                tag, needed, max_size
            )));
        }
        if data.len() < needed {
            log::error!(
                "{} tag {:#x} given {} bytes for {} elements ({} bytes)",
                self.prefix(),
                tag,
                data.len(),
                count,
                needed
            );
            return Err(PoolError::InvalidArg(format!(
                "tag {:#x} given {} of {} bytes",
                tag,
                data.len(),
                needed
            )));
        }
        let payload = &data[..needed];

        let mut state = self.slot.state.write();
        if !self.valid_with(&state) {
            log::error!(
                "{} set of tag {:#x} on invalid slot {} request {}",
                self.prefix(),
                tag,
                self.index,
                state.request_id
            );
            return Err(PoolError::InvalidState(format!(
                "slot {} is not valid",
                self.index
            )));
        }
        match &mut state.storage {
            SlotStorage::Blob(blob) => blob.write(descriptor.index, payload, count)?,
            SlotStorage::Buffer(Some(buffer)) => {
                buffer.set_tag(tag, Bytes::copy_from_slice(payload), count)?;
            }
            SlotStorage::Buffer(None) => {
                log::error!(
                    "{} set of tag {:#x} on slot {} with no metabuffer",
                    self.prefix(),
                    tag,
                    self.index
                );
                return Err(PoolError::InvalidState(format!(
                    "slot {} has no metabuffer attached",
                    self.index
                )));
            }
        }
        self.slot.mark_published(descriptor.index);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    /// Mark `tag` published and notify its subscribers before returning.
    pub fn publish(&self, tag: u32) -> PoolResult<()> {
        self.fan_out(tag, Outcome::Update)
    }

    /// Publish every tag in `tags`. All are attempted; the last failure is
    /// returned.
    pub fn publish_list(&self, tags: &[u32]) -> PoolResult<()> {
        if tags.is_empty() {
            return Err(PoolError::InvalidArg("empty publish list".to_string()));
        }
        let mut last = Ok(());
        for &tag in tags {
            if let Err(e) = self.publish(tag) {
                last = Err(e);
            }
        }
        last
    }

    /// Tell subscribers `tag` will not be produced for this request.
    pub fn publish_failure(&self, tag: u32) -> PoolResult<()> {
        self.fan_out(tag, Outcome::Failure)
    }

    fn fan_out(&self, tag: u32, outcome: Outcome) -> PoolResult<()> {
        if self.pool_type() == PoolType::PerFrameInput {
            return Err(PoolError::Unsupported(format!(
                "{} input pools do not publish",
                self.prefix()
            )));
        }
        let Some(descriptor) = self.resolve(tag) else {
            log::error!("{} publish of unregistered tag {:#x}", self.prefix(), tag);
            return Err(PoolError::NoSuch(format!("tag {:#x} not registered", tag)));
        };
        let request_id = self.slot.state.read_recursive().request_id;
        if outcome == Outcome::Update {
            self.slot.mark_published(descriptor.index);
            self.pool.note_published(self.index, tag);
        }
        self.pool.notify(descriptor, request_id, outcome);
        Ok(())
    }

    /// Whether `tag` has been published for the current request.
    ///
    /// Input pools report every tag as published.
    pub fn is_published(&self, tag: u32) -> bool {
        if self.pool_type() == PoolType::PerFrameInput {
            return true;
        }
        self.resolve(tag)
            .is_some_and(|descriptor| self.slot.published_bit(descriptor.index))
    }

    /// Published bit by dense tag index.
    pub fn is_metadata_published_by_tag_index(&self, index: u32) -> bool {
        if self.pool_type() == PoolType::PerFrameInput {
            return true;
        }
        self.slot.published_bit(index)
    }

    // -----------------------------------------------------------------------
    // Buffer transfer
    // -----------------------------------------------------------------------

    /// Borrow `buffer` for this slot, registering a client reference.
    pub fn attach_metabuffer(&self, buffer: &MetaBufferHandle) -> PoolResult<()> {
        let mut guard = self.slot.state.write();
        let state = &mut *guard;
        let client_id = SLOT_CLIENT_FLAG | self.client_request_bits(state.request_id);
        match &mut state.storage {
            SlotStorage::Blob(_) => Err(PoolError::InvalidState(format!(
                "{} blob slots do not hold metabuffers",
                self.prefix()
            ))),
            SlotStorage::Buffer(Some(existing)) => Err(PoolError::InvalidState(format!(
                "slot {} already holds buffer {}",
                self.index,
                existing.id()
            ))),
            SlotStorage::Buffer(slot_buffer) => {
                buffer.add_reference(client_id, false);
                *slot_buffer = Some(Arc::clone(buffer));
                state.client_id = Some(client_id);
                Ok(())
            }
        }
    }

    /// Low 30 bits of `request_id`, the part a client id can carry. Longer
    /// ids wrap, so two slots far apart may share a client id on one buffer.
    fn client_request_bits(&self, request_id: u64) -> u32 {
        let bits = (request_id & u64::from(SLOT_CLIENT_FLAG - 1)) as u32;
        if u64::from(bits) != request_id {
            log::warn!(
                "{} request {} wraps to {:#x} in the slot client id",
                self.prefix(),
                request_id,
                bits
            );
        }
        bits
    }

    /// The attached buffer.
    pub fn get_metabuffer(&self) -> PoolResult<MetaBufferHandle> {
        self.slot
            .state
            .read_recursive()
            .buffer()
            .cloned()
            .ok_or_else(|| PoolError::NoSuch(format!("slot {} has no metabuffer", self.index)))
    }

    /// Release the attached buffer and hand it back.
    pub fn detach_metabuffer(&self) -> PoolResult<MetaBufferHandle> {
        let mut state = self.slot.state.write();
        let client_id = state.client_id.take();
        let buffer = match &mut state.storage {
            SlotStorage::Buffer(buffer) => buffer.take(),
            SlotStorage::Blob(_) => None,
        };
        match buffer {
            Some(buffer) => {
                if let Some(client_id) = client_id {
                    buffer.release_reference(client_id, false);
                }
                Ok(buffer)
            }
            None => {
                log::trace!("{} slot {} already detached", self.prefix(), self.index);
                Err(PoolError::NoSuch(format!(
                    "slot {} has no metabuffer",
                    self.index
                )))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Clear the slot's identity and published bits. Storage is kept.
    pub fn invalidate(&self) {
        let mut state = self.slot.state.write();
        state.request_id = 0;
        state.valid = false;
        self.slot.reset_published();
    }

    /// Bind the slot to `request_id` and clear its published bits.
    pub fn set_slot_request_id(&self, request_id: u64) -> PoolResult<()> {
        if self.pool_type().is_single_slot() {
            return Err(PoolError::Unsupported(format!(
                "{} slot identity is fixed",
                self.prefix()
            )));
        }
        if request_id == 0 {
            return Err(PoolError::InvalidArg(
                "request id 0 is reserved for invalid slots".to_string(),
            ));
        }
        let mut state = self.slot.state.write();
        state.request_id = request_id;
        state.valid = true;
        self.slot.reset_published();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Blob maintenance
    // -----------------------------------------------------------------------

    /// Copy every stored value of `source`'s blob into this slot's blob.
    pub fn merge_blob(&self, source: &SlotHandle<'_>) -> PoolResult<()> {
        if std::ptr::eq(self.slot, source.slot) {
            return Err(PoolError::InvalidArg(
                "cannot merge a slot into itself".to_string(),
            ));
        }
        let snapshot = match source.slot.state.read_recursive().blob() {
            Some(blob) => blob.clone(),
            None => {
                return Err(PoolError::InvalidState(format!(
                    "{} merge source is not a blob slot",
                    source.prefix()
                )))
            }
        };
        match &mut self.slot.state.write().storage {
            SlotStorage::Blob(blob) => blob.merge_from(&snapshot),
            SlotStorage::Buffer(_) => Err(PoolError::InvalidState(format!(
                "{} merge target is not a blob slot",
                self.prefix()
            ))),
        }
    }

    /// Drop every stored blob value.
    pub fn reset_blob(&self) -> PoolResult<()> {
        match &mut self.slot.state.write().storage {
            SlotStorage::Blob(blob) => {
                blob.reset();
                Ok(())
            }
            SlotStorage::Buffer(_) => Err(PoolError::InvalidState(format!(
                "{} slot {} has no blob",
                self.prefix(),
                self.index
            ))),
        }
    }

    /// Log every stored value at debug level.
    pub fn dump(&self) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        let state = self.slot.state.read_recursive();
        log::debug!(
            "{} slot {} request {} valid {}",
            self.prefix(),
            self.index,
            state.request_id,
            state.valid
        );
        let registry = self.pool.registry_ref();
        match &state.storage {
            SlotStorage::Blob(blob) => {
                for index in blob.stored_indexes() {
                    let name = registry
                        .descriptor_by_index(index)
                        .map_or("?", |d| d.name.as_str());
                    log::debug!(
                        "{}   {} count {} bytes {:02x?}",
                        self.prefix(),
                        name,
                        blob.count(index),
                        blob.read(index).unwrap_or_default()
                    );
                }
            }
            SlotStorage::Buffer(Some(buffer)) => {
                for tag in buffer.tags() {
                    let name = registry.descriptor(tag).map_or("?", |d| d.name.as_str());
                    log::debug!(
                        "{}   {} ({:#x}) count {}",
                        self.prefix(),
                        name,
                        tag,
                        buffer.tag_count(tag)
                    );
                }
            }
            SlotStorage::Buffer(None) => {
                log::debug!("{}   no metabuffer attached", self.prefix());
            }
        }
    }
}
