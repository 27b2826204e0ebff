//! Reference-counted dynamic tag→value container.
//!
//! A [`MetaBuffer`] is shared through [`MetaBufferHandle`] (`Arc`). On top of
//! the `Arc` strong count it keeps explicit *client* references: a slot that
//! borrows a buffer registers itself with [`MetaBuffer::add_reference`] and
//! must release the same client id when it lets go. An invalidation requested
//! while clients still hold the buffer is deferred until the last one
//! releases it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::error::{PoolError, PoolResult};

/// Shared handle to a [`MetaBuffer`].
pub type MetaBufferHandle = Arc<MetaBuffer>;

static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// One stored tag value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    /// Payload bytes (`count` elements).
    pub data: Bytes,
    /// Number of elements in `data`.
    pub count: u32,
    /// Camera the value belongs to, for multi-camera buffers.
    pub camera_id: Option<u32>,
}

#[derive(Debug, Default)]
struct Contents {
    entries: HashMap<u32, TagEntry>,
    cameras: HashMap<u32, MetaBufferHandle>,
    /// Buffers merged into this one; each holds a merge reference from us.
    links: Vec<Weak<MetaBuffer>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientRef {
    Client(u32),
    Buffer(u64),
}

#[derive(Debug, Default)]
struct References {
    internal: u32,
    external: u32,
    merge: u32,
    clients: Vec<ClientRef>,
    invalidate_pending: bool,
}

impl References {
    fn total(&self) -> u32 {
        self.internal + self.external + self.merge
    }

    fn forget(&mut self, client: ClientRef) -> bool {
        match self.clients.iter().position(|c| *c == client) {
            Some(position) => {
                self.clients.swap_remove(position);
                true
            }
            None => false,
        }
    }
}

/// Dynamic, lock-protected tag→value container.
#[derive(Debug)]
pub struct MetaBuffer {
    id: u64,
    contents: RwLock<Contents>,
    references: Mutex<References>,
}

impl MetaBuffer {
    /// Create an empty buffer.
    pub fn new() -> MetaBufferHandle {
        Arc::new(Self {
            id: BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            contents: RwLock::new(Contents::default()),
            references: Mutex::new(References::default()),
        })
    }

    /// Process-unique buffer id.
    pub fn id(&self) -> u64 {
        self.id
    }

    // -----------------------------------------------------------------------
    // Tag access
    // -----------------------------------------------------------------------

    /// Store `count` elements for `tag`, replacing any previous value.
    pub fn set_tag(&self, tag: u32, data: Bytes, count: u32) -> PoolResult<()> {
        self.insert(tag, data, count, None)
    }

    /// Store a value that belongs to one camera of a multi-camera buffer.
    pub fn set_tag_for_camera(
        &self,
        tag: u32,
        data: Bytes,
        count: u32,
        camera_id: u32,
    ) -> PoolResult<()> {
        self.insert(tag, data, count, Some(camera_id))
    }

    fn insert(&self, tag: u32, data: Bytes, count: u32, camera_id: Option<u32>) -> PoolResult<()> {
        if count == 0 || data.is_empty() {
            return Err(PoolError::InvalidArg(format!(
                "empty payload for tag {:#x} in buffer {}",
                tag, self.id
            )));
        }
        self.contents.write().entries.insert(
            tag,
            TagEntry {
                data,
                count,
                camera_id,
            },
        );
        Ok(())
    }

    /// Payload for `tag`.
    pub fn get_tag(&self, tag: u32) -> Option<Bytes> {
        self.contents.read().entries.get(&tag).map(|e| e.data.clone())
    }

    /// Full entry for `tag`, including its element count.
    pub fn entry(&self, tag: u32) -> Option<TagEntry> {
        self.contents.read().entries.get(&tag).cloned()
    }

    /// Element count stored for `tag`, 0 when absent.
    pub fn tag_count(&self, tag: u32) -> u32 {
        self.contents.read().entries.get(&tag).map_or(0, |e| e.count)
    }

    /// Payload for `tag` as seen by `camera_id`.
    ///
    /// Values not bound to a camera are shared by every camera. Values bound
    /// to a camera, or missing here, are resolved through the sub-buffer
    /// registered for `camera_id` with [`attach_camera`](Self::attach_camera).
    pub fn get_tag_by_camera_id(&self, tag: u32, camera_id: u32) -> Option<Bytes> {
        let camera_buffer = {
            let contents = self.contents.read();
            if let Some(entry) = contents.entries.get(&tag) {
                match entry.camera_id {
                    None => return Some(entry.data.clone()),
                    Some(owner) if owner == camera_id => return Some(entry.data.clone()),
                    Some(_) => {}
                }
            }
            contents.cameras.get(&camera_id).cloned()
        };
        camera_buffer.and_then(|buffer| buffer.get_tag(tag))
    }

    /// Register the sub-buffer holding `camera_id`'s own values.
    pub fn attach_camera(&self, camera_id: u32, buffer: MetaBufferHandle) -> PoolResult<()> {
        if buffer.id == self.id {
            return Err(PoolError::InvalidArg(format!(
                "buffer {} cannot be its own camera {} buffer",
                self.id, camera_id
            )));
        }
        self.contents.write().cameras.insert(camera_id, buffer);
        Ok(())
    }

    /// Remove the value stored for `tag`.
    pub fn remove_tag(&self, tag: u32) -> PoolResult<()> {
        match self.contents.write().entries.remove(&tag) {
            Some(_) => Ok(()),
            None => Err(PoolError::NoSuch(format!(
                "tag {:#x} not in buffer {}",
                tag, self.id
            ))),
        }
    }

    /// Number of stored tags.
    pub fn count(&self) -> usize {
        self.contents.read().entries.len()
    }

    /// Stored tags in ascending order.
    pub fn tags(&self) -> Vec<u32> {
        let mut tags: Vec<u32> = self.contents.read().entries.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    // -----------------------------------------------------------------------
    // Bulk operations
    // -----------------------------------------------------------------------

    /// Copy every entry of `source` into this buffer.
    ///
    /// With `disjoint`, tags already present here keep their value.
    pub fn copy_from(&self, source: &MetaBuffer, disjoint: bool) -> PoolResult<()> {
        if source.id == self.id {
            return Err(PoolError::InvalidArg(format!(
                "buffer {} cannot copy from itself",
                self.id
            )));
        }
        let (entries, cameras) = {
            let src = source.contents.read();
            (src.entries.clone(), src.cameras.clone())
        };
        let mut contents = self.contents.write();
        for (tag, entry) in entries {
            if disjoint && contents.entries.contains_key(&tag) {
                continue;
            }
            contents.entries.insert(tag, entry);
        }
        for (camera_id, buffer) in cameras {
            contents.cameras.entry(camera_id).or_insert(buffer);
        }
        Ok(())
    }

    /// Overlay `source` onto this buffer and record it as a dependency.
    ///
    /// The source gains a merge reference that is released when this buffer
    /// is reset. The link is weak, so buffers merged into each other can
    /// still be dropped.
    pub fn merge(&self, source: &MetaBufferHandle) -> PoolResult<()> {
        self.copy_from(source, false)?;
        source.add_merge_reference(self.id);
        self.contents.write().links.push(Arc::downgrade(source));
        Ok(())
    }

    /// Drop every value.
    ///
    /// Resets immediately when `force` is set or nobody references the
    /// buffer; otherwise the reset is deferred until the last reference is
    /// released. Returns whether the buffer was reset now.
    pub fn invalidate(&self, force: bool) -> bool {
        let mut references = self.references.lock();
        if force || references.total() == 0 {
            references.invalidate_pending = false;
            drop(references);
            self.reset();
            true
        } else {
            references.invalidate_pending = true;
            log::debug!(
                "[MetaBuffer {}] invalidate pending, {} references outstanding",
                self.id,
                references.total()
            );
            false
        }
    }

    fn reset(&self) {
        // Camera buffers are dropped outside the lock; their drop may reach back here.
        let (_cameras, links) = {
            let mut contents = self.contents.write();
            contents.entries.clear();
            (
                std::mem::take(&mut contents.cameras),
                std::mem::take(&mut contents.links),
            )
        };
        for link in links.iter().filter_map(Weak::upgrade) {
            link.release_merge_reference(self.id);
        }
    }

    // -----------------------------------------------------------------------
    // Reference counting
    // -----------------------------------------------------------------------

    /// Register a client reference. Returns the total reference count.
    pub fn add_reference(&self, client_id: u32, external: bool) -> u32 {
        let mut references = self.references.lock();
        if external {
            references.external += 1;
        } else {
            references.internal += 1;
        }
        references.clients.push(ClientRef::Client(client_id));
        references.total()
    }

    /// Release a client reference. Returns the remaining total.
    pub fn release_reference(&self, client_id: u32, external: bool) -> u32 {
        let mut references = self.references.lock();
        let counter = if external {
            &mut references.external
        } else {
            &mut references.internal
        };
        if *counter == 0 {
            log::warn!(
                "[MetaBuffer {}] release of client {:#x} without a matching reference",
                self.id,
                client_id
            );
            return references.total();
        }
        *counter -= 1;
        if !references.forget(ClientRef::Client(client_id)) {
            log::warn!("[MetaBuffer {}] unknown client {:#x}", self.id, client_id);
        }
        self.finish_release(references)
    }

    fn add_merge_reference(&self, buffer_id: u64) {
        let mut references = self.references.lock();
        references.merge += 1;
        references.clients.push(ClientRef::Buffer(buffer_id));
    }

    fn release_merge_reference(&self, buffer_id: u64) {
        let mut references = self.references.lock();
        if references.merge == 0 {
            log::warn!(
                "[MetaBuffer {}] merge release from buffer {} without a reference",
                self.id,
                buffer_id
            );
            return;
        }
        references.merge -= 1;
        references.forget(ClientRef::Buffer(buffer_id));
        self.finish_release(references);
    }

    fn finish_release(&self, mut references: parking_lot::MutexGuard<'_, References>) -> u32 {
        let total = references.total();
        if total == 0 && references.invalidate_pending {
            references.invalidate_pending = false;
            drop(references);
            self.reset();
        }
        total
    }

    /// Drop external references, or every reference with `include_internal`.
    pub fn release_all_references(&self, include_internal: bool) {
        let mut references = self.references.lock();
        references.external = 0;
        if include_internal {
            references.internal = 0;
            references.merge = 0;
            references.clients.clear();
            references.invalidate_pending = false;
            drop(references);
            self.reset();
            return;
        }
        // Client ids carrying a usage flag belong to internal users.
        references.clients.retain(|client| match *client {
            ClientRef::Buffer(_) => true,
            ClientRef::Client(id) => id & CLIENT_USAGE_MASK != 0,
        });
        self.finish_release(references);
    }

    /// Total of internal, external and merge references.
    pub fn reference_count(&self) -> u32 {
        self.references.lock().total()
    }
}

impl Drop for MetaBuffer {
    fn drop(&mut self) {
        for link in self.contents.get_mut().links.drain(..) {
            if let Some(source) = link.upgrade() {
                source.release_merge_reference(self.id);
            }
        }
    }
}

/// Bits of a client id that identify an internal user of the buffer.
pub const CLIENT_USAGE_MASK: u32 = 0xD000_0000;
