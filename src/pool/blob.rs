//! Fixed-layout property blob used by blob-mode slots.
//!
//! Every tag in the registry gets a fixed `(offset, size)` window inside one
//! allocation. The layout is computed once per pool and shared by all of its
//! slots; each slot owns its own bytes.

use std::sync::Arc;

use crate::error::{PoolError, PoolResult};
use crate::tags::TagRegistry;

const BLOB_ALIGNMENT: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Window {
    offset: usize,
    size: usize,
}

/// Per-tag-index windows into a blob allocation.
#[derive(Debug)]
pub struct BlobLayout {
    windows: Vec<Window>,
    total: usize,
}

impl BlobLayout {
    /// Lay out every registered tag, failing if the blob would exceed
    /// `max_bytes`.
    pub fn new(registry: &dyn TagRegistry, max_bytes: usize) -> PoolResult<Arc<Self>> {
        let max_tags = registry.max_tag_count();
        let mut windows = vec![Window { offset: 0, size: 0 }; max_tags];
        let mut total = 0usize;
        for descriptor in registry.descriptors() {
            let index = descriptor.index as usize;
            if index >= max_tags {
                return Err(PoolError::InvalidArg(format!(
                    "tag {:#x} index {} outside registry range {}",
                    descriptor.tag, index, max_tags
                )));
            }
            let offset = total.next_multiple_of(BLOB_ALIGNMENT);
            let size = descriptor.size();
            windows[index] = Window { offset, size };
            total = offset + size;
            if total > max_bytes {
                return Err(PoolError::NoMemory(format!(
                    "property blob needs more than {} bytes at tag {:#x}",
                    max_bytes, descriptor.tag
                )));
            }
        }
        Ok(Arc::new(Self { windows, total }))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Stored {
    len: usize,
    count: u32,
}

/// One slot's property storage.
#[derive(Debug, Clone)]
pub struct PropertyBlob {
    layout: Arc<BlobLayout>,
    data: Vec<u8>,
    stored: Vec<Option<Stored>>,
}

impl PropertyBlob {
    /// Allocate a zeroed blob for `layout`.
    pub fn new(layout: Arc<BlobLayout>) -> Self {
        let data = vec![0u8; layout.total];
        let stored = vec![None; layout.windows.len()];
        Self {
            layout,
            data,
            stored,
        }
    }

    /// Copy `data` into the window for `index`.
    pub fn write(&mut self, index: u32, data: &[u8], count: u32) -> PoolResult<()> {
        let window = self.window(index)?;
        if data.len() > window.size {
            return Err(PoolError::InvalidArg(format!(
                "{} bytes do not fit tag index {} window of {}",
                data.len(),
                index,
                window.size
            )));
        }
        self.data[window.offset..window.offset + data.len()].copy_from_slice(data);
        self.stored[index as usize] = Some(Stored {
            len: data.len(),
            count,
        });
        Ok(())
    }

    /// Stored bytes for `index`.
    pub fn read(&self, index: u32) -> Option<&[u8]> {
        let stored = self.stored.get(index as usize).copied().flatten()?;
        let window = self.layout.windows[index as usize];
        Some(&self.data[window.offset..window.offset + stored.len])
    }

    /// Element count stored for `index`, 0 when absent.
    pub fn count(&self, index: u32) -> u32 {
        self.stored
            .get(index as usize)
            .copied()
            .flatten()
            .map_or(0, |s| s.count)
    }

    /// Indexes that currently hold a value, ascending.
    pub fn stored_indexes(&self) -> impl Iterator<Item = u32> + '_ {
        self.stored
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(index, _)| index as u32)
    }

    /// Copy every stored value of `source` into this blob.
    pub fn merge_from(&mut self, source: &PropertyBlob) -> PoolResult<()> {
        if !Arc::ptr_eq(&self.layout, &source.layout) {
            return Err(PoolError::InvalidArg(
                "cannot merge blobs with different layouts".to_string(),
            ));
        }
        for index in source.stored_indexes() {
            let count = source.count(index);
            if let Some(bytes) = source.read(index) {
                let window = self.layout.windows[index as usize];
                self.data[window.offset..window.offset + bytes.len()].copy_from_slice(bytes);
                self.stored[index as usize] = Some(Stored {
                    len: bytes.len(),
                    count,
                });
            }
        }
        Ok(())
    }

    /// Forget every stored value and zero the storage.
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.stored.fill(None);
    }

    fn window(&self, index: u32) -> PoolResult<Window> {
        self.layout
            .windows
            .get(index as usize)
            .copied()
            .ok_or_else(|| PoolError::NoSuch(format!("tag index {} not in blob layout", index)))
    }
}
