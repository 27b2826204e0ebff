//! Metadata pools and their slots.
//!
//! A [`MetadataPool`] is a fixed window of slots indexed by
//! `request_id % capacity`. Producers write tagged values into the slot for
//! their request and publish them; subscribed [`PoolObserver`]s are notified
//! before `publish` returns. Result pools keep a sticky buffer so reads for a
//! flushed request can still be answered within the early-tag window.
//!
//! [`PoolObserver`]: crate::observer::PoolObserver

pub mod blob;
pub mod metadata_pool;
pub mod slot;
mod subscribers;
pub mod types;

pub use blob::{BlobLayout, PropertyBlob};
pub use metadata_pool::MetadataPool;
pub use slot::{SlotHandle, SlotReadGuard, SlotWriteGuard, SLOT_CLIENT_FLAG};
pub use subscribers::MAX_GLOBAL_SUBSCRIBERS;
pub use types::{PoolStatus, PoolType, StorageMode, Subscription, UnitType};

#[cfg(test)]
mod testutil;
