//! # metapool
//!
//! Per-frame metadata and property pools for multi-stage processing
//! pipelines.
//!
//! A [`MetadataPool`] holds a fixed window of slots, one per in-flight
//! request. Stages write tagged values into the slot for their request,
//! publish them, and every subscribed [`PoolObserver`] is notified before
//! the publish returns. Downstream stages read the same slot; result pools
//! keep a sticky snapshot so reads for flushed requests can still be
//! answered.
//!
//! ```no_run
//! use std::sync::Arc;
//! use metapool::{MetadataPool, PoolConfig, PoolType, TagTable, TagType};
//!
//! # fn main() -> metapool::PoolResult<()> {
//! let registry = Arc::new(
//!     TagTable::builder()
//!         .metadata(0x0001_0000, "android.control.aeMode", TagType::Byte, 1)
//!         .build()?,
//! );
//! let pool = MetadataPool::create(
//!     PoolConfig::new(PoolType::PerFrameInternal, 8).with_name("internal"),
//!     registry,
//!     None,
//! )?;
//! pool.update_request_id(1)?;
//! let slot = pool.get_slot(1)?;
//! slot.set_by_tag(0x0001_0000, &[1], 1)?;
//! slot.publish(0x0001_0000)?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod observer;
pub mod pool;
pub mod tags;
pub mod worker;

pub use buffer::{MetaBuffer, MetaBufferHandle};
pub use config::{InputZeroFill, PoolConfig};
pub use error::{PoolError, PoolResult};
pub use observer::{PoolObserver, PublishGate};
pub use pool::{MetadataPool, PoolStatus, PoolType, SlotHandle, Subscription, UnitType};
pub use tags::{TagDescriptor, TagKind, TagRegistry, TagTable, TagType};
pub use worker::{RuntimeWorker, ThreadWorker, Worker};
