//! Reference-counted buffers attached to pool slots.

pub mod metabuffer;

pub use metabuffer::{MetaBuffer, MetaBufferHandle, TagEntry, CLIENT_USAGE_MASK};
