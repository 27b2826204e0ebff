//! Tag registry contract.
//!
//! The registry itself is owned by the surrounding system; pools consume it
//! through [`TagRegistry`]. [`TagTable`] is a ready-made in-memory registry
//! that can be built in code or loaded from JSON.

pub mod registry;

pub use registry::{TagDescriptor, TagKind, TagRegistry, TagTable, TagTableBuilder, TagType};
