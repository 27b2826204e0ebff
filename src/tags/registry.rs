//! Tag registry contract and the in-memory [`TagTable`] implementation.
//!
//! A registry resolves a stable numeric tag to its [`TagDescriptor`]. Pools
//! only consume the contract: the dense `index` drives the O(1) published
//! bitset and subscriber lookups, `size()` bounds every write, and the
//! property-vs-metadata [`TagKind`] selects which observer callback fires.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

// ---------------------------------------------------------------------------
// Element types
// ---------------------------------------------------------------------------

/// Element type of a tag's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagType {
    /// Unsigned 8-bit.
    Byte,
    /// Signed 32-bit integer.
    Int32,
    /// 32-bit float.
    Float,
    /// Signed 64-bit integer.
    Int64,
    /// 64-bit float.
    Double,
    /// Numerator/denominator pair of signed 32-bit integers.
    Rational,
}

impl TagType {
    /// Size in bytes of one element.
    pub fn unit_size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Int32 | Self::Float => 4,
            Self::Int64 | Self::Double | Self::Rational => 8,
        }
    }
}

/// Whether a tag is an internal property or an externally visible metadata tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    /// Metadata tag; observers receive `on_metadata_*` callbacks.
    #[default]
    Metadata,
    /// Property; observers receive `on_property_*` callbacks.
    Property,
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Everything the pool needs to know about one tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDescriptor {
    /// Stable numeric identifier.
    pub tag: u32,
    /// Dense index in `0..max_tag_count`. Assigned by the registry.
    #[serde(default)]
    pub index: u32,
    /// Human-readable name.
    pub name: String,
    /// Element type.
    #[serde(rename = "type")]
    pub element_type: TagType,
    /// Maximum number of elements.
    pub count: u32,
    /// Property or metadata.
    #[serde(default)]
    pub kind: TagKind,
}

impl TagDescriptor {
    /// Maximum payload size in bytes.
    pub fn size(&self) -> usize {
        self.element_type.unit_size() * self.count as usize
    }

    /// Whether this is a property.
    pub fn is_property(&self) -> bool {
        self.kind == TagKind::Property
    }
}

// ---------------------------------------------------------------------------
// Registry contract
// ---------------------------------------------------------------------------

/// Resolves tag ids to descriptors.
///
/// Implementations must be immutable once handed to a pool.
pub trait TagRegistry: Send + Sync + fmt::Debug {
    /// Descriptor for `tag`, if registered.
    fn descriptor(&self, tag: u32) -> Option<&TagDescriptor>;

    /// Descriptor by dense index.
    fn descriptor_by_index(&self, index: u32) -> Option<&TagDescriptor>;

    /// Number of dense indexes; sizes the per-slot published bitset.
    fn max_tag_count(&self) -> usize;

    /// All descriptors in index order.
    fn descriptors(&self) -> Vec<&TagDescriptor>;

    /// Whether `tag` is a registered property.
    fn is_property(&self, tag: u32) -> bool {
        self.descriptor(tag).is_some_and(TagDescriptor::is_property)
    }
}

// ---------------------------------------------------------------------------
// TagTable
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TagTableDocument {
    tags: Vec<TagDescriptor>,
}

/// In-memory tag registry.
///
/// Indexes are assigned in insertion order, so the table built by
/// [`TagTable::builder`] or loaded from JSON is always dense.
#[derive(Debug, Clone, Default)]
pub struct TagTable {
    by_tag: HashMap<u32, usize>,
    entries: Vec<TagDescriptor>,
}

impl TagTable {
    /// Start building a table in code.
    pub fn builder() -> TagTableBuilder {
        TagTableBuilder::default()
    }

    /// Build a table from descriptors, reassigning dense indexes.
    pub fn from_descriptors(descriptors: Vec<TagDescriptor>) -> PoolResult<Self> {
        let mut table = Self {
            by_tag: HashMap::with_capacity(descriptors.len()),
            entries: Vec::with_capacity(descriptors.len()),
        };
        for mut descriptor in descriptors {
            if descriptor.count == 0 {
                return Err(PoolError::InvalidArg(format!(
                    "tag {:#x} ({}) has zero element count",
                    descriptor.tag, descriptor.name
                )));
            }
            if table.by_tag.contains_key(&descriptor.tag) {
                return Err(PoolError::InvalidArg(format!(
                    "duplicate tag {:#x} ({})",
                    descriptor.tag, descriptor.name
                )));
            }
            let position = table.entries.len();
            descriptor.index = position as u32;
            table.by_tag.insert(descriptor.tag, position);
            table.entries.push(descriptor);
        }
        Ok(table)
    }

    /// Parse a `{"tags": [...]}` JSON document.
    pub fn from_json_str(json: &str) -> PoolResult<Self> {
        let document: TagTableDocument = serde_json::from_str(json)?;
        Self::from_descriptors(document.tags)
    }

    /// Load a `{"tags": [...]}` JSON document from disk.
    pub fn from_file(path: impl AsRef<Path>) -> PoolResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Number of registered tags.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no tags.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TagRegistry for TagTable {
    fn descriptor(&self, tag: u32) -> Option<&TagDescriptor> {
        self.by_tag.get(&tag).map(|&position| &self.entries[position])
    }

    fn descriptor_by_index(&self, index: u32) -> Option<&TagDescriptor> {
        self.entries.get(index as usize)
    }

    fn max_tag_count(&self) -> usize {
        self.entries.len()
    }

    fn descriptors(&self) -> Vec<&TagDescriptor> {
        self.entries.iter().collect()
    }
}

/// Builder for [`TagTable`].
#[derive(Debug, Default)]
pub struct TagTableBuilder {
    entries: Vec<TagDescriptor>,
}

impl TagTableBuilder {
    /// Register a metadata tag holding up to `count` elements of `element_type`.
    pub fn metadata(
        mut self,
        tag: u32,
        name: impl Into<String>,
        element_type: TagType,
        count: u32,
    ) -> Self {
        self.entries.push(TagDescriptor {
            tag,
            index: 0,
            name: name.into(),
            element_type,
            count,
            kind: TagKind::Metadata,
        });
        self
    }

    /// Register a property occupying `size` bytes.
    pub fn property(mut self, tag: u32, name: impl Into<String>, size: u32) -> Self {
        self.entries.push(TagDescriptor {
            tag,
            index: 0,
            name: name.into(),
            element_type: TagType::Byte,
            count: size,
            kind: TagKind::Property,
        });
        self
    }

    /// Finish the table.
    pub fn build(self) -> PoolResult<TagTable> {
        TagTable::from_descriptors(self.entries)
    }
}
