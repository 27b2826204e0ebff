//! Pool roles, status and subscription types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of a pool in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    /// Static metadata, one slot for the pool's lifetime.
    Static,
    /// Per-frame input settings from the application.
    PerFrameInput,
    /// Per-frame results: metadata plus properties.
    PerFrameResult,
    /// Per-frame early-return results.
    PerFrameResultEarly,
    /// Per-frame internal properties.
    PerFrameInternal,
    /// Per-frame debug data.
    PerFrameDebugData,
    /// Per-usecase properties, one slot for the pool's lifetime.
    PerUsecase,
}

/// How a slot stores its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// One fixed allocation with tag offsets computed from the registry.
    Blob,
    /// A reference-counted [`MetaBuffer`](crate::buffer::MetaBuffer).
    Buffer,
}

impl PoolType {
    /// Stable display name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "Static",
            Self::PerFrameInput => "PerFrameInput",
            Self::PerFrameResult => "PerFrameResult",
            Self::PerFrameResultEarly => "PerFrameResultEarly",
            Self::PerFrameInternal => "PerFrameInternal",
            Self::PerFrameDebugData => "PerFrameDebugData",
            Self::PerUsecase => "PerUsecase",
        }
    }

    /// Whether the pool has a single slot with a fixed identity.
    pub fn is_single_slot(self) -> bool {
        matches!(self, Self::Static | Self::PerUsecase)
    }

    /// Storage mode of this pool's slots.
    pub fn storage_mode(self) -> StorageMode {
        match self {
            Self::PerFrameInput | Self::PerFrameResult | Self::PerUsecase => StorageMode::Buffer,
            Self::Static
            | Self::PerFrameResultEarly
            | Self::PerFrameInternal
            | Self::PerFrameDebugData => StorageMode::Blob,
        }
    }

    /// Whether slots hold metabuffers.
    pub fn uses_meta_buffers(self) -> bool {
        self.storage_mode() == StorageMode::Buffer
    }

    /// Whether the pool keeps a sticky buffer and a publish set.
    pub fn is_result(self) -> bool {
        self == Self::PerFrameResult
    }

    /// Whether observers may subscribe to this pool.
    pub fn supports_subscription(self) -> bool {
        !matches!(self, Self::PerFrameInput | Self::PerFrameDebugData)
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of pool initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// Initialization has not finished.
    Uninitialized,
    /// All slots are allocated.
    Initialized,
    /// Initialization failed; the pool is unusable.
    Error,
}

/// What a subscription refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    /// A property id.
    Property,
    /// A metadata tag.
    Metadata,
}

/// One entry of a subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    /// Property or metadata.
    pub unit_type: UnitType,
    /// The tag or property id.
    pub unit_id: u32,
}

impl Subscription {
    /// Subscribe to a metadata tag.
    pub fn metadata(tag: u32) -> Self {
        Self {
            unit_type: UnitType::Metadata,
            unit_id: tag,
        }
    }

    /// Subscribe to a property.
    pub fn property(id: u32) -> Self {
        Self {
            unit_type: UnitType::Property,
            unit_id: id,
        }
    }
}
