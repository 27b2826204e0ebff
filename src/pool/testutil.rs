//! Shared fixtures for pool tests.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::observer::{PoolObserver, PublishGate};
use crate::pool::{MetadataPool, PoolType};
use crate::tags::{TagRegistry, TagTable, TagType};

pub const AE_MODE: u32 = 0x0001_0000;
pub const EXPOSURE: u32 = 0x0001_0001;
pub const GAINS: u32 = 0x0001_0002;
pub const AEC_FRAME: u32 = 0x3000_0000;
pub const STATS: u32 = 0x3000_0001;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn registry() -> Arc<dyn TagRegistry> {
    Arc::new(
        TagTable::builder()
            .metadata(AE_MODE, "android.control.aeMode", TagType::Byte, 1)
            .metadata(EXPOSURE, "android.sensor.exposureTime", TagType::Int64, 1)
            .metadata(GAINS, "android.colorCorrection.gains", TagType::Float, 4)
            .property(AEC_FRAME, "PropertyIDAECFrameControl", 8)
            .property(STATS, "PropertyIDParsedStats", 16)
            .build()
            .unwrap(),
    )
}

pub fn pool(pool_type: PoolType, capacity: usize) -> Arc<MetadataPool> {
    pool_with(PoolConfig::new(pool_type, capacity).with_name("test"))
}

pub fn pool_with(config: PoolConfig) -> Arc<MetadataPool> {
    init_logging();
    MetadataPool::create(config, registry(), None).unwrap()
}

/// Observer that appends every callback to a log, possibly shared.
pub struct Recorder {
    pub name: &'static str,
    pub log: Arc<Mutex<Vec<String>>>,
    pub gate: PublishGate,
}

impl Recorder {
    pub fn new(name: &'static str) -> Arc<Self> {
        Self::sharing(name, Arc::new(Mutex::new(Vec::new())))
    }

    pub fn sharing(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            log,
            gate: PublishGate::new(),
        })
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn push(&self, kind: &str, id: u32, request_id: u64, pipeline_id: u32) {
        self.log.lock().push(format!(
            "{} {} {:#x} {} {}",
            self.name, kind, id, request_id, pipeline_id
        ));
    }
}

impl PoolObserver for Recorder {
    fn on_property_update(&self, id: u32, request_id: u64, pipeline_id: u32) {
        assert!(self.gate.is_locked());
        self.push("property", id, request_id, pipeline_id);
    }

    fn on_metadata_update(&self, tag: u32, request_id: u64, pipeline_id: u32) {
        assert!(self.gate.is_locked());
        self.push("metadata", tag, request_id, pipeline_id);
    }

    fn on_property_failure(&self, id: u32, request_id: u64, pipeline_id: u32) {
        self.push("property-failure", id, request_id, pipeline_id);
    }

    fn on_metadata_failure(&self, tag: u32, request_id: u64, pipeline_id: u32) {
        self.push("metadata-failure", tag, request_id, pipeline_id);
    }

    fn lock_for_publish(&self) {
        self.gate.lock();
    }

    fn unlock_after_publish(&self) {
        self.gate.unlock();
    }
}

pub fn as_observer(recorder: &Arc<Recorder>) -> Arc<dyn PoolObserver> {
    recorder.clone()
}
