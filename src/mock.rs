//! In-memory backend for tests and the CLI
//!
//! - [`MockBlockDevice`]: sector store plus a log of every submitted request
//! - [`MockDeviceRegistry`]: path lookup
//! - [`MockCipherEngine`]: keyslot table with capability checks and
//!   failure injection
//!
//! Nothing here encrypts. The device records the DUN and key id each
//! request arrived with so callers can check what the engine would have
//! been asked to do.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::domain::{
    BlockDevice, CipherEngine, CryptoProfile, DeviceRegistry, MappedRequest, RequestOp,
    SECTOR_SHIFT, SECTOR_SIZE,
};
use crate::error::{EngineError, IoError};
use crate::key::{CipherMode, KeyId, KeyMaterial};

// =============================================================================
// Block Device
// =============================================================================

/// What a [`MockBlockDevice`] saw for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub op: RequestOp,
    pub backing_position: u64,
    pub sectors: u64,
    pub dun: Option<u64>,
    pub key_id: Option<u64>,
}

/// Per-device I/O counters.
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_written: AtomicU64,
    pub discards: AtomicU64,
    pub flushes: AtomicU64,
    pub errors: AtomicU64,
}

/// In-memory block device.
#[derive(Debug)]
pub struct MockBlockDevice {
    name: String,
    capacity: AtomicU64,
    zone_sectors: Option<u64>,
    logical_block_size: u32,
    /// Sector number -> 512 bytes
    storage: RwLock<HashMap<u64, Vec<u8>>>,
    submissions: RwLock<Vec<Submission>>,
    stats: DeviceStats,
    fail_next: AtomicBool,
}

impl MockBlockDevice {
    pub fn new(name: &str, capacity: u64) -> Self {
        Self {
            name: name.to_string(),
            capacity: AtomicU64::new(capacity),
            zone_sectors: None,
            logical_block_size: SECTOR_SIZE,
            storage: RwLock::new(HashMap::new()),
            submissions: RwLock::new(Vec::new()),
            stats: DeviceStats::default(),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Device with sequential-write-required zones of `zone_sectors`.
    pub fn zoned(name: &str, capacity: u64, zone_sectors: u64) -> Self {
        Self {
            zone_sectors: Some(zone_sectors),
            ..Self::new(name, capacity)
        }
    }

    pub fn with_logical_block_size(mut self, size: u32) -> Self {
        self.logical_block_size = size;
        self
    }

    /// Change the capacity after the device is in use.
    pub fn resize(&self, capacity: u64) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    /// Fail the next submission with a device error.
    pub fn fail_next_submit(&self) {
        self.fail_next.store(true, Ordering::Relaxed);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.read().clone()
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Stored bytes of one sector, if it was ever written.
    pub fn sector(&self, sector: u64) -> Option<Vec<u8>> {
        self.storage.read().get(&sector).cloned()
    }
}

#[async_trait]
impl BlockDevice for MockBlockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    fn zone_sectors(&self) -> Option<u64> {
        self.zone_sectors
    }

    fn logical_block_size(&self) -> u32 {
        self.logical_block_size
    }

    async fn submit(&self, request: MappedRequest) -> Result<(), IoError> {
        if self.fail_next.swap(false, Ordering::Relaxed) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(IoError::Device(format!("{}: injected failure", self.name)));
        }

        let capacity = self.capacity();
        let in_range = request
            .backing_position
            .checked_add(request.sectors)
            .is_some_and(|end| end <= capacity);
        if request.sectors > 0 && !in_range {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(IoError::OutOfRange {
                position: request.backing_position,
                sectors: request.sectors,
                capacity,
            });
        }

        match request.op {
            RequestOp::Write | RequestOp::ZoneAppend => {
                if request.payload.len() as u64 != request.sectors << SECTOR_SHIFT {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    return Err(IoError::PayloadMismatch {
                        bytes: request.payload.len(),
                        sectors: request.sectors,
                    });
                }
                let mut storage = self.storage.write();
                for (i, chunk) in request.payload.chunks(SECTOR_SIZE as usize).enumerate() {
                    storage.insert(request.backing_position + i as u64, chunk.to_vec());
                }
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_written
                    .fetch_add(request.payload.len() as u64, Ordering::Relaxed);
            }
            RequestOp::Read => {
                self.stats.reads.fetch_add(1, Ordering::Relaxed);
            }
            RequestOp::Discard => {
                let mut storage = self.storage.write();
                for sector in request.backing_position..request.backing_position + request.sectors {
                    storage.remove(&sector);
                }
                self.stats.discards.fetch_add(1, Ordering::Relaxed);
            }
            RequestOp::Flush => {
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
            }
            RequestOp::ZoneReset => {
                if let Some(zone_sectors) = self.zone_sectors {
                    let start = request.backing_position;
                    self.storage
                        .write()
                        .retain(|sector, _| *sector < start || *sector >= start + zone_sectors);
                }
            }
        }

        self.submissions.write().push(Submission {
            op: request.op,
            backing_position: request.backing_position,
            sectors: request.sectors,
            dun: request.dun(),
            key_id: request.context.as_ref().map(|ctx| ctx.key_id().0),
        });
        Ok(())
    }
}

// =============================================================================
// Device Registry
// =============================================================================

/// Path -> device map.
#[derive(Debug, Default)]
pub struct MockDeviceRegistry {
    devices: RwLock<HashMap<String, Arc<MockBlockDevice>>>,
}

impl MockDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: &str, device: Arc<MockBlockDevice>) {
        self.devices.write().insert(path.to_string(), device);
    }

    /// Concrete device, for inspection.
    pub fn get(&self, path: &str) -> Option<Arc<MockBlockDevice>> {
        self.devices.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

impl DeviceRegistry for MockDeviceRegistry {
    fn lookup(&self, path: &str) -> Option<Arc<dyn BlockDevice>> {
        self.get(path).map(|device| device as Arc<dyn BlockDevice>)
    }
}

// =============================================================================
// Cipher Engine
// =============================================================================

/// What a [`MockCipherEngine`] accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineCapabilities {
    pub modes: Vec<CipherMode>,
    pub data_unit_sizes: Vec<u32>,
    pub max_dun_bytes: u32,
    pub wrapped_keys: bool,
    /// Keyslots per device
    pub keyslots: usize,
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self {
            modes: CipherMode::ALL.to_vec(),
            data_unit_sizes: vec![512, 1024, 2048, 4096],
            max_dun_bytes: 8,
            wrapped_keys: true,
            keyslots: 16,
        }
    }
}

/// Keyslot table keyed by device name and key id.
#[derive(Debug, Default)]
pub struct MockCipherEngine {
    capabilities: EngineCapabilities,
    keyslots: DashMap<(String, u64), CryptoProfile>,
    register_calls: AtomicU64,
    evict_calls: AtomicU64,
    fail_register: AtomicBool,
    fail_evict: AtomicBool,
}

impl MockCipherEngine {
    pub fn new() -> Self {
        Self::with_capabilities(EngineCapabilities::default())
    }

    pub fn with_capabilities(capabilities: EngineCapabilities) -> Self {
        Self {
            capabilities,
            ..Default::default()
        }
    }

    pub fn capabilities(&self) -> &EngineCapabilities {
        &self.capabilities
    }

    /// Make the next registration fail after it has taken a keyslot.
    pub fn fail_next_register(&self) {
        self.fail_register.store(true, Ordering::Relaxed);
    }

    /// Make the next eviction fail. The keyslot is still released.
    pub fn fail_next_evict(&self) {
        self.fail_evict.store(true, Ordering::Relaxed);
    }

    pub fn is_registered(&self, device: &str, key: KeyId) -> bool {
        self.keyslots.contains_key(&(device.to_string(), key.0))
    }

    pub fn registered_count(&self) -> usize {
        self.keyslots.len()
    }

    pub fn register_calls(&self) -> u64 {
        self.register_calls.load(Ordering::Relaxed)
    }

    pub fn evict_calls(&self) -> u64 {
        self.evict_calls.load(Ordering::Relaxed)
    }

    fn check_profile(&self, device: &str, profile: &CryptoProfile) -> Result<(), EngineError> {
        let unsupported = |reason: String| EngineError::Unsupported {
            device: device.to_string(),
            reason,
        };
        let caps = &self.capabilities;
        if !caps.modes.contains(&profile.mode) {
            return Err(unsupported(format!("cipher {}", profile.mode)));
        }
        if !caps.data_unit_sizes.contains(&profile.data_unit_size) {
            return Err(unsupported(format!("data unit size {}", profile.data_unit_size)));
        }
        if profile.dun_bytes > caps.max_dun_bytes {
            return Err(unsupported(format!("{} byte DUNs", profile.dun_bytes)));
        }
        if profile.key_type.is_wrapped() && !caps.wrapped_keys {
            return Err(unsupported("hardware-wrapped keys".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CipherEngine for MockCipherEngine {
    async fn register_key(
        &self,
        device: &dyn BlockDevice,
        key: &KeyMaterial,
        profile: &CryptoProfile,
    ) -> Result<(), EngineError> {
        self.register_calls.fetch_add(1, Ordering::Relaxed);
        self.check_profile(device.name(), profile)?;

        let used = self
            .keyslots
            .iter()
            .filter(|entry| entry.key().0 == device.name())
            .count();
        if used >= self.capabilities.keyslots {
            return Err(EngineError::NoKeyslot(device.name().to_string()));
        }

        self.keyslots
            .insert((device.name().to_string(), key.id().0), *profile);

        if self.fail_register.swap(false, Ordering::Relaxed) {
            return Err(EngineError::Failed(format!(
                "{}: keyslot programming failed",
                device.name()
            )));
        }
        Ok(())
    }

    async fn evict_key(&self, device: &dyn BlockDevice, key: &KeyMaterial) -> Result<(), EngineError> {
        self.evict_calls.fetch_add(1, Ordering::Relaxed);
        let removed = self.keyslots.remove(&(device.name().to_string(), key.id().0));

        if self.fail_evict.swap(false, Ordering::Relaxed) {
            return Err(EngineError::Failed(format!("{}: keyslot eviction failed", device.name())));
        }
        match removed {
            Some(_) => Ok(()),
            None => Err(EngineError::NotRegistered {
                device: device.name().to_string(),
                key_id: key.id().0,
            }),
        }
    }
}
