//! Domain Ports (Port/Adapter Pattern)
//!
//! The target depends on three collaborators it does not implement: the
//! backing block device, the registry that resolves device paths, and the
//! cipher engine that holds keys and performs the actual encryption.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Mapping (target)                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  BlockDevice │ DeviceRegistry │ CipherEngine         │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Implementations                         │
//! │  MockBlockDevice │ MockDeviceRegistry │ MockCipherEngine    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::request::{MappedRequest, SECTOR_SIZE};
use crate::error::{EngineError, IoError};
use crate::key::{CipherMode, KeyMaterial, KeyType};

// =============================================================================
// Block Device Port
// =============================================================================

/// Backing block device.
///
/// The target holds an `Arc` to it for its whole lifetime but never owns the
/// device itself.
#[async_trait]
pub trait BlockDevice: Send + Sync + fmt::Debug {
    /// Device name used in status output.
    fn name(&self) -> &str;

    /// Capacity in 512-byte sectors.
    fn capacity(&self) -> u64;

    /// Zone size in sectors for zoned devices.
    fn zone_sectors(&self) -> Option<u64> {
        None
    }

    /// Whether the device has sequential-write-required zones.
    fn is_zoned(&self) -> bool {
        self.zone_sectors().is_some()
    }

    /// Logical block size in bytes.
    fn logical_block_size(&self) -> u32 {
        SECTOR_SIZE
    }

    /// Dispatch a remapped request.
    async fn submit(&self, request: MappedRequest) -> Result<(), IoError>;
}

/// Resolves device paths from a table line.
pub trait DeviceRegistry: Send + Sync {
    fn lookup(&self, path: &str) -> Option<Arc<dyn BlockDevice>>;
}

// =============================================================================
// Cipher Engine Port
// =============================================================================

/// What the engine must support to serve a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CryptoProfile {
    pub mode: CipherMode,
    pub key_type: KeyType,
    /// Bytes covered by one DUN (the crypto sector size)
    pub data_unit_size: u32,
    /// Bytes needed to encode the largest DUN
    pub dun_bytes: u32,
}

/// Inline-encryption engine that holds keys for a device.
///
/// Registration and eviction may block; they are only called during
/// construction and teardown.
#[async_trait]
pub trait CipherEngine: Send + Sync {
    async fn register_key(
        &self,
        device: &dyn BlockDevice,
        key: &KeyMaterial,
        profile: &CryptoProfile,
    ) -> Result<(), EngineError>;

    async fn evict_key(&self, device: &dyn BlockDevice, key: &KeyMaterial)
        -> Result<(), EngineError>;
}
