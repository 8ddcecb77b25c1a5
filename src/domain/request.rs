//! Request types flowing through the target.
//!
//! All positions and lengths are in 512-byte sectors.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::key::{KeyId, KeyMaterial};

/// log2 of the 512-byte unit every position is expressed in.
pub const SECTOR_SHIFT: u32 = 9;

/// Size of the addressing unit in bytes.
pub const SECTOR_SIZE: u32 = 1 << SECTOR_SHIFT;

// =============================================================================
// Operation
// =============================================================================

/// Type of block operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOp {
    Read,
    Write,
    /// Write at the zone's current write pointer, position chosen by the device
    ZoneAppend,
    Discard,
    Flush,
    /// Rewind a zone's write pointer to its start
    ZoneReset,
}

impl RequestOp {
    /// Whether the operation moves payload bytes.
    pub fn carries_data(&self) -> bool {
        matches!(self, RequestOp::Read | RequestOp::Write | RequestOp::ZoneAppend)
    }

    pub fn is_write(&self) -> bool {
        matches!(self, RequestOp::Write | RequestOp::ZoneAppend)
    }
}

impl fmt::Display for RequestOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOp::Read => write!(f, "read"),
            RequestOp::Write => write!(f, "write"),
            RequestOp::ZoneAppend => write!(f, "zone_append"),
            RequestOp::Discard => write!(f, "discard"),
            RequestOp::Flush => write!(f, "flush"),
            RequestOp::ZoneReset => write!(f, "zone_reset"),
        }
    }
}

// =============================================================================
// Encryption Context
// =============================================================================

/// Key plus data unit number attached to a request.
#[derive(Clone)]
pub struct CryptoContext {
    key: Arc<KeyMaterial>,
    dun: u64,
}

impl CryptoContext {
    pub fn new(key: Arc<KeyMaterial>, dun: u64) -> Self {
        Self { key, dun }
    }

    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    pub fn key_id(&self) -> KeyId {
        self.key.id()
    }

    /// Data unit number of the first crypto sector.
    pub fn dun(&self) -> u64 {
        self.dun
    }
}

impl PartialEq for CryptoContext {
    fn eq(&self, other: &Self) -> bool {
        self.key.id() == other.key.id() && self.dun == other.dun
    }
}

impl Eq for CryptoContext {}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext")
            .field("key_id", &self.key.id())
            .field("dun", &self.dun)
            .finish()
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Request against the virtual device.
#[derive(Debug, Clone)]
pub struct Request {
    pub op: RequestOp,
    /// Position in the virtual device
    pub position: u64,
    pub sectors: u64,
    pub payload: Bytes,
    /// Payload is already protected by a higher layer
    pub skip_encryption: bool,
    /// Context attached by someone else; must be `None` on arrival
    pub crypt_ctx: Option<CryptoContext>,
}

impl Request {
    fn new(op: RequestOp, position: u64, sectors: u64, payload: Bytes) -> Self {
        Self {
            op,
            position,
            sectors,
            payload,
            skip_encryption: false,
            crypt_ctx: None,
        }
    }

    pub fn read(position: u64, sectors: u64) -> Self {
        Self::new(RequestOp::Read, position, sectors, Bytes::new())
    }

    /// Write; the sector count is derived from the payload length.
    pub fn write(position: u64, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let sectors = payload.len() as u64 >> SECTOR_SHIFT;
        Self::new(RequestOp::Write, position, sectors, payload)
    }

    /// Append to the zone starting at `zone_start`.
    pub fn zone_append(zone_start: u64, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let sectors = payload.len() as u64 >> SECTOR_SHIFT;
        Self::new(RequestOp::ZoneAppend, zone_start, sectors, payload)
    }

    pub fn discard(position: u64, sectors: u64) -> Self {
        Self::new(RequestOp::Discard, position, sectors, Bytes::new())
    }

    pub fn flush() -> Self {
        Self::new(RequestOp::Flush, 0, 0, Bytes::new())
    }

    pub fn zone_reset(zone_start: u64) -> Self {
        Self::new(RequestOp::ZoneReset, zone_start, 0, Bytes::new())
    }

    /// Mark the payload as already encrypted.
    pub fn with_skip_encryption(mut self) -> Self {
        self.skip_encryption = true;
        self
    }

    /// Whether the request moves any payload bytes.
    pub fn has_data(&self) -> bool {
        self.op.carries_data() && (self.sectors > 0 || !self.payload.is_empty())
    }

    /// Payload that does not end on a sector boundary.
    pub fn has_partial_sector(&self) -> bool {
        self.payload.len() % SECTOR_SIZE as usize != 0
    }
}

/// Request remapped onto the backing device, ready for dispatch.
#[derive(Debug, Clone)]
pub struct MappedRequest {
    pub op: RequestOp,
    pub backing_position: u64,
    pub sectors: u64,
    pub payload: Bytes,
    pub context: Option<CryptoContext>,
}

impl MappedRequest {
    /// DUN of the attached context, if any.
    pub fn dun(&self) -> Option<u64> {
        self.context.as_ref().map(CryptoContext::dun)
    }
}
