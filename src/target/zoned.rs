//! Zoned backing devices
//!
//! DUNs are derived from a request's position, so the position has to be
//! known before the context is attached. Zone-append leaves that choice to
//! the device. On zoned devices the mapping therefore tracks each zone's
//! write pointer itself and turns every append into a positional write at
//! that pointer.
//!
//! # Zone Lifecycle
//!
//! ```text
//! Empty → Open → Full → (Reset) → Empty
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::domain::{BlockDevice, RequestOp};
use crate::error::MapError;

/// Configuration-time decision for zoned devices.
pub struct ZonedAdapter;

impl ZonedAdapter {
    /// True when appends must be rewritten into positional writes before
    /// DUN derivation.
    pub fn should_force_positional_write(device: &dyn BlockDevice) -> bool {
        device.is_zoned()
    }
}

// =============================================================================
// Zone Types
// =============================================================================

/// State of one zone of the mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum ZoneState {
    #[default]
    Empty,
    Open,
    Full,
}

/// Write-pointer bookkeeping for one zone.
///
/// Positions are in 512-byte sectors relative to the start of the mapped
/// region.
#[derive(Debug, Clone, Serialize)]
pub struct Zone {
    pub id: u64,
    pub start: u64,
    pub size: u64,
    /// Offset of the next writable sector from `start`
    pub write_pointer: u64,
    pub state: ZoneState,
    /// A write to this zone is in flight
    pub write_locked: bool,
}

impl Zone {
    fn new(id: u64, start: u64, size: u64) -> Self {
        Self {
            id,
            start,
            size,
            write_pointer: 0,
            state: ZoneState::Empty,
            write_locked: false,
        }
    }

    /// Absolute (region relative) position of the write pointer.
    pub fn write_position(&self) -> u64 {
        self.start + self.write_pointer
    }

    pub fn remaining_space(&self) -> u64 {
        self.size.saturating_sub(self.write_pointer)
    }

    fn advance(&mut self, sectors: u64) {
        self.write_pointer += sectors;
        self.state = if self.write_pointer >= self.size {
            ZoneState::Full
        } else {
            ZoneState::Open
        };
    }

    fn reset(&mut self) {
        self.write_pointer = 0;
        self.state = ZoneState::Empty;
    }
}

// =============================================================================
// Zone-Append Emulation
// =============================================================================

/// Per-zone write pointers of a mapping on a zoned device.
#[derive(Debug)]
pub struct ZoneAppendEmulator {
    zone_sectors: u64,
    zones: Mutex<Vec<Zone>>,
}

impl ZoneAppendEmulator {
    /// Track `mapped_length / zone_sectors` zones, all empty.
    pub fn new(zone_sectors: u64, mapped_length: u64) -> Self {
        let count = mapped_length / zone_sectors;
        let zones = (0..count)
            .map(|id| Zone::new(id, id * zone_sectors, zone_sectors))
            .collect();
        Self {
            zone_sectors,
            zones: Mutex::new(zones),
        }
    }

    pub fn zone_sectors(&self) -> u64 {
        self.zone_sectors
    }

    /// Snapshot of zone `id`.
    pub fn zone(&self, id: u64) -> Option<Zone> {
        self.zones.lock().get(id as usize).cloned()
    }

    fn is_tracked(op: RequestOp) -> bool {
        matches!(op, RequestOp::Write | RequestOp::ZoneAppend | RequestOp::ZoneReset)
    }

    /// Position a zoned request would be written at, without touching the
    /// write pointer.
    ///
    /// `position` is region relative. Requests other than writes, appends
    /// and zone resets resolve to `position` unchanged.
    pub fn resolve(&self, op: RequestOp, position: u64, sectors: u64) -> Result<u64, MapError> {
        if !Self::is_tracked(op) {
            return Ok(position);
        }
        let zones = self.zones.lock();
        let zone = Self::zone_for(&zones, op, position, self.zone_sectors)?;
        Self::target(zone, op, position, sectors)
    }

    /// Lock the zone `position` falls in and resolve the request's position.
    ///
    /// The write pointer moves only when the returned reservation is
    /// committed. Dropping it uncommitted unlocks the zone and leaves the
    /// pointer where it was. Returns `Ok(None)` for requests that do not
    /// touch the write pointer, and [`MapError::ZoneBusy`] while another
    /// write to the same zone is in flight.
    pub fn reserve(
        &self,
        op: RequestOp,
        position: u64,
        sectors: u64,
    ) -> Result<Option<ZoneReservation<'_>>, MapError> {
        if !Self::is_tracked(op) {
            return Ok(None);
        }
        let mut zones = self.zones.lock();
        let zone = Self::zone_for(&zones, op, position, self.zone_sectors)?;
        if zone.write_locked {
            return Err(MapError::ZoneBusy { zone: zone.id });
        }
        let target = Self::target(zone, op, position, sectors)?;
        let id = zone.id;
        if let Some(zone) = zones.get_mut(id as usize) {
            zone.write_locked = true;
        }
        Ok(Some(ZoneReservation {
            zones: self,
            zone: id,
            op,
            position: target,
            sectors,
            committed: false,
        }))
    }

    fn zone_for(
        zones: &[Zone],
        op: RequestOp,
        position: u64,
        zone_sectors: u64,
    ) -> Result<&Zone, MapError> {
        zones.get((position / zone_sectors) as usize).ok_or_else(|| {
            MapError::UnsupportedOperation(format!("{} outside the zoned region", op))
        })
    }

    fn target(zone: &Zone, op: RequestOp, position: u64, sectors: u64) -> Result<u64, MapError> {
        let target = match op {
            RequestOp::ZoneReset => return Ok(zone.start),
            RequestOp::ZoneAppend if position != zone.start => {
                return Err(MapError::UnsupportedOperation(format!(
                    "zone_append at sector {} is not the start of zone {}",
                    position, zone.id
                )));
            }
            RequestOp::ZoneAppend => zone.write_position(),
            _ if position != zone.write_position() => {
                return Err(MapError::ZoneWriteOutOfOrder {
                    zone: zone.id,
                    position,
                    write_pointer: zone.write_position(),
                });
            }
            _ => position,
        };

        if sectors > zone.remaining_space() {
            return Err(MapError::ZoneFull {
                zone: zone.id,
                remaining: zone.remaining_space(),
                sectors,
            });
        }
        Ok(target)
    }
}

/// A write-locked zone with a resolved position, held while the request is
/// in flight.
#[derive(Debug)]
pub struct ZoneReservation<'a> {
    zones: &'a ZoneAppendEmulator,
    zone: u64,
    op: RequestOp,
    position: u64,
    sectors: u64,
    committed: bool,
}

impl ZoneReservation<'_> {
    /// Region relative position the request is written at.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The device completed the request: advance (or rewind) the pointer.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ZoneReservation<'_> {
    fn drop(&mut self) {
        let mut zones = self.zones.zones.lock();
        let Some(zone) = zones.get_mut(self.zone as usize) else {
            return;
        };
        zone.write_locked = false;
        if !self.committed {
            debug!(zone = zone.id, "zone reservation released");
            return;
        }
        if self.op == RequestOp::ZoneReset {
            zone.reset();
            debug!(zone = zone.id, "zone reset");
        } else {
            zone.advance(self.sectors);
        }
    }
}
