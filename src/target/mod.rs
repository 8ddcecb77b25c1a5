//! The default-key target
//!
//! A [`Mapping`] sits above one backing block device. It remaps every
//! request onto the device and attaches a `{key, DUN}` encryption context
//! to requests that carry data, leaving the cipher work to an external
//! [`CipherEngine`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                             Mapping                               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │  construct ──▶ TableLine ──▶ KeyMaterial ──▶ MappingConfig       │
//! │                                                  │                │
//! │                                                  ▼                │
//! │                                          KeyLifecycle::activate   │
//! │                                                                   │
//! │  Request ──▶ range / op checks ──▶ ZoneAppendEmulator (zoned)     │
//! │                                           │                       │
//! │                                           ▼                       │
//! │                                    RequestMapper::map             │
//! │                                           │                       │
//! │                                           ▼                       │
//! │                                  BlockDevice::submit              │
//! │                                                                   │
//! │  teardown ──▶ KeyLifecycle::evict ──▶ release device              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mapping = Mapping::construct(
//!     "0 2048 default-key aes-xts-plain64 <key> 0 /dev/sda1 0",
//!     &registry,
//!     engine,
//! )
//! .await?;
//!
//! let mapped = mapping.map(&Request::read(8, 8))?;
//! assert_eq!(mapped.dun(), Some(8));
//!
//! mapping.teardown().await?;
//! ```

mod config;
mod lifecycle;
mod limits;
mod mapper;
mod status;
mod zoned;

#[cfg(test)]
mod proptest;

pub use config::{MappingConfig, MappingOptions, MAX_CRYPTO_SECTOR_SIZE, MIN_CRYPTO_SECTOR_SIZE};
pub use lifecycle::{KeyLifecycle, KeyState};
pub use limits::{DeviceExtent, QueueLimits};
pub use mapper::RequestMapper;
pub use status::{StatusReporter, StatusType, StatusView, KEY_PLACEHOLDER};
pub use zoned::{Zone, ZoneAppendEmulator, ZoneReservation, ZoneState, ZonedAdapter};

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    BlockDevice, CipherEngine, DeviceRegistry, MappedRequest, Request, RequestOp,
};
use crate::error::{ConfigError, EngineError, KeyError, MapError, Result};
use crate::metrics::{MapperMetrics, MappingStats, MappingStatsSnapshot};
use crate::table::{TableLine, TargetArgs};

/// Result of a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Virtual position the request was executed at
    pub position: u64,
    pub backing_position: u64,
    pub dun: Option<u64>,
}

// =============================================================================
// Mapping
// =============================================================================

/// One constructed default-key mapping.
pub struct Mapping {
    config: MappingConfig,
    lifecycle: KeyLifecycle,
    zones: Option<ZoneAppendEmulator>,
    stats: MappingStats,
    metrics: Option<MapperMetrics>,
}

impl Mapping {
    /// Construct from a full table line
    /// (`<begin> <len> default-key <target args...>`).
    #[instrument(skip_all)]
    pub async fn construct(
        line: &str,
        devices: &dyn DeviceRegistry,
        engine: Arc<dyn CipherEngine>,
    ) -> std::result::Result<Self, ConfigError> {
        let table = TableLine::parse(line)?;
        let args = table.target_args()?;
        Self::from_args(args, table.begin, table.length, devices, engine).await
    }

    /// Construct from bare target arguments for the region
    /// `[begin, begin + length)`.
    #[instrument(skip_all, fields(begin = begin, length = length))]
    pub async fn construct_args(
        args: &str,
        begin: u64,
        length: u64,
        devices: &dyn DeviceRegistry,
        engine: Arc<dyn CipherEngine>,
    ) -> std::result::Result<Self, ConfigError> {
        let args = TargetArgs::parse_str(args)?;
        Self::from_args(args, begin, length, devices, engine).await
    }

    async fn from_args(
        args: TargetArgs,
        begin: u64,
        length: u64,
        devices: &dyn DeviceRegistry,
        engine: Arc<dyn CipherEngine>,
    ) -> std::result::Result<Self, ConfigError> {
        let key = args.key_material()?;
        let device = devices
            .lookup(&args.device_path)
            .ok_or_else(|| ConfigError::DeviceLookupFailed(args.device_path.clone()))?;

        let config =
            MappingConfig::build(key, device, args.iv_offset, args.start, length, args.options)?
                .with_region_base(begin)
                .with_device_path(&args.device_path);

        let mut lifecycle = KeyLifecycle::new(engine);
        let device = config.device().as_ref();
        if let Err(err) = lifecycle
            .activate(device, config.key(), &config.crypto_profile())
            .await
        {
            if let Err(evict_err) = lifecycle.evict(device, config.key()).await {
                warn!("cleanup after failed activation: {}", evict_err);
            }
            return Err(match err {
                KeyError::EngineRejected(e) | KeyError::EvictionFailed(e) => {
                    ConfigError::EngineRejected(e)
                }
                KeyError::AlreadyActivated(id) => ConfigError::EngineRejected(EngineError::Failed(
                    format!("key {} already active", id),
                )),
            });
        }

        let zones = match (config.zone_append_emulated(), device.zone_sectors()) {
            (true, Some(zone_sectors)) => {
                Some(ZoneAppendEmulator::new(zone_sectors, config.mapped_length()))
            }
            _ => None,
        };

        info!(
            cipher = %config.mode(),
            iv_offset = config.iv_offset(),
            device = %device.name(),
            start = config.start_offset(),
            length = config.mapped_length(),
            sector_size = config.crypto_sector_size(),
            max_dun = config.max_dun(),
            zoned = zones.is_some(),
            "mapping constructed"
        );

        Ok(Self {
            config,
            lifecycle,
            zones,
            stats: MappingStats::new(),
            metrics: None,
        })
    }

    /// Report mapped and rejected requests to Prometheus.
    pub fn with_metrics(mut self, metrics: MapperMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &MappingConfig {
        &self.config
    }

    pub fn key_state(&self) -> KeyState {
        self.lifecycle.state()
    }

    pub fn stats(&self) -> MappingStatsSnapshot {
        self.stats.snapshot()
    }

    /// Write-pointer snapshot of zone `id` on zoned devices.
    pub fn zone(&self, id: u64) -> Option<Zone> {
        self.zones.as_ref().and_then(|zones| zones.zone(id))
    }

    // =========================================================================
    // Request Path
    // =========================================================================

    /// Map one request onto the backing device.
    ///
    /// Rejects requests outside the mapped region and operations the mapping
    /// does not enable, then runs [`RequestMapper::map`]. A rejection fails
    /// only this request.
    pub fn map(&self, req: &Request) -> std::result::Result<MappedRequest, MapError> {
        let result = self.map_checked(req);
        match &result {
            Ok(mapped) => self.record_mapped(mapped),
            Err(e) => self.record_rejected(req, e),
        }
        result
    }

    fn record_mapped(&self, mapped: &MappedRequest) {
        self.stats.record_mapped(mapped);
        if let Some(metrics) = &self.metrics {
            metrics.record_mapped(mapped);
        }
    }

    fn record_rejected(&self, req: &Request, e: &MapError) {
        self.stats.record_rejected();
        if let Some(metrics) = &self.metrics {
            metrics.record_rejected(e);
        }
        debug!(op = %req.op, position = req.position, sectors = req.sectors, "request rejected: {}", e);
    }

    /// On zoned devices appends resolve against the current write pointer,
    /// which stays where it is: only [`Mapping::submit`] moves it.
    fn map_checked(&self, req: &Request) -> std::result::Result<MappedRequest, MapError> {
        self.check_operation(req.op)?;
        self.check_range(req)?;

        match &self.zones {
            Some(zones) => {
                let assigned = zones.resolve(req.op, self.sector_in_target(req), req.sectors)?;
                self.map_at(req, assigned)
            }
            None => RequestMapper::map(&self.config, req),
        }
    }

    /// Like `map_checked`, but write-locks the zone a zoned write lands in.
    fn map_reserved(
        &self,
        req: &Request,
    ) -> std::result::Result<(MappedRequest, Option<ZoneReservation<'_>>), MapError> {
        self.check_operation(req.op)?;
        self.check_range(req)?;

        let Some(zones) = &self.zones else {
            return Ok((RequestMapper::map(&self.config, req)?, None));
        };
        let reservation = zones.reserve(req.op, self.sector_in_target(req), req.sectors)?;
        let assigned = reservation
            .as_ref()
            .map_or(self.sector_in_target(req), ZoneReservation::position);
        let mapped = self.map_at(req, assigned)?;
        Ok((mapped, reservation))
    }

    fn sector_in_target(&self, req: &Request) -> u64 {
        req.position.saturating_sub(self.config.region_base())
    }

    /// Map `req` as issued at region relative sector `assigned`. Appends
    /// become positional writes.
    fn map_at(&self, req: &Request, assigned: u64) -> std::result::Result<MappedRequest, MapError> {
        if assigned == self.sector_in_target(req) && req.op != RequestOp::ZoneAppend {
            return RequestMapper::map(&self.config, req);
        }
        let mut positioned = req.clone();
        positioned.position = self.config.region_base() + assigned;
        if positioned.op == RequestOp::ZoneAppend {
            positioned.op = RequestOp::Write;
        }
        RequestMapper::map(&self.config, &positioned)
    }

    fn check_operation(&self, op: RequestOp) -> std::result::Result<(), MapError> {
        let enabled = match op {
            RequestOp::Discard => self.config.allow_discard(),
            RequestOp::ZoneAppend | RequestOp::ZoneReset => self.config.zone_append_emulated(),
            RequestOp::Read | RequestOp::Write | RequestOp::Flush => true,
        };
        if enabled {
            Ok(())
        } else {
            Err(MapError::UnsupportedOperation(op.to_string()))
        }
    }

    fn check_range(&self, req: &Request) -> std::result::Result<(), MapError> {
        let in_range = match (req.op, req.sectors) {
            (RequestOp::Flush, _) => true,
            (_, 0) => self.config.contains(req.position, 1),
            (_, sectors) => self.config.contains(req.position, sectors),
        };
        if in_range {
            Ok(())
        } else {
            Err(MapError::OutOfRange {
                position: req.position,
                sectors: req.sectors,
                begin: self.config.region_base(),
                length: self.config.mapped_length(),
            })
        }
    }

    /// Map `request` and dispatch it to the backing device.
    ///
    /// A zoned write holds its zone's write lock until the device answers.
    /// The write pointer advances only when the device succeeds.
    #[instrument(skip_all, fields(op = %request.op, position = request.position))]
    pub async fn submit(&self, request: Request) -> Result<Completion> {
        let (mapped, reservation) = match self.map_reserved(&request) {
            Ok(reserved) => reserved,
            Err(e) => {
                self.record_rejected(&request, &e);
                return Err(e.into());
            }
        };
        self.record_mapped(&mapped);

        let completion = Completion {
            position: mapped.backing_position - self.config.start_offset()
                + self.config.region_base(),
            backing_position: mapped.backing_position,
            dun: mapped.dun(),
        };

        let result = self.config.device().submit(mapped).await;
        self.stats.record_completion(result.is_ok());
        if let Err(e) = &result {
            if let Some(metrics) = &self.metrics {
                metrics.record_io_error(e);
            }
            warn!("backing device failed request: {}", e);
        }
        result?;

        if let Some(reservation) = reservation {
            reservation.commit();
        }
        Ok(completion)
    }

    /// Dispatch a batch concurrently. Results are in request order.
    pub async fn submit_all(&self, requests: Vec<Request>) -> Vec<Result<Completion>> {
        join_all(requests.into_iter().map(|request| self.submit(request))).await
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Non-secret description of the mapping.
    pub fn status(&self) -> StatusView {
        StatusReporter::describe(&self.config)
    }

    /// Limits the virtual device must advertise.
    pub fn io_limits(&self) -> QueueLimits {
        QueueLimits::from_device(self.config.device().as_ref())
            .raise_to_crypto_sector(self.config.crypto_sector_size())
    }

    /// Backing device area this mapping covers.
    pub fn device_extent(&self) -> DeviceExtent {
        DeviceExtent {
            device: self.config.device().name().to_string(),
            start: self.config.start_offset(),
            length: self.config.mapped_length(),
        }
    }

    /// The backing device, if the mapping covers all of it and ioctls may be
    /// forwarded unchanged.
    pub fn passthrough_device(&self) -> Option<&Arc<dyn BlockDevice>> {
        let device = self.config.device();
        (self.config.start_offset() == 0 && self.config.mapped_length() == device.capacity())
            .then_some(device)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Evict the key, then release the backing device.
    ///
    /// An eviction failure is returned, but the mapping is gone either way.
    #[instrument(skip_all, fields(device = %self.config.device().name()))]
    pub async fn teardown(mut self) -> std::result::Result<(), KeyError> {
        let device = Arc::clone(self.config.device());
        let key = Arc::clone(self.config.key());
        let result = self.lifecycle.evict(device.as_ref(), &key).await;
        drop(self);
        info!("mapping torn down");
        result
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("config", &self.config)
            .field("key_state", &self.lifecycle.state())
            .field("zoned", &self.zones.is_some())
            .finish()
    }
}
