//! Mapping statistics and Prometheus counters
//!
//! [`MappingStats`] is always on and lock-free. [`MapperMetrics`] is
//! optional and registers counters on a caller-supplied [`Registry`].

use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::{IntCounterVec, Opts, Registry};
use serde::Serialize;

use crate::domain::MappedRequest;
use crate::error::{IoError, MapError};

// =============================================================================
// Statistics
// =============================================================================

/// Counters for one mapping.
#[derive(Debug, Default)]
pub struct MappingStats {
    /// Requests mapped with an encryption context
    pub encrypted: AtomicU64,

    /// Requests mapped without a context
    pub passthrough: AtomicU64,

    /// Requests rejected by the mapper
    pub rejected: AtomicU64,

    /// Bytes carried by encrypted requests
    pub bytes_encrypted: AtomicU64,

    /// Requests completed by the backing device
    pub completed: AtomicU64,

    /// Requests failed by the backing device
    pub io_errors: AtomicU64,
}

impl MappingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully mapped request.
    pub fn record_mapped(&self, mapped: &MappedRequest) {
        if mapped.context.is_some() {
            self.encrypted.fetch_add(1, Ordering::Relaxed);
            self.bytes_encrypted
                .fetch_add(mapped.payload.len() as u64, Ordering::Relaxed);
        } else {
            self.passthrough.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the backing device's completion status.
    pub fn record_completion(&self, success: bool) {
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.io_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MappingStatsSnapshot {
        MappingStatsSnapshot {
            encrypted: self.encrypted.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            bytes_encrypted: self.bytes_encrypted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`MappingStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MappingStatsSnapshot {
    pub encrypted: u64,
    pub passthrough: u64,
    pub rejected: u64,
    pub bytes_encrypted: u64,
    pub completed: u64,
    pub io_errors: u64,
}

impl MappingStatsSnapshot {
    /// Requests that made it through the mapper.
    pub fn mapped(&self) -> u64 {
        self.encrypted + self.passthrough
    }
}

// =============================================================================
// Prometheus
// =============================================================================

/// Label value for a mapper rejection.
pub fn map_error_reason(err: &MapError) -> &'static str {
    match err {
        MapError::MisalignedRequest { .. } => "misaligned",
        MapError::DunOverflow { .. } => "dun_overflow",
        MapError::CryptoContextAlreadyPresent => "context_present",
        MapError::OutOfRange { .. } => "out_of_range",
        MapError::UnsupportedOperation(_) => "unsupported",
        MapError::ZoneWriteOutOfOrder { .. } => "zone_out_of_order",
        MapError::ZoneFull { .. } => "zone_full",
        MapError::ZoneBusy { .. } => "zone_busy",
        MapError::PartialSector { .. } => "partial_sector",
    }
}

fn io_error_reason(err: &IoError) -> &'static str {
    match err {
        IoError::OutOfRange { .. } => "out_of_range",
        IoError::PayloadMismatch { .. } => "payload_mismatch",
        IoError::Device(_) => "device",
    }
}

/// Prometheus counters shared by every mapping that registers them.
#[derive(Clone)]
pub struct MapperMetrics {
    /// Mapped requests by `op` and `context` (`encrypted` or `passthrough`)
    mapped_total: IntCounterVec,

    /// Rejected requests by `reason`
    rejected_total: IntCounterVec,

    /// Backing device failures by `reason`
    io_errors_total: IntCounterVec,
}

impl MapperMetrics {
    /// Create the counters and register them with `registry`.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let mapped_total = IntCounterVec::new(
            Opts::new(
                "default_key_requests_mapped_total",
                "Requests remapped onto the backing device",
            ),
            &["op", "context"],
        )?;
        registry.register(Box::new(mapped_total.clone()))?;

        let rejected_total = IntCounterVec::new(
            Opts::new(
                "default_key_requests_rejected_total",
                "Requests rejected before dispatch",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(rejected_total.clone()))?;

        let io_errors_total = IntCounterVec::new(
            Opts::new(
                "default_key_backing_io_errors_total",
                "Requests failed by the backing device",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(io_errors_total.clone()))?;

        Ok(Self {
            mapped_total,
            rejected_total,
            io_errors_total,
        })
    }

    pub fn record_mapped(&self, mapped: &MappedRequest) {
        let context = if mapped.context.is_some() {
            "encrypted"
        } else {
            "passthrough"
        };
        let op = mapped.op.to_string();
        self.mapped_total
            .with_label_values(&[op.as_str(), context])
            .inc();
    }

    pub fn record_rejected(&self, err: &MapError) {
        self.rejected_total
            .with_label_values(&[map_error_reason(err)])
            .inc();
    }

    pub fn record_io_error(&self, err: &IoError) {
        self.io_errors_total
            .with_label_values(&[io_error_reason(err)])
            .inc();
    }

    pub fn rejected(&self, reason: &str) -> u64 {
        self.rejected_total.with_label_values(&[reason]).get()
    }

    pub fn mapped(&self, op: &str, context: &str) -> u64 {
        self.mapped_total.with_label_values(&[op, context]).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CryptoContext, RequestOp};
    use crate::key::{CipherMode, KeyMaterial, KeyType};
    use bytes::Bytes;
    use std::sync::Arc;

    fn mapped(with_context: bool) -> MappedRequest {
        let context = with_context.then(|| {
            let key = KeyMaterial::new(CipherMode::Adiantum, &[1u8; 32], KeyType::Standard).unwrap();
            CryptoContext::new(Arc::new(key), 3)
        });
        MappedRequest {
            op: RequestOp::Write,
            backing_position: 0,
            sectors: 1,
            payload: Bytes::from(vec![0u8; 512]),
            context,
        }
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = MappingStats::new();
        stats.record_mapped(&mapped(true));
        stats.record_mapped(&mapped(false));
        stats.record_rejected();
        stats.record_completion(true);
        stats.record_completion(false);

        let snap = stats.snapshot();
        assert_eq!(snap.encrypted, 1);
        assert_eq!(snap.passthrough, 1);
        assert_eq!(snap.mapped(), 2);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.bytes_encrypted, 512);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.io_errors, 1);
    }

    #[test]
    fn test_prometheus_counters() {
        let registry = Registry::new();
        let metrics = MapperMetrics::new(&registry).unwrap();

        metrics.record_mapped(&mapped(true));
        metrics.record_rejected(&MapError::DunOverflow { dun: 9, max_dun: 8 });

        assert_eq!(metrics.mapped("write", "encrypted"), 1);
        assert_eq!(metrics.rejected("dun_overflow"), 1);
        assert!(!registry.gather().is_empty());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        let _first = MapperMetrics::new(&registry).unwrap();
        assert!(MapperMetrics::new(&registry).is_err());
    }
}
