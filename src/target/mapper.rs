//! Per-request remapping and DUN derivation
//!
//! [`RequestMapper::map`] is the hot path. It touches no shared mutable
//! state and never blocks, so any number of callers may run it at once.

use crate::domain::{CryptoContext, MappedRequest, Request, SECTOR_SHIFT};
use crate::error::MapError;

use super::config::MappingConfig;

/// Stateless mapper from virtual requests to backing-device requests.
pub struct RequestMapper;

impl RequestMapper {
    /// Remap `req` onto the backing device and attach its encryption
    /// context if it needs one.
    ///
    /// The caller is expected to have checked that `req` lies inside the
    /// mapped region. Requests without payload and requests marked
    /// `skip_encryption` are remapped but never get a context.
    pub fn map(cfg: &MappingConfig, req: &Request) -> Result<MappedRequest, MapError> {
        if req.has_partial_sector() {
            return Err(MapError::PartialSector {
                bytes: req.payload.len(),
            });
        }

        let out_of_range = || MapError::OutOfRange {
            position: req.position,
            sectors: req.sectors,
            begin: cfg.region_base(),
            length: cfg.mapped_length(),
        };

        // Flushes carry no address of their own.
        let sector_in_target = if req.sectors == 0 {
            req.position.saturating_sub(cfg.region_base())
        } else {
            req.position
                .checked_sub(cfg.region_base())
                .ok_or_else(out_of_range)?
        };
        let backing_position = cfg
            .start_offset()
            .checked_add(sector_in_target)
            .ok_or_else(out_of_range)?;

        let mut mapped = MappedRequest {
            op: req.op,
            backing_position,
            sectors: req.sectors,
            payload: req.payload.clone(),
            context: None,
        };

        if req.skip_encryption || !req.has_data() {
            return Ok(mapped);
        }

        if req.crypt_ctx.is_some() {
            return Err(MapError::CryptoContextAlreadyPresent);
        }

        let raw_dun = cfg
            .iv_offset()
            .checked_add(sector_in_target)
            .ok_or(MapError::DunOverflow {
                dun: u64::MAX,
                max_dun: cfg.max_dun(),
            })?;

        let alignment = cfg.sectors_per_crypto_sector();
        if raw_dun & (alignment - 1) != 0 {
            return Err(MapError::MisalignedRequest {
                position: req.position,
                alignment,
                raw_dun,
            });
        }

        let dun = raw_dun >> (cfg.crypto_sector_bits() - SECTOR_SHIFT);
        if dun > cfg.max_dun() {
            return Err(MapError::DunOverflow {
                dun,
                max_dun: cfg.max_dun(),
            });
        }

        mapped.context = Some(CryptoContext::new(cfg.key().clone(), dun));
        Ok(mapped)
    }
}
