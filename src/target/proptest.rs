//! Property-Based Tests for the Request Mapper
//!
//! # Test Properties
//!
//! 1. **Determinism**: the same config and request always map the same way
//! 2. **Alignment**: requests off a crypto-sector boundary are rejected
//! 3. **Bounds**: the last crypto sector maps to `max_dun`, the next one overflows
//! 4. **Pass-through**: skipped and data-less requests never get a context
//! 5. **Sector-size gating**: large sectors need `iv_large_sectors`
//! 6. **Redaction**: status output never contains the key

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;

use super::config::{MappingConfig, MappingOptions};
use super::mapper::RequestMapper;
use super::status::{StatusReporter, StatusType};
use crate::domain::{BlockDevice, Request};
use crate::error::{ConfigError, MapError};
use crate::key::{CipherMode, KeyMaterial, KeyType};
use crate::mock::MockBlockDevice;

// =============================================================================
// Property Strategies
// =============================================================================

/// Crypto sector sizes in bytes.
fn sector_size_strategy() -> impl Strategy<Value = u64> {
    prop::sample::select(vec![512u64, 1024, 2048, 4096])
}

/// Large crypto sector sizes only.
fn large_sector_size_strategy() -> impl Strategy<Value = u64> {
    prop::sample::select(vec![1024u64, 2048, 4096])
}

fn mode_strategy() -> impl Strategy<Value = CipherMode> {
    prop::sample::select(CipherMode::ALL.to_vec())
}

fn build(
    mode: CipherMode,
    key: &[u8],
    iv_offset: u64,
    start: u64,
    length: u64,
    sector_size: u64,
) -> Result<MappingConfig, ConfigError> {
    let key = KeyMaterial::new(mode, key, KeyType::Standard)?;
    let device: Arc<dyn BlockDevice> = Arc::new(MockBlockDevice::new("prop0", start + length));
    let options = MappingOptions {
        sector_size: Some(sector_size),
        iv_large_sectors: sector_size != 512,
        ..Default::default()
    };
    MappingConfig::build(key, device, iv_offset, start, length, options)
}

fn xts(iv_offset: u64, start: u64, length: u64, sector_size: u64) -> MappingConfig {
    build(CipherMode::Aes256Xts, &[0x11; 64], iv_offset, start, length, sector_size)
        .expect("valid config")
}

// =============================================================================
// Mapping Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: mapping is a pure function of config and request.
    #[test]
    fn prop_map_is_deterministic(
        iv_offset in 0u64..(1 << 40),
        start in 0u64..(1 << 20),
        crypto_sectors in 1u64..4096,
        sector_size in sector_size_strategy(),
        index in any::<prop::sample::Index>(),
    ) {
        let spc = sector_size / 512;
        let iv_offset = iv_offset * spc;
        let length = crypto_sectors * spc;
        let cfg = xts(iv_offset, start, length, sector_size);

        let position = index.index(crypto_sectors as usize) as u64 * spc;
        let req = Request::read(position, spc);

        let first = RequestMapper::map(&cfg, &req)?;
        let second = RequestMapper::map(&cfg, &req)?;
        prop_assert_eq!(first.backing_position, second.backing_position);
        prop_assert_eq!(first.dun(), second.dun());
        prop_assert_eq!(first.backing_position, start + position);
        prop_assert_eq!(first.dun(), Some((iv_offset + position) / spc));
    }

    /// Property: positions off a crypto-sector boundary are misaligned.
    #[test]
    fn prop_misaligned_rejected(
        sector_size in large_sector_size_strategy(),
        crypto_sector in 0u64..256,
        offset in any::<prop::sample::Index>(),
    ) {
        let spc = sector_size / 512;
        let offset = 1 + offset.index(spc as usize - 1) as u64;
        let cfg = xts(0, 0, 256 * spc, sector_size);

        let position = crypto_sector * spc + offset;
        let result = RequestMapper::map(&cfg, &Request::read(position, 1));
        prop_assert!(
            matches!(result, Err(MapError::MisalignedRequest { alignment, .. }) if alignment == spc),
            "expected misalignment, got {:?}",
            result
        );
    }

    /// Property: the last crypto sector maps to max_dun and the next overflows.
    #[test]
    fn prop_bounds(
        iv_crypto_sectors in 0u64..(1 << 32),
        crypto_sectors in 1u64..8192,
        sector_size in sector_size_strategy(),
    ) {
        let spc = sector_size / 512;
        let length = crypto_sectors * spc;
        let cfg = xts(iv_crypto_sectors * spc, 0, length, sector_size);

        let last = RequestMapper::map(&cfg, &Request::read(length - spc, spc))?;
        prop_assert_eq!(last.dun(), Some(cfg.max_dun()));

        let past = RequestMapper::map(&cfg, &Request::read(length, spc));
        prop_assert!(
            matches!(past, Err(MapError::DunOverflow { dun, max_dun }) if dun == max_dun + 1),
            "expected overflow, got {:?}",
            past
        );
    }

    /// Property: skipped and data-less requests are never given a context.
    #[test]
    fn prop_passthrough_has_no_context(
        sector_size in sector_size_strategy(),
        position in 0u64..2048,
        sectors in 1u64..64,
    ) {
        let cfg = xts(0, 0, 4096, sector_size);

        let skipped = RequestMapper::map(&cfg, &Request::read(position, sectors).with_skip_encryption())?;
        prop_assert!(skipped.context.is_none());

        let discard = RequestMapper::map(&cfg, &Request::discard(position, sectors))?;
        prop_assert!(discard.context.is_none());

        let empty = RequestMapper::map(&cfg, &Request::read(position, 0))?;
        prop_assert!(empty.context.is_none());
    }

    /// Property: large sectors without iv_large_sectors always fail; with it they succeed.
    #[test]
    fn prop_sector_size_gating(
        sector_size in large_sector_size_strategy(),
        crypto_sectors in 1u64..1024,
    ) {
        let length = crypto_sectors * (sector_size / 512);
        let device: Arc<dyn BlockDevice> = Arc::new(MockBlockDevice::new("prop0", length));
        let key = || KeyMaterial::new(CipherMode::Adiantum, &[5u8; 32], KeyType::Standard).unwrap();

        let without = MappingOptions { sector_size: Some(sector_size), ..Default::default() };
        let result = MappingConfig::build(key(), Arc::clone(&device), 0, 0, length, without);
        prop_assert_eq!(result.err(), Some(ConfigError::MissingIvLargeSectors(sector_size as u32)));

        let with = MappingOptions { iv_large_sectors: true, ..without };
        prop_assert!(MappingConfig::build(key(), device, 0, 0, length, with).is_ok());
    }

    /// Property: no rendering of the status contains the key.
    #[test]
    fn prop_status_never_leaks_key(
        mode in mode_strategy(),
        seed in prop::collection::vec(any::<u8>(), 64),
        iv_offset in 0u64..(1 << 20),
    ) {
        let key = &seed[..mode.key_size()];
        prop_assume!(key.iter().any(|b| *b != key[0]));
        let cfg = build(mode, key, iv_offset, 0, 2048, 512)?;
        let view = StatusReporter::describe(&cfg);

        let table = view.render(StatusType::Table);
        let json = serde_json::to_string(&view).unwrap();
        let key_hex = hex::encode(key);
        for rendered in [&table, &json, &format!("{:?}", view), &format!("{:?}", cfg)] {
            prop_assert!(!rendered.to_lowercase().contains(&key_hex));
            prop_assert!(!rendered.as_bytes().windows(key.len()).any(|w| w == key));
        }
    }
}
