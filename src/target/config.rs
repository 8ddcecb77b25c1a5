//! Validated mapping configuration
//!
//! [`MappingConfig`] is built once during construction and is read-only
//! afterwards. Every request on the hot path reads it without locking.

use std::fmt;
use std::sync::Arc;

use crate::domain::{BlockDevice, CryptoProfile, SECTOR_SHIFT, SECTOR_SIZE};
use crate::error::ConfigError;
use crate::key::{CipherMode, KeyMaterial, KeyType};

use super::zoned::ZonedAdapter;

/// Smallest crypto sector size in bytes.
pub const MIN_CRYPTO_SECTOR_SIZE: u64 = 512;

/// Largest crypto sector size in bytes.
pub const MAX_CRYPTO_SECTOR_SIZE: u64 = 4096;

// =============================================================================
// Options
// =============================================================================

/// Optional feature arguments from the table line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MappingOptions {
    /// Pass discard requests through to the backing device
    pub allow_discards: bool,

    /// Crypto sector size in bytes (`None` means 512)
    pub sector_size: Option<u64>,

    /// Opt-in for DUNs counted in crypto sectors rather than 512-byte units
    pub iv_large_sectors: bool,

    /// Key is a hardware-wrapped blob
    pub wrapped_key: bool,
}

impl MappingOptions {
    /// Key classification implied by the options.
    pub fn key_type(&self) -> KeyType {
        if self.wrapped_key {
            KeyType::HardwareWrapped
        } else {
            KeyType::Standard
        }
    }
}

// =============================================================================
// Mapping Configuration
// =============================================================================

/// Parsed and validated configuration of one mapping.
pub struct MappingConfig {
    device: Arc<dyn BlockDevice>,
    /// Path the device was looked up by
    device_path: String,
    key: Arc<KeyMaterial>,
    region_base: u64,
    iv_offset: u64,
    start_offset: u64,
    mapped_length: u64,
    crypto_sector_size: u32,
    crypto_sector_bits: u32,
    max_dun: u64,
    dun_byte_width: u32,
    allow_discard: bool,
    iv_large_sectors: bool,
    zone_append_emulated: bool,
}

impl MappingConfig {
    /// Validate the options against the device and compute the DUN bounds.
    ///
    /// Checks run in a fixed order: sector size, `iv_large_sectors`, length
    /// alignment, device area, then zone alignment for zoned devices.
    pub fn build(
        key: KeyMaterial,
        device: Arc<dyn BlockDevice>,
        iv_offset: u64,
        start_offset: u64,
        mapped_length: u64,
        options: MappingOptions,
    ) -> Result<Self, ConfigError> {
        let sector_size = options.sector_size.unwrap_or(MIN_CRYPTO_SECTOR_SIZE);
        if !sector_size.is_power_of_two()
            || !(MIN_CRYPTO_SECTOR_SIZE..=MAX_CRYPTO_SECTOR_SIZE).contains(&sector_size)
        {
            return Err(ConfigError::InvalidSectorSize(sector_size));
        }
        let crypto_sector_size = sector_size as u32;

        if crypto_sector_size != SECTOR_SIZE && !options.iv_large_sectors {
            return Err(ConfigError::MissingIvLargeSectors(crypto_sector_size));
        }

        let sectors_per_crypto_sector = u64::from(crypto_sector_size >> SECTOR_SHIFT);
        if mapped_length % sectors_per_crypto_sector != 0 {
            return Err(ConfigError::UnalignedDeviceLength {
                length: mapped_length,
                sector_size: crypto_sector_size,
            });
        }
        if mapped_length == 0 {
            return Err(ConfigError::EmptyMapping);
        }

        let crypto_sector_bits = crypto_sector_size.trailing_zeros();
        let last_raw_dun = iv_offset
            .checked_add(mapped_length - 1)
            .ok_or(ConfigError::IvOffsetOverflow {
                iv_offset,
                length: mapped_length,
            })?;
        let max_dun = last_raw_dun >> (crypto_sector_bits - SECTOR_SHIFT);
        let dun_byte_width = dun_bytes_for(max_dun);

        let capacity = device.capacity();
        let fits = start_offset
            .checked_add(mapped_length)
            .is_some_and(|end| end <= capacity);
        if !fits {
            return Err(ConfigError::DeviceAreaOutOfRange {
                device: device.name().to_string(),
                start: start_offset,
                length: mapped_length,
                capacity,
            });
        }

        let zone_append_emulated = ZonedAdapter::should_force_positional_write(device.as_ref());
        if let Some(zone_sectors) = device.zone_sectors() {
            if zone_sectors == 0
                || start_offset % zone_sectors != 0
                || mapped_length % zone_sectors != 0
            {
                return Err(ConfigError::ZoneMisaligned {
                    start: start_offset,
                    length: mapped_length,
                    zone_sectors,
                });
            }
        }

        Ok(Self {
            device_path: device.name().to_string(),
            device,
            key: Arc::new(key),
            region_base: 0,
            iv_offset,
            start_offset,
            mapped_length,
            crypto_sector_size,
            crypto_sector_bits,
            max_dun,
            dun_byte_width,
            allow_discard: options.allow_discards,
            iv_large_sectors: options.iv_large_sectors,
            zone_append_emulated,
        })
    }

    /// Set the first virtual sector of the mapped region.
    pub fn with_region_base(mut self, region_base: u64) -> Self {
        self.region_base = region_base;
        self
    }

    /// Record the path the device was opened by, as given on the table
    /// line. Defaults to the device's name.
    pub fn with_device_path(mut self, path: impl Into<String>) -> Self {
        self.device_path = path.into();
        self
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn key(&self) -> &Arc<KeyMaterial> {
        &self.key
    }

    pub fn mode(&self) -> CipherMode {
        self.key.mode()
    }

    pub fn key_type(&self) -> KeyType {
        self.key.key_type()
    }

    pub fn region_base(&self) -> u64 {
        self.region_base
    }

    pub fn iv_offset(&self) -> u64 {
        self.iv_offset
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn mapped_length(&self) -> u64 {
        self.mapped_length
    }

    pub fn crypto_sector_size(&self) -> u32 {
        self.crypto_sector_size
    }

    pub fn crypto_sector_bits(&self) -> u32 {
        self.crypto_sector_bits
    }

    /// Crypto sector size in 512-byte units.
    pub fn sectors_per_crypto_sector(&self) -> u64 {
        u64::from(self.crypto_sector_size >> SECTOR_SHIFT)
    }

    pub fn max_dun(&self) -> u64 {
        self.max_dun
    }

    pub fn dun_byte_width(&self) -> u32 {
        self.dun_byte_width
    }

    pub fn allow_discard(&self) -> bool {
        self.allow_discard
    }

    pub fn iv_large_sectors(&self) -> bool {
        self.iv_large_sectors
    }

    pub fn zone_append_emulated(&self) -> bool {
        self.zone_append_emulated
    }

    /// Whether `[position, position + sectors)` lies inside the mapped region.
    pub fn contains(&self, position: u64, sectors: u64) -> bool {
        let end = self.region_base + self.mapped_length;
        position >= self.region_base
            && position
                .checked_add(sectors)
                .is_some_and(|request_end| request_end <= end)
    }

    /// What the cipher engine must support for this mapping.
    pub fn crypto_profile(&self) -> CryptoProfile {
        CryptoProfile {
            mode: self.mode(),
            key_type: self.key_type(),
            data_unit_size: self.crypto_sector_size,
            dun_bytes: self.dun_byte_width,
        }
    }
}

impl fmt::Debug for MappingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingConfig")
            .field("device", &self.device_path)
            .field("key", &self.key)
            .field("region_base", &self.region_base)
            .field("iv_offset", &self.iv_offset)
            .field("start_offset", &self.start_offset)
            .field("mapped_length", &self.mapped_length)
            .field("crypto_sector_size", &self.crypto_sector_size)
            .field("max_dun", &self.max_dun)
            .field("dun_byte_width", &self.dun_byte_width)
            .field("allow_discard", &self.allow_discard)
            .field("zone_append_emulated", &self.zone_append_emulated)
            .finish()
    }
}

/// Bytes needed to hold `max_dun`; at least one.
fn dun_bytes_for(max_dun: u64) -> u32 {
    let bits = u64::BITS - max_dun.leading_zeros();
    bits.div_ceil(8).max(1)
}
