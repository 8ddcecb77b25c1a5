//! Status introspection
//!
//! [`StatusView`] is built from the configuration field by field and holds
//! no reference to the key, so nothing rendered from it can contain key
//! bytes.

use std::fmt;

use serde::Serialize;

use crate::domain::SECTOR_SIZE;

use super::config::MappingConfig;

/// Emitted in place of the key.
pub const KEY_PLACEHOLDER: &str = "-";

/// Which status to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusType {
    /// Runtime info; this target has none
    Info,
    /// Reparseable table line
    Table,
}

/// Non-secret description of a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusView {
    pub cipher: String,
    pub iv_offset: u64,
    /// Backing device path, as given at construction
    pub device: String,
    pub start_offset: u64,
    pub allow_discards: bool,
    pub sector_size: u32,
    pub iv_large_sectors: bool,
    pub wrapped_key: bool,
    pub zone_append_emulated: bool,
}

impl StatusView {
    /// Optional arguments in table-line form.
    pub fn feature_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.allow_discards {
            args.push("allow_discards".to_string());
        }
        if self.sector_size != SECTOR_SIZE {
            args.push(format!("sector_size:{}", self.sector_size));
        }
        if self.iv_large_sectors {
            args.push("iv_large_sectors".to_string());
        }
        if self.wrapped_key {
            args.push("wrappedkey_v0".to_string());
        }
        args
    }

    pub fn render(&self, status_type: StatusType) -> String {
        match status_type {
            StatusType::Info => String::new(),
            StatusType::Table => self.to_string(),
        }
    }
}

impl fmt::Display for StatusView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.cipher, KEY_PLACEHOLDER, self.iv_offset, self.device, self.start_offset
        )?;
        let features = self.feature_args();
        if !features.is_empty() {
            write!(f, " {} {}", features.len(), features.join(" "))?;
        }
        Ok(())
    }
}

/// Builds [`StatusView`]s.
pub struct StatusReporter;

impl StatusReporter {
    pub fn describe(cfg: &MappingConfig) -> StatusView {
        StatusView {
            cipher: cfg.mode().name().to_string(),
            iv_offset: cfg.iv_offset(),
            device: cfg.device_path().to_string(),
            start_offset: cfg.start_offset(),
            allow_discards: cfg.allow_discard(),
            sector_size: cfg.crypto_sector_size(),
            iv_large_sectors: cfg.iv_large_sectors(),
            wrapped_key: cfg.key_type().is_wrapped(),
            zone_append_emulated: cfg.zone_append_emulated(),
        }
    }
}
