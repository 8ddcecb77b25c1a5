//! Backend inventory for the CLI
//!
//! Describes the mock devices and cipher engine a table line is resolved
//! against.
//!
//! ```yaml
//! devices:
//!   - path: /dev/sda1
//!     capacity_sectors: 2097152
//!   - path: /dev/nvme0n2
//!     name: nvme0n2
//!     capacity_sectors: 4194304
//!     zone_sectors: 524288
//! engine:
//!   modes: [aes-xts-plain64]
//!   wrapped_keys: false
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::SECTOR_SIZE;
use crate::error::{Error, Result};
use crate::mock::{EngineCapabilities, MockBlockDevice, MockCipherEngine, MockDeviceRegistry};
use crate::table::TableLine;

/// One backing device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub path: String,

    /// Name used in status output; defaults to the last path component
    #[serde(default)]
    pub name: Option<String>,

    pub capacity_sectors: u64,

    #[serde(default)]
    pub zone_sectors: Option<u64>,

    #[serde(default = "default_logical_block_size")]
    pub logical_block_size: u32,
}

fn default_logical_block_size() -> u32 {
    SECTOR_SIZE
}

impl DeviceSpec {
    pub fn device_name(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => self.path.rsplit('/').next().unwrap_or(&self.path),
        }
    }

    fn build(&self) -> MockBlockDevice {
        let device = match self.zone_sectors {
            Some(zone_sectors) => {
                MockBlockDevice::zoned(self.device_name(), self.capacity_sectors, zone_sectors)
            }
            None => MockBlockDevice::new(self.device_name(), self.capacity_sectors),
        };
        device.with_logical_block_size(self.logical_block_size)
    }
}

/// Devices plus engine capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,

    #[serde(default)]
    pub engine: EngineCapabilities,
}

impl Inventory {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Inventory(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Inventory(format!("{}: {}", path.display(), e)))?;
        let inventory = Self::from_yaml_str(&contents)?;
        debug!(path = %path.display(), devices = inventory.devices.len(), "inventory loaded");
        Ok(inventory)
    }

    /// Inventory with a single device just large enough for `table`.
    pub fn for_table(table: &TableLine) -> Result<Self> {
        let args = table.target_args()?;
        let capacity = args.start.checked_add(table.length).ok_or_else(|| {
            Error::Inventory(format!("device area {}+{} overflows", args.start, table.length))
        })?;
        Ok(Self {
            devices: vec![DeviceSpec {
                path: args.device_path,
                name: None,
                capacity_sectors: capacity,
                zone_sectors: None,
                logical_block_size: SECTOR_SIZE,
            }],
            engine: EngineCapabilities::default(),
        })
    }

    /// Instantiate the mock registry and engine.
    pub fn build(&self) -> (MockDeviceRegistry, Arc<MockCipherEngine>) {
        let registry = MockDeviceRegistry::new();
        for spec in &self.devices {
            registry.register(&spec.path, Arc::new(spec.build()));
        }
        let engine = Arc::new(MockCipherEngine::with_capabilities(self.engine.clone()));
        (registry, engine)
    }
}
