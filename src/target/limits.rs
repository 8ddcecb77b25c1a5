//! Queue limits and device extents exposed to the owning framework

use serde::Serialize;

use crate::domain::BlockDevice;

/// Block-layer limits of the virtual device, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueLimits {
    pub logical_block_size: u32,
    pub physical_block_size: u32,
    pub io_min: u32,
    /// Buffer address mask; addresses must satisfy `addr & dma_alignment == 0`
    pub dma_alignment: u32,
}

impl QueueLimits {
    /// Limits inherited from the backing device.
    pub fn from_device(device: &dyn BlockDevice) -> Self {
        let lbs = device.logical_block_size();
        Self {
            logical_block_size: lbs,
            physical_block_size: lbs,
            io_min: lbs,
            dma_alignment: lbs.saturating_sub(1),
        }
    }

    /// Raise every size limit to at least one crypto sector so no request
    /// can start or end inside one.
    pub fn raise_to_crypto_sector(mut self, crypto_sector_size: u32) -> Self {
        self.logical_block_size = self.logical_block_size.max(crypto_sector_size);
        self.physical_block_size = self.physical_block_size.max(crypto_sector_size);
        self.io_min = self.io_min.max(crypto_sector_size);
        self.dma_alignment = self.logical_block_size.saturating_sub(1);
        self
    }
}

/// Area of the backing device a mapping covers, in sectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceExtent {
    pub device: String,
    pub start: u64,
    pub length: u64,
}
