//! MMIO (Memory-Mapped I/O) bus for virtio devices.
//!
//! Routes guest MMIO accesses to the device that owns the address.
//!
//! # Memory Layout
//!
//! ```text
//! 0xd000_0000 - 0xd000_00FF  virtio-blk generic registers
//! 0xd000_0100 - 0xd000_01FF  virtio-blk config block
//! ```

use thiserror::Error;
use tracing::trace;

/// Base address for virtio MMIO devices.
pub const VIRTIO_MMIO_BASE: u64 = 0xd000_0000;

/// Size of each virtio MMIO region: 0x100 of registers, then the device
/// config block.
pub const VIRTIO_MMIO_SIZE: u64 = 0x200;

/// IRQ for virtio-blk device.
///
/// We use legacy IRQ 5 which is routed through the IOAPIC.
pub const VIRTIO_BLK_IRQ: u32 = 5;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MmioBusError {
    #[error("MMIO range {base:#x}+{size:#x} overlaps a registered device")]
    Overlap { base: u64, size: u64 },

    #[error("Invalid MMIO range {base:#x}+{size:#x}")]
    InvalidRange { base: u64, size: u64 },
}

/// Trait for devices that respond to MMIO access.
///
/// The offset is relative to the device's base address.
pub trait MmioDevice {
    /// Handle an MMIO read at the given offset.
    fn read(&mut self, offset: u64, data: &mut [u8]);

    /// Handle an MMIO write at the given offset.
    fn write(&mut self, offset: u64, data: &[u8]);
}

struct MmioDeviceEntry {
    base: u64,
    size: u64,
    device: Box<dyn MmioDevice>,
}

/// MMIO bus that routes accesses to registered devices.
pub struct MmioBus {
    /// Registered devices sorted by base address.
    devices: Vec<MmioDeviceEntry>,
}

impl MmioBus {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    /// Register a device for `[base, base + size)`.
    pub fn register(
        &mut self,
        base: u64,
        size: u64,
        device: Box<dyn MmioDevice>,
    ) -> Result<(), MmioBusError> {
        let end = base
            .checked_add(size)
            .filter(|_| size > 0)
            .ok_or(MmioBusError::InvalidRange { base, size })?;
        if self
            .devices
            .iter()
            .any(|e| base < e.base + e.size && e.base < end)
        {
            return Err(MmioBusError::Overlap { base, size });
        }

        self.devices.push(MmioDeviceEntry { base, size, device });
        self.devices.sort_by_key(|e| e.base);
        Ok(())
    }

    fn find_device(&mut self, addr: u64) -> Option<(&mut dyn MmioDevice, u64)> {
        let index = self.devices.partition_point(|e| e.base <= addr).checked_sub(1)?;
        let entry = &mut self.devices[index];
        if addr - entry.base < entry.size {
            Some((entry.device.as_mut(), addr - entry.base))
        } else {
            None
        }
    }

    /// Handle an MMIO read from the guest.
    pub fn read(&mut self, addr: u64, data: &mut [u8]) {
        if let Some((device, offset)) = self.find_device(addr) {
            device.read(offset, data);
        } else {
            trace!(addr, len = data.len(), "read from unmapped MMIO");
            data.fill(0xff);
        }
    }

    /// Handle an MMIO write from the guest.
    pub fn write(&mut self, addr: u64, data: &[u8]) {
        if let Some((device, offset)) = self.find_device(addr) {
            device.write(offset, data);
        } else {
            trace!(addr, len = data.len(), "write to unmapped MMIO");
        }
    }
}

impl Default for MmioBus {
    fn default() -> Self {
        Self::new()
    }
}
