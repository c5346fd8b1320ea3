//! Virtio device infrastructure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Guest                                   │
//! │   virtio driver: fills descriptors, bumps avail->idx,           │
//! │   writes QUEUE_NOTIFY                                           │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            │ MMIO trap        ▲ IRQ pulse
//! ┌──────────────────────────▼──────────────────┴───────────────────┐
//! │  MmioTransport (register machine)                               │
//! │     └─► VirtioDevice::process_queue (vCPU thread)               │
//! │            └─► Virtqueue: pop avail, walk descriptor chain      │
//! │            └─► BlockBackend::submit                             │
//! │  poll thread: completion ─► status byte, used ring, interrupt   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Register state and the available-ring cursor belong to the vCPU thread.
//! The used ring, device status and interrupt status are also touched from
//! the backend's completion context, so they live behind [`DeviceState`]
//! and [`queue::UsedRing`].
//!
//! Reference: <https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.html>

pub mod blk;
pub mod mmio;
pub mod queue;

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::interrupt::InterruptLine;
use crate::memory::GuestMemory;

use queue::{QueueError, Virtqueue};

// ============================================================================
// MMIO Register Offsets (virtio-mmio v2)
// ============================================================================

/// Magic value register - always reads as "virt" (0x74726976).
pub const MMIO_MAGIC_VALUE: u64 = 0x000;

/// Version register - we implement version 2.
pub const MMIO_VERSION: u64 = 0x004;

/// Device type ID register.
pub const MMIO_DEVICE_ID: u64 = 0x008;

/// Vendor ID register.
pub const MMIO_VENDOR_ID: u64 = 0x00c;

/// Device features register (read).
pub const MMIO_DEVICE_FEATURES: u64 = 0x010;

/// Device features selection register (write).
pub const MMIO_DEVICE_FEATURES_SEL: u64 = 0x014;

/// Driver features register (write).
pub const MMIO_DRIVER_FEATURES: u64 = 0x020;

/// Driver features selection register (write).
pub const MMIO_DRIVER_FEATURES_SEL: u64 = 0x024;

/// Queue selection register (write).
pub const MMIO_QUEUE_SEL: u64 = 0x030;

/// Maximum queue size register (read).
pub const MMIO_QUEUE_NUM_MAX: u64 = 0x034;

/// Queue size register (write).
pub const MMIO_QUEUE_NUM: u64 = 0x038;

/// Queue ready register (read/write).
pub const MMIO_QUEUE_READY: u64 = 0x044;

/// Queue notify register (write).
pub const MMIO_QUEUE_NOTIFY: u64 = 0x050;

/// Interrupt status register (read).
pub const MMIO_INTERRUPT_STATUS: u64 = 0x060;

/// Interrupt acknowledge register (write).
pub const MMIO_INTERRUPT_ACK: u64 = 0x064;

/// Device status register (read/write).
pub const MMIO_STATUS: u64 = 0x070;

pub const MMIO_QUEUE_DESC_LOW: u64 = 0x080;
pub const MMIO_QUEUE_DESC_HIGH: u64 = 0x084;
pub const MMIO_QUEUE_AVAIL_LOW: u64 = 0x090;
pub const MMIO_QUEUE_AVAIL_HIGH: u64 = 0x094;
pub const MMIO_QUEUE_USED_LOW: u64 = 0x0a0;
pub const MMIO_QUEUE_USED_HIGH: u64 = 0x0a4;

/// Configuration generation register (read).
pub const MMIO_CONFIG_GENERATION: u64 = 0x0fc;

/// Start of the device-specific configuration block.
pub const MMIO_CONFIG: u64 = 0x100;

// ============================================================================
// Magic and Version
// ============================================================================

/// Magic value "virt" (little-endian).
pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;

/// MMIO version we support.
pub const VIRTIO_MMIO_VERSION: u32 = 2;

/// Our vendor ID (arbitrary, not registered).
pub const VIRTIO_VENDOR_ID: u32 = 0x0;

// ============================================================================
// Device Status Flags
// ============================================================================

/// Guest has acknowledged the device.
pub const STATUS_ACKNOWLEDGE: u32 = 1;

/// Guest has loaded a driver.
pub const STATUS_DRIVER: u32 = 2;

/// Driver is ready.
pub const STATUS_DRIVER_OK: u32 = 4;

/// Feature negotiation complete.
pub const STATUS_FEATURES_OK: u32 = 8;

/// Device hit an unrecoverable error.
pub const STATUS_DEVICE_NEEDS_RESET: u32 = 64;

/// Something went wrong; the driver must reset the device.
pub const STATUS_FAILED: u32 = 128;

// ============================================================================
// Interrupt Status / Features
// ============================================================================

/// Used buffer notification.
pub const INTERRUPT_VRING: u32 = 1 << 0;

/// Configuration change notification.
pub const INTERRUPT_CONFIG_CHANGE: u32 = 1 << 1;

/// VIRTIO_F_VERSION_1 - required for virtio-mmio v2 devices.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// Device types a transport can carry.
pub const VIRTIO_DEVICE_BLOCK: u32 = 2;

/// A device sitting behind the virtio-mmio transport.
pub trait VirtioDevice: Send {
    /// Virtio device id (2 for block).
    fn device_type(&self) -> u32;

    /// Feature bits offered to the driver.
    fn avail_features(&self) -> u64;

    /// Largest queue size the device accepts.
    fn queue_max_size(&self) -> u16;

    /// Number of virtqueues.
    fn queue_count(&self) -> usize {
        1
    }

    /// Read from the device-specific configuration block. `offset` is
    /// relative to the start of the block; out-of-range reads leave `data`
    /// untouched.
    fn read_config(&self, offset: u64, data: &mut [u8]);

    /// Write to the device-specific configuration block.
    fn write_config(&mut self, _offset: u64, _data: &[u8]) {}

    /// Drain new available chains from `queue` (queue number `index`).
    ///
    /// An error is a protocol violation: the transport stops draining and
    /// marks the device FAILED.
    fn process_queue(
        &mut self,
        index: u16,
        queue: &mut Virtqueue,
        memory: &Arc<GuestMemory>,
        state: &Arc<DeviceState>,
    ) -> Result<(), QueueError>;

    /// Return to the post-construction state.
    fn reset(&mut self) {}
}

/// Device state shared between the MMIO handler and completion context.
pub struct DeviceState {
    /// Last value the driver stored in STATUS.
    status: AtomicU32,
    /// Set on protocol violation; cleared only by reset.
    failed: AtomicBool,
    interrupt_status: AtomicU32,
    irq: u32,
    line: Arc<dyn InterruptLine>,
}

impl std::fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceState")
            .field("status", &self.status())
            .field("interrupt_status", &self.interrupt_status())
            .field("irq", &self.irq)
            .finish_non_exhaustive()
    }
}

impl DeviceState {
    pub fn new(line: Arc<dyn InterruptLine>, irq: u32) -> Self {
        Self {
            status: AtomicU32::new(0),
            failed: AtomicBool::new(false),
            interrupt_status: AtomicU32::new(0),
            irq,
            line,
        }
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    /// Device status as the guest reads it. FAILED stays set after a
    /// protocol violation even if the driver overwrites STATUS.
    pub fn status(&self) -> u32 {
        let status = self.status.load(Ordering::SeqCst);
        if self.is_failed() {
            status | STATUS_FAILED
        } else {
            status
        }
    }

    pub fn set_status(&self, value: u32) {
        self.status.store(value, Ordering::SeqCst);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Record a protocol violation. The device stays FAILED until reset.
    pub fn fail(&self, reason: &dyn Display) {
        warn!(irq = self.irq, "virtio device failed: {reason}");
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn interrupt_status(&self) -> u32 {
        self.interrupt_status.load(Ordering::SeqCst)
    }

    /// Clear the interrupt bits present in `value`.
    pub fn ack_interrupt(&self, value: u32) {
        self.interrupt_status.fetch_and(!value, Ordering::SeqCst);
    }

    /// Flag a used-buffer notification and pulse the interrupt line.
    pub fn signal_used_buffer(&self) {
        self.interrupt_status
            .fetch_or(INTERRUPT_VRING, Ordering::SeqCst);
        if let Err(e) = self.line.pulse(self.irq) {
            warn!(irq = self.irq, "failed to pulse interrupt line: {e}");
        }
    }

    /// Clear status, interrupt status and the failed flag.
    pub fn reset(&self) {
        self.status.store(0, Ordering::SeqCst);
        self.interrupt_status.store(0, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);
    }
}
