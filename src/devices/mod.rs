//! Device emulation for the VMM.

mod mmio;
pub mod virtio;

pub use mmio::{
    MmioBus, MmioBusError, MmioDevice, VIRTIO_BLK_IRQ, VIRTIO_MMIO_BASE, VIRTIO_MMIO_SIZE,
};
pub use virtio::blk::{VirtioBlk, VirtioBlkConfig};
pub use virtio::mmio::MmioTransport;
