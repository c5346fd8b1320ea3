//! Carbon block: the virtio-blk device core of the Carbon microVM.
//!
//! The guest sees a virtio-mmio v2 block device ([`devices::MmioTransport`]
//! carrying a [`devices::VirtioBlk`]). Requests are parsed from split
//! virtqueues in guest memory and executed asynchronously by the Linux
//! native AIO backend in [`blockdev`]. Completions are published to the
//! used ring and signalled through an [`interrupt::InterruptLine`].
//!
//! The vCPU loop and platform setup live outside this crate; they forward
//! MMIO exits to an [`devices::MmioBus`] and poll the backend queues.

pub mod interrupt;
pub mod ring_buffer;

#[cfg(target_os = "linux")]
pub mod blockdev;
#[cfg(target_os = "linux")]
pub mod devices;
#[cfg(target_os = "linux")]
pub mod kvm;
#[cfg(target_os = "linux")]
pub mod memory;
