//! Guest physical memory backed by the vm-memory crate.
//!
//! The device core never dereferences a guest address directly. Every access
//! goes through [`GuestMemory`], which checks `addr + len` against the size
//! of the single region starting at guest physical address 0:
//!
//! ```text
//! 0x0000_0000 ┌─────────────────┐
//!             │ descriptor table│ ← guest-chosen, validated per access
//!             │ avail / used    │
//!             │ I/O buffers     │ ← handed to the AIO backend as host spans
//! mem_size    └─────────────────┘
//! ```
//!
//! Buffers that are handed to the block backend are resolved to host
//! pointers with [`GuestMemory::host_span`], which performs the same bounds
//! check before exposing the pointer.

use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

/// Errors raised by guest memory accesses.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to allocate guest memory: {0}")]
    Allocation(#[source] std::io::Error),

    /// The access `[addr, addr + len)` does not fit inside guest memory.
    #[error("Guest access out of bounds: addr={addr:#x} len={len:#x}")]
    OutOfBounds { addr: u64, len: u64 },
}

/// Guest physical memory region.
///
/// A thin wrapper around `GuestMemoryMmap` for a single contiguous region
/// starting at guest physical address 0. The mapping is anonymous and
/// private; the platform layer registers it with KVM via
/// [`GuestMemory::as_raw_parts`].
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    size: u64,
}

impl GuestMemory {
    /// Allocate a new guest memory region of `size` bytes.
    pub fn new(size: u64) -> Result<Self, MemoryError> {
        let regions = vec![(GuestAddress(0), size as usize)];

        let inner = GuestMemoryMmap::from_ranges(&regions).map_err(|e| {
            MemoryError::Allocation(std::io::Error::other(format!(
                "Failed to create guest memory: {}",
                e
            )))
        })?;

        Ok(Self { inner, size })
    }

    /// Size of guest memory in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Get raw parts for KVM memory region registration.
    ///
    /// Returns (host_virtual_address, size) for use with `set_user_memory_region`.
    pub fn as_raw_parts(&self) -> Result<(u64, u64), MemoryError> {
        let host_addr = self.host_span(0, 0)?;
        Ok((host_addr as u64, self.size))
    }

    /// Check that `[addr, addr + len)` lies inside guest memory.
    pub fn check_range(&self, addr: u64, len: u64) -> Result<(), MemoryError> {
        match addr.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds { addr, len }),
        }
    }

    /// Resolve `[addr, addr + len)` to a host pointer for zero-copy I/O.
    ///
    /// The pointer stays valid for as long as this `GuestMemory` is alive.
    /// A zero-length span is allowed anywhere strictly inside the region.
    pub fn host_span(&self, addr: u64, len: u64) -> Result<*mut u8, MemoryError> {
        self.check_range(addr, len)?;
        self.inner
            .get_host_address(GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds { addr, len })
    }

    /// Write bytes at a guest physical address.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let len = data.len() as u64;
        self.check_range(addr, len)?;
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds { addr, len })
    }

    /// Read bytes from a guest physical address into a buffer.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        let len = data.len() as u64;
        self.check_range(addr, len)?;
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds { addr, len })
    }

    /// Write a single byte at a guest physical address.
    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.write(addr, &[value])
    }

    /// Write a 16-bit value at a guest physical address (little-endian).
    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Write a 32-bit value at a guest physical address (little-endian).
    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Write a 64-bit value at a guest physical address (little-endian).
    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}
