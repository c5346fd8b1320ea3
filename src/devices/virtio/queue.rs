//! Split virtqueue: descriptor table, available ring, used ring.
//!
//! ```text
//! Descriptor table (16 bytes each)   Available ring         Used ring
//! ┌──────┬─────┬───────┬──────┐      ┌───────┬─────┐        ┌───────┬─────┐
//! │ addr │ len │ flags │ next │      │ flags │ idx │        │ flags │ idx │
//! ├──────┴─────┴───────┴──────┤      ├───────┴─────┤        ├───────┴─────┤
//! │ ...                       │      │ ring[size]  │ u16    │ ring[size]  │ {id u32, len u32}
//! └───────────────────────────┘      │ used_event  │        │ avail_event │
//!                                    └─────────────┘        └─────────────┘
//! ```
//!
//! The guest publishes a chain by writing its head into `avail.ring`, then
//! bumping `avail.idx` behind a release fence. We read `avail.idx`, issue an
//! acquire fence, and only then read the slot. In the other direction the
//! used element is written first, a release fence follows, and only then is
//! `used.idx` bumped.
//!
//! Wire indices are 16 bits and wrap; slots are `idx % size` for the size
//! the driver negotiated.

use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::memory::{GuestMemory, MemoryError};

/// Descriptor flag: buffer continues in next descriptor.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;

/// Descriptor flag: buffer is device-writable (vs device-readable).
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// Descriptor flag: buffer holds a table of indirect descriptors.
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Errors while walking or publishing a virtqueue.
///
/// All of them are protocol violations by the driver.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Descriptor index {index} out of range for queue size {size}")]
    DescriptorIndex { index: u16, size: u16 },

    #[error("Descriptor chain at head {head} is longer than the queue ({size})")]
    ChainTooLong { head: u16, size: u16 },

    #[error("Indirect descriptor at index {0} is not supported")]
    IndirectUnsupported(u16),

    #[error("Guest memory access failed: {0}")]
    Memory(#[from] MemoryError),

    #[error("Queue is not ready")]
    NotReady,

    #[error("Invalid queue size {size} (max {max})")]
    InvalidSize { size: u16, max: u16 },

    #[error("Malformed request at head {head}: {reason}")]
    InvalidChain { head: u16, reason: &'static str },

    #[error("Available index {avail_idx} is more than {size} ahead of {last_avail_idx}")]
    AvailIndex {
        avail_idx: u16,
        last_avail_idx: u16,
        size: u16,
    },
}

/// A virtqueue descriptor as read from guest memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    /// Size of descriptor in bytes.
    pub const SIZE: u64 = 16;

    pub fn read_from(memory: &GuestMemory, addr: u64) -> Result<Self, MemoryError> {
        let mut buf = [0u8; Self::SIZE as usize];
        memory.read(addr, &mut buf)?;
        Ok(Self {
            addr: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: u16::from_le_bytes([buf[12], buf[13]]),
            next: u16::from_le_bytes([buf[14], buf[15]]),
        })
    }
}

/// One bounds-checked buffer of a descriptor chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestBuffer {
    pub addr: u64,
    pub len: u32,
    /// Device-writable (the guest expects us to fill it).
    pub writable: bool,
}

/// A resolved descriptor chain, buffers in chain order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorChain {
    pub head: u16,
    pub buffers: Vec<GuestBuffer>,
}

/// Ring addresses and size, latched when the queue becomes ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub size: u16,
    pub desc_table: u64,
    pub avail_ring: u64,
    pub used_ring: u64,
}

impl RingLayout {
    fn validate(&self, memory: &GuestMemory) -> Result<(), MemoryError> {
        let size = self.size as u64;
        memory.check_range(self.desc_table, Descriptor::SIZE * size)?;
        // flags + idx + ring + used_event
        memory.check_range(self.avail_ring, 6 + 2 * size)?;
        // flags + idx + ring + avail_event
        memory.check_range(self.used_ring, 6 + 8 * size)
    }
}

/// Which ring an address register refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingPart {
    DescTable,
    AvailRing,
    UsedRing,
}

/// Virtqueue state owned by the MMIO handler.
///
/// Register writes land in the pending fields. On the 0→1 READY transition
/// they are validated and latched into a [`RingLayout`]; from then on only
/// the latched copy is used, until the queue is un-readied or reset.
#[derive(Debug)]
pub struct Virtqueue {
    max_size: u16,
    size: u16,
    desc_table: u64,
    avail_ring: u64,
    used_ring: u64,
    layout: Option<RingLayout>,
    last_avail_idx: Wrapping<u16>,
    used: Arc<UsedRing>,
}

impl Virtqueue {
    pub fn new(max_size: u16) -> Self {
        Self {
            max_size,
            size: 0,
            desc_table: 0,
            avail_ring: 0,
            used_ring: 0,
            layout: None,
            last_avail_idx: Wrapping(0),
            used: Arc::new(UsedRing::default()),
        }
    }

    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    /// Negotiated size: the latched one once ready, the pending one before.
    pub fn size(&self) -> u16 {
        self.layout.map_or(self.size, |l| l.size)
    }

    pub fn is_ready(&self) -> bool {
        self.layout.is_some()
    }

    pub fn layout(&self) -> Option<RingLayout> {
        self.layout
    }

    /// Shared used ring, handed to completion contexts.
    pub fn used(&self) -> &Arc<UsedRing> {
        &self.used
    }

    /// QUEUE_NUM write. Ignored while the queue is live.
    pub fn set_size(&mut self, size: u16) {
        if !self.is_ready() {
            self.size = size;
        }
    }

    /// Write one 32-bit half of a ring address. Ignored while the queue is
    /// live.
    pub fn set_address(&mut self, part: RingPart, high: bool, value: u32) {
        if self.is_ready() {
            return;
        }
        let field = match part {
            RingPart::DescTable => &mut self.desc_table,
            RingPart::AvailRing => &mut self.avail_ring,
            RingPart::UsedRing => &mut self.used_ring,
        };
        *field = if high {
            (*field & 0x0000_0000_ffff_ffff) | ((value as u64) << 32)
        } else {
            (*field & 0xffff_ffff_0000_0000) | value as u64
        };
    }

    /// QUEUE_READY write.
    ///
    /// 0→1 validates the pending size and addresses and latches them. 1→0
    /// drops the latched layout and abandons outstanding completions; the
    /// pending register values are kept.
    pub fn set_ready(&mut self, ready: bool, memory: &GuestMemory) -> Result<(), QueueError> {
        match (self.is_ready(), ready) {
            (false, true) => {
                if self.size == 0 || !self.size.is_power_of_two() || self.size > self.max_size {
                    return Err(QueueError::InvalidSize {
                        size: self.size,
                        max: self.max_size,
                    });
                }
                let layout = RingLayout {
                    size: self.size,
                    desc_table: self.desc_table,
                    avail_ring: self.avail_ring,
                    used_ring: self.used_ring,
                };
                layout.validate(memory)?;
                self.layout = Some(layout);
                self.last_avail_idx = Wrapping(0);
                self.used.activate(layout);
            }
            (true, false) => {
                self.layout = None;
                self.used.deactivate();
            }
            _ => {}
        }
        Ok(())
    }

    /// Back to the post-construction state; abandons in-flight completions.
    pub fn reset(&mut self) {
        self.used.deactivate();
        self.size = 0;
        self.desc_table = 0;
        self.avail_ring = 0;
        self.used_ring = 0;
        self.layout = None;
        self.last_avail_idx = Wrapping(0);
    }

    /// Stop publishing completions for the current ring without touching the
    /// latched layout. Used when the device fails mid-drain.
    pub fn abandon_in_flight(&self) {
        self.used.deactivate();
    }

    /// Pop the next chain head from the available ring, if the guest has
    /// published one.
    ///
    /// The guest can never have more than `size` heads outstanding, so an
    /// index further ahead than that is an error.
    pub fn pop_avail(&mut self, memory: &GuestMemory) -> Result<Option<u16>, QueueError> {
        let layout = self.layout.ok_or(QueueError::NotReady)?;

        let avail_idx = memory.read_u16(layout.avail_ring + 2)?;
        let pending = (Wrapping(avail_idx) - self.last_avail_idx).0;
        if pending == 0 {
            return Ok(None);
        }
        if pending > layout.size {
            return Err(QueueError::AvailIndex {
                avail_idx,
                last_avail_idx: self.last_avail_idx.0,
                size: layout.size,
            });
        }
        // Pairs with the guest's release fence before its avail->idx store.
        fence(Ordering::Acquire);

        let slot = self.last_avail_idx.0 % layout.size;
        let head = memory.read_u16(layout.avail_ring + 4 + slot as u64 * 2)?;
        self.last_avail_idx += Wrapping(1);
        Ok(Some(head))
    }

    /// Resolve the chain starting at `head` into bounds-checked buffers.
    ///
    /// The walk is capped at the queue size, so a `next` cycle ends in
    /// [`QueueError::ChainTooLong`].
    pub fn read_chain(&self, memory: &GuestMemory, head: u16) -> Result<DescriptorChain, QueueError> {
        let layout = self.layout.ok_or(QueueError::NotReady)?;
        let mut buffers = Vec::new();
        let mut index = head;

        loop {
            if index >= layout.size {
                return Err(QueueError::DescriptorIndex {
                    index,
                    size: layout.size,
                });
            }
            if buffers.len() >= layout.size as usize {
                return Err(QueueError::ChainTooLong {
                    head,
                    size: layout.size,
                });
            }

            let desc =
                Descriptor::read_from(memory, layout.desc_table + index as u64 * Descriptor::SIZE)?;
            if desc.flags & VIRTQ_DESC_F_INDIRECT != 0 {
                return Err(QueueError::IndirectUnsupported(index));
            }
            memory.check_range(desc.addr, desc.len as u64)?;

            buffers.push(GuestBuffer {
                addr: desc.addr,
                len: desc.len,
                writable: desc.flags & VIRTQ_DESC_F_WRITE != 0,
            });

            if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            index = desc.next;
        }

        Ok(DescriptorChain { head, buffers })
    }
}

#[derive(Debug, Default)]
struct UsedState {
    generation: u64,
    layout: Option<RingLayout>,
    next_used: Wrapping<u16>,
}

/// The host-written half of a virtqueue, shared with completion contexts.
///
/// Every activation starts a new generation. A completion captures the
/// generation current when its chain was popped and is dropped if the queue
/// has since been reset or un-readied.
#[derive(Debug, Default)]
pub struct UsedRing {
    state: Mutex<UsedState>,
}

impl UsedRing {
    fn activate(&self, layout: RingLayout) {
        let mut state = self.state_lock();
        state.generation += 1;
        state.layout = Some(layout);
        state.next_used = Wrapping(0);
    }

    fn deactivate(&self) {
        let mut state = self.state_lock();
        state.generation += 1;
        state.layout = None;
    }

    fn state_lock(&self) -> MutexGuard<'_, UsedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.state_lock().generation
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.state.try_lock().is_err()
    }

    /// Lock the used ring. Holding the guard serializes completions, so a
    /// caller can check the generation, write its status byte and publish
    /// without racing a reset.
    pub fn lock(&self) -> UsedRingGuard<'_> {
        UsedRingGuard {
            state: self.state_lock(),
        }
    }
}

/// Exclusive access to a [`UsedRing`].
pub struct UsedRingGuard<'a> {
    state: MutexGuard<'a, UsedState>,
}

impl UsedRingGuard<'_> {
    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    /// Whether `generation` still names the live ring.
    pub fn is_current(&self, generation: u64) -> bool {
        self.state.layout.is_some() && self.state.generation == generation
    }

    /// Append `{id, len}` and publish it by bumping `used.idx`.
    pub fn push(&mut self, memory: &GuestMemory, id: u16, len: u32) -> Result<(), QueueError> {
        let layout = self.state.layout.ok_or(QueueError::NotReady)?;

        let slot = self.state.next_used.0 % layout.size;
        let elem = layout.used_ring + 4 + slot as u64 * 8;
        memory.write_u32(elem, id as u32)?;
        memory.write_u32(elem + 4, len)?;

        // The element (and the status byte written before this call) must be
        // visible before the index that publishes it.
        fence(Ordering::Release);

        self.state.next_used += Wrapping(1);
        memory.write_u16(layout.used_ring + 2, self.state.next_used.0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::test_utils::GuestRing;

    const DESC: u64 = 0x1000;
    const AVAIL: u64 = 0x2000;
    const USED: u64 = 0x3000;
    const DATA: u64 = 0x8000;

    fn ready_queue(mem: &GuestMemory, size: u16) -> Virtqueue {
        let mut queue = Virtqueue::new(128);
        queue.set_size(size);
        queue.set_address(RingPart::DescTable, false, DESC as u32);
        queue.set_address(RingPart::AvailRing, false, AVAIL as u32);
        queue.set_address(RingPart::UsedRing, false, USED as u32);
        queue.set_ready(true, mem).unwrap();
        queue
    }

    #[test]
    fn test_chains_resolve_in_order() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let size = 8;
        let ring = GuestRing::new(size, DESC, AVAIL, USED);
        let queue = ready_queue(&mem, size);

        for len in 1..=size {
            let buffers: Vec<_> = (0..len)
                .map(|i| (DATA + i as u64 * 0x100, 0x10 * (i as u32 + 1), i % 2 == 1))
                .collect();
            ring.write_chain(&mem, 0, &buffers);

            let chain = queue.read_chain(&mem, 0).unwrap();
            assert_eq!(chain.head, 0);
            let got: Vec<_> = chain
                .buffers
                .iter()
                .map(|b| (b.addr, b.len, b.writable))
                .collect();
            assert_eq!(got, buffers);
        }
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let ring = GuestRing::new(4, DESC, AVAIL, USED);
        let queue = ready_queue(&mem, 4);

        ring.write_desc(&mem, 0, DATA, 16, VIRTQ_DESC_F_NEXT, 1);
        ring.write_desc(&mem, 1, DATA, 16, VIRTQ_DESC_F_NEXT, 0);
        assert!(matches!(
            queue.read_chain(&mem, 0),
            Err(QueueError::ChainTooLong { head: 0, size: 4 })
        ));
    }

    #[test]
    fn test_bad_descriptors() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let ring = GuestRing::new(4, DESC, AVAIL, USED);
        let queue = ready_queue(&mem, 4);

        assert!(matches!(
            queue.read_chain(&mem, 4),
            Err(QueueError::DescriptorIndex { index: 4, size: 4 })
        ));

        ring.write_desc(&mem, 0, DATA, 16, VIRTQ_DESC_F_NEXT, 9);
        assert!(matches!(
            queue.read_chain(&mem, 0),
            Err(QueueError::DescriptorIndex { index: 9, .. })
        ));

        ring.write_desc(&mem, 0, DATA, 16, VIRTQ_DESC_F_INDIRECT, 0);
        assert!(matches!(
            queue.read_chain(&mem, 0),
            Err(QueueError::IndirectUnsupported(0))
        ));

        ring.write_desc(&mem, 0, 0xfff0, 0x20, 0, 0);
        assert!(matches!(
            queue.read_chain(&mem, 0),
            Err(QueueError::Memory(MemoryError::OutOfBounds { .. }))
        ));
    }

    #[test]
    fn test_ready_validates_size() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let mut queue = Virtqueue::new(128);
        for size in [0, 3, 256] {
            queue.set_size(size);
            assert!(matches!(
                queue.set_ready(true, &mem),
                Err(QueueError::InvalidSize { .. })
            ));
            assert!(!queue.is_ready());
        }
    }

    #[test]
    fn test_ready_validates_ring_bounds() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let mut queue = Virtqueue::new(128);
        queue.set_size(128);
        queue.set_address(RingPart::UsedRing, false, 0xff00);
        assert!(matches!(
            queue.set_ready(true, &mem),
            Err(QueueError::Memory(_))
        ));
        assert!(!queue.is_ready());
    }

    #[test]
    fn test_registers_frozen_while_ready() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let mut queue = ready_queue(&mem, 4);
        queue.set_size(8);
        queue.set_address(RingPart::DescTable, false, 0x5000);
        assert_eq!(
            queue.layout(),
            Some(RingLayout {
                size: 4,
                desc_table: DESC,
                avail_ring: AVAIL,
                used_ring: USED,
            })
        );
    }

    #[test]
    fn test_ready_toggle_relatches() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let mut queue = ready_queue(&mem, 4);

        queue.set_ready(false, &mem).unwrap();
        assert!(!queue.is_ready());
        queue.set_address(RingPart::DescTable, false, 0x4000);
        queue.set_address(RingPart::AvailRing, false, 0x5000);
        queue.set_address(RingPart::UsedRing, false, 0x6000);
        queue.set_ready(true, &mem).unwrap();

        assert_eq!(
            queue.layout(),
            Some(RingLayout {
                size: 4,
                desc_table: 0x4000,
                avail_ring: 0x5000,
                used_ring: 0x6000,
            })
        );
    }

    #[test]
    fn test_address_halves() {
        let mut queue = Virtqueue::new(128);
        queue.set_address(RingPart::AvailRing, true, 0x1);
        queue.set_address(RingPart::AvailRing, false, 0x2000);
        assert_eq!(queue.avail_ring, 0x1_0000_2000);
        queue.set_address(RingPart::AvailRing, false, 0x3000);
        assert_eq!(queue.avail_ring, 0x1_0000_3000);
    }

    #[test]
    fn test_pop_avail_wraps() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let mut queue = ready_queue(&mem, 4);
        assert_eq!(queue.pop_avail(&mem).unwrap(), None);

        queue.last_avail_idx = Wrapping(u16::MAX);
        mem.write_u16(AVAIL + 4 + (u16::MAX % 4) as u64 * 2, 3).unwrap();
        mem.write_u16(AVAIL + 4, 1).unwrap();
        mem.write_u16(AVAIL + 2, 1).unwrap();

        assert_eq!(queue.pop_avail(&mem).unwrap(), Some(3));
        assert_eq!(queue.pop_avail(&mem).unwrap(), Some(1));
        assert_eq!(queue.pop_avail(&mem).unwrap(), None);
    }

    #[test]
    fn test_used_push_publishes() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let ring = GuestRing::new(4, DESC, AVAIL, USED);
        let queue = ready_queue(&mem, 4);
        let generation = queue.used().generation();

        for i in 0..6u16 {
            let mut used = queue.used().lock();
            assert!(used.is_current(generation));
            used.push(&mem, i, 100 + i as u32).unwrap();
        }
        assert_eq!(ring.used_idx(&mem), 6);
        // Slots wrap at the negotiated size.
        assert_eq!(ring.used_elem(&mem, 1), (5, 105));
        assert_eq!(ring.used_elem(&mem, 2), (2, 102));
    }

    #[test]
    fn test_reset_invalidates_generation() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let mut queue = ready_queue(&mem, 4);
        let used = queue.used().clone();
        let generation = used.generation();

        queue.reset();
        assert!(!used.lock().is_current(generation));
        assert!(matches!(
            used.lock().push(&mem, 0, 0),
            Err(QueueError::NotReady)
        ));

        let queue = ready_queue(&mem, 4);
        let used = queue.used().lock();
        assert!(used.generation() > generation);
        assert!(used.is_current(used.generation()));
    }

    #[test]
    fn test_abandon_in_flight_keeps_layout() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let queue = ready_queue(&mem, 4);
        let generation = queue.used().generation();

        queue.abandon_in_flight();
        assert!(queue.is_ready());
        assert!(!queue.used().lock().is_current(generation));
    }

    #[test]
    fn test_pop_avail_rejects_runaway_index() {
        let mem = GuestMemory::new(0x10000).unwrap();
        let mut queue = ready_queue(&mem, 4);

        // Exactly a full ring is fine.
        mem.write_u16(AVAIL + 2, 4).unwrap();
        for _ in 0..4 {
            assert!(queue.pop_avail(&mem).unwrap().is_some());
        }
        assert_eq!(queue.pop_avail(&mem).unwrap(), None);

        mem.write_u16(AVAIL + 2, 9).unwrap();
        assert!(matches!(
            queue.pop_avail(&mem),
            Err(QueueError::AvailIndex {
                avail_idx: 9,
                last_avail_idx: 4,
                size: 4
            })
        ));
        // Nothing was consumed.
        assert_eq!(queue.last_avail_idx, Wrapping(4));
    }
}
