//! Virtio block device implementation.
//!
//! This module implements a virtio block device (virtio-blk) whose requests
//! are executed asynchronously by a [`BlockBackend`].
//!
//! # virtio-blk Protocol
//!
//! The guest communicates with the device using descriptor chains:
//!
//! 1. **Request Header** (16 bytes, device-readable):
//!    - type (4 bytes): 0=IN(read), 1=OUT(write), 4=FLUSH, 8=GET_ID
//!    - reserved (4 bytes)
//!    - sector (8 bytes): starting sector number
//!
//! 2. **Data Buffers** (device-readable for writes, device-writable for reads)
//!
//! 3. **Status** (1 byte, device-writable):
//!    - 0 = OK
//!    - 1 = IOERR
//!    - 2 = UNSUPP
//!
//! # Example Request Flow (Read)
//!
//! ```text
//! Guest                      vCPU thread                 poll thread
//!   │                             │                           │
//!   │ Write descriptors to ring   │                           │
//!   │ Update avail->idx           │                           │
//!   │ Write to QUEUE_NOTIFY ─────►│                           │
//!   │                             │ walk chain                │
//!   │                             │ submit one op per segment │
//!   │                             │                           │ io_getevents
//!   │                             │                           │ last segment done:
//!   │                             │                           │   write status byte
//!   │                             │                           │   push used, bump idx
//!   │◄──────────────────────────────────────────── IRQ pulse ─│
//! ```
//!
//! A request whose completions arrive after the queue was reset belongs to
//! an older generation of the used ring and is dropped without touching
//! guest memory.

use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::blockdev::{
    BlockBackend, BlockDevice, BlockError, IoCompletion, IoKind, IoRequest, SECTOR_SIZE,
};
use crate::memory::GuestMemory;

use super::queue::{DescriptorChain, GuestBuffer, QueueError, UsedRing, Virtqueue};
use super::{DeviceState, VirtioDevice, VIRTIO_DEVICE_BLOCK, VIRTIO_F_VERSION_1};

/// Maximum queue size we support.
pub const QUEUE_MAX_SIZE: u16 = 128;

// Feature bits (virtio 1.1, 5.2.3)
/// Maximum number of segments in a request is in `seg_max`.
pub const VIRTIO_BLK_F_SEG_MAX: u64 = 1 << 2;
/// Block size of disk is in `blk_size`.
pub const VIRTIO_BLK_F_BLK_SIZE: u64 = 1 << 6;
/// Cache flush command support.
pub const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;

// Block request types
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_T_FLUSH: u32 = 4;
const VIRTIO_BLK_T_GET_ID: u32 = 8;

// Block status codes
pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// Length of the GET_ID serial string.
pub const VIRTIO_BLK_ID_BYTES: usize = 20;

const REQUEST_HEADER_SIZE: u32 = 16;

/// Device configuration block as seen by the guest at `MMIO_CONFIG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioBlkConfig {
    /// Capacity in 512-byte sectors.
    pub capacity: u64,
    pub seg_max: u32,
    pub blk_size: u32,
}

impl VirtioBlkConfig {
    /// Size of the config block in bytes.
    pub const SIZE: usize = 24;

    /// Config for a backing store of `size` bytes. A trailing partial
    /// sector is not exposed.
    pub fn for_size(size: u64) -> Self {
        Self {
            capacity: size / SECTOR_SIZE,
            // Every chain carries a header and a status descriptor.
            seg_max: QUEUE_MAX_SIZE as u32 - 2,
            blk_size: SECTOR_SIZE as u32,
        }
    }

    /// virtio 1.1 layout (5.2.4): capacity, size_max, seg_max,
    /// geometry, blk_size.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.capacity.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.seg_max.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.blk_size.to_le_bytes());
        bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    In,
    Out,
    Flush,
    GetId,
    Unsupported(u32),
}

impl From<u32> for RequestKind {
    fn from(value: u32) -> Self {
        match value {
            VIRTIO_BLK_T_IN => RequestKind::In,
            VIRTIO_BLK_T_OUT => RequestKind::Out,
            VIRTIO_BLK_T_FLUSH => RequestKind::Flush,
            VIRTIO_BLK_T_GET_ID => RequestKind::GetId,
            other => RequestKind::Unsupported(other),
        }
    }
}

/// A decoded block request.
#[derive(Debug)]
struct Request {
    kind: RequestKind,
    sector: u64,
    data: Vec<GuestBuffer>,
    status_addr: u64,
}

impl Request {
    /// Split `chain` into header, payload and status.
    fn parse(memory: &GuestMemory, chain: &DescriptorChain) -> Result<Self, QueueError> {
        let head = chain.head;
        let (header, status, data) = match chain.buffers.as_slice() {
            [header, data @ .., status] => (header, status, data),
            _ => {
                return Err(QueueError::InvalidChain {
                    head,
                    reason: "fewer than two descriptors",
                })
            }
        };
        if header.len < REQUEST_HEADER_SIZE {
            return Err(QueueError::InvalidChain {
                head,
                reason: "request header shorter than 16 bytes",
            });
        }
        if !status.writable || status.len == 0 {
            return Err(QueueError::InvalidChain {
                head,
                reason: "status descriptor is not a writable byte",
            });
        }

        let kind = RequestKind::from(memory.read_u32(header.addr)?);
        let sector = memory.read_u64(header.addr + 8)?;

        Ok(Self {
            kind,
            sector,
            data: data.to_vec(),
            status_addr: status.addr,
        })
    }

    /// Backend operations this request turns into.
    fn segment_count(&self) -> usize {
        match self.kind {
            RequestKind::In | RequestKind::Out => self.data.len(),
            RequestKind::Flush => 1,
            RequestKind::GetId | RequestKind::Unsupported(_) => 0,
        }
    }

    fn data_len(&self) -> u64 {
        self.data.iter().map(|b| b.len as u64).sum()
    }
}

#[derive(Debug)]
struct Progress {
    remaining: usize,
    transferred: u32,
    failed: bool,
}

/// A request that has been handed to the backend but not yet published.
///
/// Shared by the completion callbacks of all its segments; the last one to
/// finish publishes the request.
struct PendingRequest {
    head: u16,
    status_addr: u64,
    generation: u64,
    used: Arc<UsedRing>,
    memory: Arc<GuestMemory>,
    state: Arc<DeviceState>,
    progress: Mutex<Progress>,
}

impl PendingRequest {
    fn segment_done(&self, completion: IoCompletion) {
        let transferred = match completion.bytes() {
            Ok(n) if n == completion.len => Some(n),
            Ok(n) => {
                warn!(head = self.head, offset = completion.offset, n, "short transfer");
                None
            }
            Err(e) => {
                warn!(
                    head = self.head,
                    offset = completion.offset,
                    kind = ?completion.kind,
                    "I/O error: {e}"
                );
                None
            }
        };
        self.account(1, transferred);
    }

    /// Mark `count` segments as finished; `transferred` is `None` when they
    /// failed.
    fn account(&self, count: usize, transferred: Option<usize>) {
        let done = {
            let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
            match transferred {
                Some(n) => progress.transferred = progress.transferred.saturating_add(n as u32),
                None => progress.failed = true,
            }
            progress.remaining = progress.remaining.saturating_sub(count);
            (progress.remaining == 0).then_some((progress.failed, progress.transferred))
        };

        if let Some((failed, transferred)) = done {
            let status = if failed {
                VIRTIO_BLK_S_IOERR
            } else {
                VIRTIO_BLK_S_OK
            };
            self.publish(status, transferred);
        }
    }

    /// Write the status byte, append the used element and interrupt the
    /// guest, unless the ring this request came from is gone or the device
    /// has failed.
    ///
    /// The interrupt is raised with the used ring still locked, so a reset
    /// either abandons this completion or clears the interrupt after it.
    fn publish(&self, status: u8, len: u32) {
        let mut used = self.used.lock();
        if !used.is_current(self.generation) {
            debug!(head = self.head, "dropping completion for a reset queue");
            return;
        }
        if self.state.is_failed() {
            debug!(head = self.head, "dropping completion for a failed device");
            return;
        }
        if let Err(e) = self.memory.write_u8(self.status_addr, status) {
            self.state.fail(&e);
            return;
        }
        if let Err(e) = used.push(&self.memory, self.head, len) {
            self.state.fail(&e);
            return;
        }

        trace!(head = self.head, status, len, "request complete");
        self.state.signal_used_buffer();
    }
}

/// Virtio block device.
pub struct VirtioBlk {
    backend: Arc<dyn BlockBackend>,
    config: VirtioBlkConfig,
    serial: [u8; VIRTIO_BLK_ID_BYTES],
}

impl VirtioBlk {
    /// Create a block device of `size` bytes served by `backend`. `serial`
    /// is truncated to 20 bytes for GET_ID.
    pub fn new(backend: Arc<dyn BlockBackend>, size: u64, serial: &str) -> Self {
        let mut id = [0u8; VIRTIO_BLK_ID_BYTES];
        let len = serial.len().min(VIRTIO_BLK_ID_BYTES);
        id[..len].copy_from_slice(&serial.as_bytes()[..len]);

        let config = VirtioBlkConfig::for_size(size);
        debug!(
            capacity = config.capacity,
            serial = %String::from_utf8_lossy(&id[..len]),
            "created virtio-blk"
        );

        Self {
            backend,
            config,
            serial: id,
        }
    }

    /// Serve the guest from queue `queue` of an opened block device. The
    /// serial is the backing file's name.
    pub fn from_device(device: &BlockDevice, queue: usize) -> Result<Self, BlockError> {
        let backend = device.queue(queue)?;
        let serial = device
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(backend, device.size(), &serial))
    }

    pub fn config(&self) -> &VirtioBlkConfig {
        &self.config
    }

    fn execute(
        &self,
        memory: &GuestMemory,
        request: Request,
        pending: Arc<PendingRequest>,
    ) -> Result<(), QueueError> {
        match request.kind {
            RequestKind::In | RequestKind::Out => self.execute_rw(memory, &request, pending),
            RequestKind::Flush => {
                let segment = pending.clone();
                let on_complete = Box::new(move |c: IoCompletion| segment.segment_done(c));
                // SAFETY: a flush carries no buffer.
                if let Err(e) = unsafe { self.backend.submit(IoRequest::flush(), on_complete) } {
                    warn!(head = pending.head, "flush submission failed: {e}");
                    pending.publish(VIRTIO_BLK_S_IOERR, 0);
                }
                Ok(())
            }
            RequestKind::GetId => {
                match request.data.first() {
                    Some(buf) if buf.writable => {
                        let len = (buf.len as usize).min(VIRTIO_BLK_ID_BYTES);
                        memory.write(buf.addr, &self.serial[..len])?;
                        pending.publish(VIRTIO_BLK_S_OK, len as u32);
                    }
                    _ => pending.publish(VIRTIO_BLK_S_IOERR, 0),
                }
                Ok(())
            }
            RequestKind::Unsupported(kind) => {
                debug!(head = pending.head, kind, "unsupported request type");
                pending.publish(VIRTIO_BLK_S_UNSUPP, 0);
                Ok(())
            }
        }
    }

    fn execute_rw(
        &self,
        memory: &GuestMemory,
        request: &Request,
        pending: Arc<PendingRequest>,
    ) -> Result<(), QueueError> {
        let (kind, writable) = match request.kind {
            RequestKind::In => (IoKind::Read, true),
            _ => (IoKind::Write, false),
        };

        if request.data.iter().any(|b| b.writable != writable) {
            debug!(head = pending.head, "payload descriptor has the wrong direction");
            pending.publish(VIRTIO_BLK_S_IOERR, 0);
            return Ok(());
        }
        let in_range = request
            .sector
            .checked_add(request.data_len().div_ceil(SECTOR_SIZE))
            .is_some_and(|end| end <= self.config.capacity);
        if !in_range {
            debug!(
                head = pending.head,
                sector = request.sector,
                len = request.data_len(),
                "request beyond capacity"
            );
            pending.publish(VIRTIO_BLK_S_IOERR, 0);
            return Ok(());
        }

        // Resolve every span before submitting anything, so a bad address
        // cannot leave part of a request in flight.
        let spans = request
            .data
            .iter()
            .map(|b| {
                memory
                    .host_span(b.addr, b.len as u64)
                    .map(|ptr| (ptr, b.len as usize))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if spans.is_empty() {
            pending.publish(VIRTIO_BLK_S_OK, 0);
            return Ok(());
        }

        let mut offset = request.sector * SECTOR_SIZE;
        for (i, &(buf, len)) in spans.iter().enumerate() {
            let io = IoRequest {
                kind,
                buf,
                len,
                offset,
            };
            let segment = pending.clone();
            let on_complete = Box::new(move |c: IoCompletion| segment.segment_done(c));
            // SAFETY: `buf` points into guest memory that `pending` keeps
            // mapped until the callback has run.
            if let Err(e) = unsafe { self.backend.submit(io, on_complete) } {
                warn!(head = pending.head, offset, len, "submission failed: {e}");
                pending.account(spans.len() - i, None);
                break;
            }
            offset += len as u64;
        }
        Ok(())
    }
}

impl VirtioDevice for VirtioBlk {
    fn device_type(&self) -> u32 {
        VIRTIO_DEVICE_BLOCK
    }

    fn avail_features(&self) -> u64 {
        VIRTIO_F_VERSION_1 | VIRTIO_BLK_F_SEG_MAX | VIRTIO_BLK_F_BLK_SIZE | VIRTIO_BLK_F_FLUSH
    }

    fn queue_max_size(&self) -> u16 {
        QUEUE_MAX_SIZE
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let bytes = self.config.to_bytes();
        let start = offset as usize;
        if let Some(src) = start
            .checked_add(data.len())
            .and_then(|end| bytes.get(start..end))
        {
            data.copy_from_slice(src);
        }
    }

    fn process_queue(
        &mut self,
        index: u16,
        queue: &mut Virtqueue,
        memory: &Arc<GuestMemory>,
        state: &Arc<DeviceState>,
    ) -> Result<(), QueueError> {
        let generation = queue.used().generation();

        while let Some(head) = queue.pop_avail(memory)? {
            let chain = queue.read_chain(memory, head)?;
            let request = Request::parse(memory, &chain)?;
            trace!(
                queue = index,
                head,
                kind = ?request.kind,
                sector = request.sector,
                segments = request.data.len(),
                "request"
            );

            let pending = Arc::new(PendingRequest {
                head,
                status_addr: request.status_addr,
                generation,
                used: queue.used().clone(),
                memory: memory.clone(),
                state: state.clone(),
                progress: Mutex::new(Progress {
                    remaining: request.segment_count(),
                    transferred: 0,
                    failed: false,
                }),
            });
            self.execute(memory, request, pending)?;
        }
        Ok(())
    }
}
