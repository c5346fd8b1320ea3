//! Asynchronous block backend over Linux native AIO.
//!
//! A [`BlockDevice`] owns one raw block device (or image file) and a set of
//! independent submission contexts, the [`BlockQueue`]s:
//!
//! ```text
//!                 ┌──────────────────────── BlockDevice ───────────────────┐
//!                 │  file (O_DIRECT)                                        │
//!  submit_read ──►│  queue 0: AioContext ─ eventfd ─ in-flight {tag → op}  │──► poll(0)
//!  submit_write ─►│  queue 1: AioContext ─ eventfd ─ in-flight {tag → op}  │──► poll(1)
//!                 └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Each in-flight operation is recorded under a numeric tag together with
//! its kind and completion callback. The tag is the only thing handed to
//! the kernel; on completion it is looked up in the table, so callbacks are
//! never reconstructed from raw event data.
//!
//! Each queue's eventfd becomes readable when at least one of its
//! operations completed. Reading the eventfd does not reap anything:
//! [`BlockQueue::poll`] must still be called to invoke the callbacks.
//!
//! Queues share no mutable state. One thread may submit while another
//! polls the same queue; the in-flight table is behind a mutex.

pub mod aio;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};
use thiserror::Error;
use tracing::{debug, trace, warn};

use aio::{AioContext, IoEvent, Iocb, IOCB_CMD_FDSYNC, IOCB_CMD_PREAD, IOCB_CMD_PWRITE};

/// Offset and length granularity required for direct I/O.
pub const SECTOR_SIZE: u64 = 512;

/// Default number of submission contexts.
pub const DEFAULT_QUEUE_COUNT: usize = 1;

/// Default per-context queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 128;

/// Errors from the block backend.
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to determine device size: {0}")]
    Size(#[source] std::io::Error),

    #[error("Invalid queue topology: {count} queues of depth {depth}")]
    InvalidTopology { count: usize, depth: usize },

    #[error("Failed to create AIO context: {0}")]
    Setup(#[source] Errno),

    #[error("Failed to create eventfd: {0}")]
    EventFd(#[source] Errno),

    #[error("No such queue: {0}")]
    NoSuchQueue(usize),

    /// `offset` or `len` is not a multiple of [`SECTOR_SIZE`].
    #[error("Unaligned I/O: offset={offset:#x} len={len:#x} (alignment {SECTOR_SIZE})")]
    Unaligned { offset: u64, len: usize },

    #[error("Submission queue full: {0} operations in flight")]
    QueueFull(usize),

    #[error("io_submit failed: {0}")]
    Submit(#[source] Errno),

    #[error("io_getevents failed: {0}")]
    Poll(#[source] Errno),

    #[error("Failed to read eventfd: {0}")]
    Notification(#[source] Errno),
}

/// Backend configuration, supplied once when the device is attached.
#[derive(Debug, Clone)]
pub struct BlockConfig {
    /// Raw block device or image file.
    pub path: PathBuf,
    /// Number of independent submission contexts.
    pub queue_count: usize,
    /// Maximum in-flight operations per context.
    pub queue_depth: usize,
    /// Open with `O_DIRECT`. Some filesystems (tmpfs) refuse it.
    pub direct: bool,
}

impl BlockConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            queue_count: DEFAULT_QUEUE_COUNT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            direct: true,
        }
    }
}

/// Kind of an outstanding operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Flush,
}

/// An operation to submit. `buf` must stay valid until completion.
#[derive(Debug, Clone, Copy)]
pub struct IoRequest {
    pub kind: IoKind,
    pub buf: *mut u8,
    pub len: usize,
    pub offset: u64,
}

impl IoRequest {
    pub fn flush() -> Self {
        Self {
            kind: IoKind::Flush,
            buf: std::ptr::null_mut(),
            len: 0,
            offset: 0,
        }
    }
}

/// Delivered to the completion callback of a finished operation.
#[derive(Debug, Clone, Copy)]
pub struct IoCompletion {
    pub kind: IoKind,
    pub offset: u64,
    pub len: usize,
    /// Bytes transferred, or a negated errno.
    pub result: i64,
}

impl IoCompletion {
    /// Bytes transferred, or the error the kernel reported.
    pub fn bytes(&self) -> Result<usize, Errno> {
        if self.result < 0 {
            Err(Errno::from_raw((-self.result) as i32))
        } else {
            Ok(self.result as usize)
        }
    }
}

/// Callback invoked exactly once when an operation completes.
pub type CompletionFn = Box<dyn FnOnce(IoCompletion) + Send>;

/// A submission context that block requests can be dispatched to.
pub trait BlockBackend: Send + Sync {
    /// Submit `request`. `on_complete` runs exactly once, later, from
    /// whichever thread reaps the completion.
    ///
    /// On error nothing was submitted and `on_complete` is dropped unrun.
    ///
    /// # Safety
    ///
    /// `request.buf` must point at `request.len` bytes that stay valid (and
    /// writable, for reads) until `on_complete` has been invoked.
    unsafe fn submit(&self, request: IoRequest, on_complete: CompletionFn)
        -> Result<(), BlockError>;
}

struct InFlight {
    kind: IoKind,
    offset: u64,
    len: usize,
    on_complete: CompletionFn,
}

#[derive(Default)]
struct InFlightTable {
    next_tag: u64,
    ops: HashMap<u64, InFlight>,
}

/// One independent AIO submission context with its own eventfd.
pub struct BlockQueue {
    index: usize,
    depth: usize,
    // Dropped before `inflight`: io_destroy waits for outstanding operations,
    // so callbacks (and the buffers they keep alive) outlive the kernel's use.
    ctx: AioContext,
    notifier: EventFd,
    inflight: Mutex<InFlightTable>,
    file: Arc<File>,
}

impl std::fmt::Debug for BlockQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockQueue")
            .field("index", &self.index)
            .field("depth", &self.depth)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl BlockQueue {
    fn new(index: usize, depth: usize, file: Arc<File>) -> Result<Self, BlockError> {
        let ctx = AioContext::new(depth as u32).map_err(BlockError::Setup)?;
        let notifier =
            EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
                .map_err(BlockError::EventFd)?;

        Ok(Self {
            index,
            depth,
            ctx,
            notifier,
            inflight: Mutex::new(InFlightTable::default()),
            file,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The eventfd that becomes readable when an operation completes.
    pub fn notifier(&self) -> &EventFd {
        &self.notifier
    }

    /// Number of submitted operations whose callbacks have not run yet.
    pub fn in_flight(&self) -> usize {
        self.table().ops.len()
    }

    fn table(&self) -> MutexGuard<'_, InFlightTable> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Consume pending eventfd notifications, returning how many completions
    /// were signalled since the last call. Results still have to be reaped
    /// with [`BlockQueue::poll`].
    pub fn clear_notification(&self) -> Result<u64, BlockError> {
        match self.notifier.read() {
            Ok(count) => Ok(count),
            Err(Errno::EAGAIN) => Ok(0),
            Err(e) => Err(BlockError::Notification(e)),
        }
    }

    /// Submit a read of `len` bytes at `offset` into `buf`.
    ///
    /// # Safety
    ///
    /// See [`BlockBackend::submit`].
    pub unsafe fn submit_read(
        &self,
        buf: *mut u8,
        len: usize,
        offset: u64,
        on_complete: CompletionFn,
    ) -> Result<(), BlockError> {
        let request = IoRequest {
            kind: IoKind::Read,
            buf,
            len,
            offset,
        };
        unsafe { self.submit(request, on_complete) }
    }

    /// Submit a write of `len` bytes from `buf` at `offset`.
    ///
    /// # Safety
    ///
    /// See [`BlockBackend::submit`].
    pub unsafe fn submit_write(
        &self,
        buf: *const u8,
        len: usize,
        offset: u64,
        on_complete: CompletionFn,
    ) -> Result<(), BlockError> {
        let request = IoRequest {
            kind: IoKind::Write,
            buf: buf as *mut u8,
            len,
            offset,
        };
        unsafe { self.submit(request, on_complete) }
    }

    /// Submit a data sync of the backing file.
    pub fn submit_flush(&self, on_complete: CompletionFn) -> Result<(), BlockError> {
        // SAFETY: a flush carries no buffer.
        unsafe { self.submit(IoRequest::flush(), on_complete) }
    }

    /// Reap completed operations and run their callbacks.
    ///
    /// `Some(Duration::ZERO)` never blocks. Otherwise waits until at least one
    /// operation completes or the timeout expires (`None` waits forever).
    /// Returns the number of callbacks invoked.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<usize, BlockError> {
        let min_nr = match timeout {
            Some(t) if t.is_zero() => 0,
            _ => 1,
        };

        let mut events = vec![IoEvent::default(); self.depth];
        let n = match self.ctx.get_events(min_nr, &mut events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(BlockError::Poll(e)),
        };

        // Callbacks run after the table lock is released so they may submit.
        let completed: Vec<(InFlight, i64)> = {
            let mut table = self.table();
            events[..n]
                .iter()
                .filter_map(|event| match table.ops.remove(&event.data) {
                    Some(op) => Some((op, event.res)),
                    None => {
                        warn!(queue = self.index, tag = event.data, "completion for unknown tag");
                        None
                    }
                })
                .collect()
        };

        let count = completed.len();
        for (op, result) in completed {
            trace!(queue = self.index, kind = ?op.kind, offset = op.offset, result, "completed");
            (op.on_complete)(IoCompletion {
                kind: op.kind,
                offset: op.offset,
                len: op.len,
                result,
            });
        }
        Ok(count)
    }
}

impl BlockBackend for BlockQueue {
    unsafe fn submit(
        &self,
        request: IoRequest,
        on_complete: CompletionFn,
    ) -> Result<(), BlockError> {
        let opcode = match request.kind {
            IoKind::Read => IOCB_CMD_PREAD,
            IoKind::Write => IOCB_CMD_PWRITE,
            IoKind::Flush => IOCB_CMD_FDSYNC,
        };
        if request.kind != IoKind::Flush
            && (request.offset % SECTOR_SIZE != 0 || request.len as u64 % SECTOR_SIZE != 0)
        {
            return Err(BlockError::Unaligned {
                offset: request.offset,
                len: request.len,
            });
        }

        // The entry is inserted before io_submit and the lock is held across
        // it, so a concurrent poll can never reap a tag it cannot find.
        let mut table = self.table();
        if table.ops.len() >= self.depth {
            return Err(BlockError::QueueFull(table.ops.len()));
        }
        let tag = table.next_tag;
        table.next_tag = table.next_tag.wrapping_add(1);

        let mut iocb = Iocb::new(
            opcode,
            self.file.as_raw_fd(),
            request.buf,
            request.len,
            request.offset,
            tag,
            self.notifier.as_fd().as_raw_fd(),
        );
        table.ops.insert(
            tag,
            InFlight {
                kind: request.kind,
                offset: request.offset,
                len: request.len,
                on_complete,
            },
        );

        let mut iocbs = [&mut iocb as *mut Iocb];
        // SAFETY: the caller guarantees the buffer outlives the operation.
        match unsafe { self.ctx.submit(&mut iocbs) } {
            Ok(1) => {
                trace!(
                    queue = self.index,
                    tag,
                    kind = ?request.kind,
                    offset = request.offset,
                    len = request.len,
                    "submitted"
                );
                Ok(())
            }
            Ok(_) => {
                table.ops.remove(&tag);
                Err(BlockError::Submit(Errno::EAGAIN))
            }
            Err(e) => {
                table.ops.remove(&tag);
                Err(BlockError::Submit(e))
            }
        }
    }
}

/// A block device with one or more independent AIO submission contexts.
#[derive(Debug)]
pub struct BlockDevice {
    path: PathBuf,
    size: u64,
    queues: Vec<Arc<BlockQueue>>,
}

impl BlockDevice {
    /// Open `path` with `queue_count` contexts of `queue_depth` each, using
    /// direct I/O.
    pub fn open(
        path: impl AsRef<Path>,
        queue_count: usize,
        queue_depth: usize,
    ) -> Result<Self, BlockError> {
        let config = BlockConfig {
            queue_count,
            queue_depth,
            ..BlockConfig::new(path.as_ref())
        };
        Self::open_with(&config)
    }

    pub fn open_with(config: &BlockConfig) -> Result<Self, BlockError> {
        if config.queue_count == 0
            || config.queue_depth == 0
            || config.queue_depth > u32::MAX as usize
        {
            return Err(BlockError::InvalidTopology {
                count: config.queue_count,
                depth: config.queue_depth,
            });
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if config.direct {
            options.custom_flags(libc::O_DIRECT);
        }
        let mut file = options.open(&config.path).map_err(|source| BlockError::Open {
            path: config.path.clone(),
            source,
        })?;

        // Block devices report a zero length in metadata; seeking works for both.
        let size = file.seek(SeekFrom::End(0)).map_err(BlockError::Size)?;
        let file = Arc::new(file);

        let queues = (0..config.queue_count)
            .map(|i| BlockQueue::new(i, config.queue_depth, file.clone()).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            path = %config.path.display(),
            size,
            queues = config.queue_count,
            depth = config.queue_depth,
            direct = config.direct,
            "opened block device"
        );

        Ok(Self {
            path: config.path.clone(),
            size,
            queues,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the device in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// A shareable handle to queue `index`, e.g. for a polling thread.
    pub fn queue(&self, index: usize) -> Result<Arc<BlockQueue>, BlockError> {
        self.queues
            .get(index)
            .cloned()
            .ok_or(BlockError::NoSuchQueue(index))
    }

    fn queue_ref(&self, index: usize) -> Result<&BlockQueue, BlockError> {
        self.queues
            .get(index)
            .map(|q| q.as_ref())
            .ok_or(BlockError::NoSuchQueue(index))
    }

    /// Submit a read on queue `queue`.
    ///
    /// # Safety
    ///
    /// See [`BlockBackend::submit`].
    pub unsafe fn submit_read(
        &self,
        queue: usize,
        buf: *mut u8,
        len: usize,
        offset: u64,
        on_complete: CompletionFn,
    ) -> Result<(), BlockError> {
        let queue = self.queue_ref(queue)?;
        unsafe { queue.submit_read(buf, len, offset, on_complete) }
    }

    /// Submit a write on queue `queue`.
    ///
    /// # Safety
    ///
    /// See [`BlockBackend::submit`].
    pub unsafe fn submit_write(
        &self,
        queue: usize,
        buf: *const u8,
        len: usize,
        offset: u64,
        on_complete: CompletionFn,
    ) -> Result<(), BlockError> {
        let queue = self.queue_ref(queue)?;
        unsafe { queue.submit_write(buf, len, offset, on_complete) }
    }

    /// Reap completions on queue `queue`. See [`BlockQueue::poll`].
    pub fn poll(&self, queue: usize, timeout: Option<Duration>) -> Result<usize, BlockError> {
        self.queue_ref(queue)?.poll(timeout)
    }
}
