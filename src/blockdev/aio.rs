//! Linux native AIO (`io_setup` / `io_submit` / `io_getevents`).
//!
//! libc exposes the syscall numbers but not the ABI structures, so the
//! `iocb` and `io_event` layouts from `<linux/aio_abi.h>` are mirrored here.
//!
//! ```text
//!   io_submit(ctx, [iocb])        kernel                io_getevents(ctx)
//!  ───────────────────────► ┌────────────┐ ──────────────────────────────►
//!   aio_data = tag          │ AIO context│  io_event { data = tag, res }
//!   aio_resfd = eventfd ───►│            │──► eventfd += 1 per completion
//!                           └────────────┘
//! ```
//!
//! The kernel copies each `iocb` during `io_submit`, so an `Iocb` only has to
//! outlive the submit call. The data buffer it points to must stay valid
//! until the matching `io_event` has been reaped.

use nix::errno::Errno;
use std::os::fd::RawFd;
use std::time::Duration;

pub const IOCB_CMD_PREAD: u16 = 0;
pub const IOCB_CMD_PWRITE: u16 = 1;
pub const IOCB_CMD_FDSYNC: u16 = 3;

/// Signal `aio_resfd` (an eventfd) when the operation completes.
pub const IOCB_FLAG_RESFD: u32 = 1 << 0;

/// `struct iocb`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Iocb {
    pub aio_data: u64,
    #[cfg(target_endian = "little")]
    pub aio_key: u32,
    pub aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
    pub aio_key: u32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

impl Iocb {
    /// Build a request for `opcode` on `fd`, tagged with `data`, that signals
    /// `resfd` on completion.
    pub fn new(
        opcode: u16,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: u64,
        data: u64,
        resfd: RawFd,
    ) -> Self {
        Self {
            aio_data: data,
            aio_lio_opcode: opcode,
            aio_fildes: fd as u32,
            aio_buf: buf as u64,
            aio_nbytes: len as u64,
            aio_offset: offset as i64,
            aio_flags: IOCB_FLAG_RESFD,
            aio_resfd: resfd as u32,
            ..Default::default()
        }
    }
}

/// `struct io_event`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct IoEvent {
    /// The `aio_data` of the completed `iocb`.
    pub data: u64,
    /// User address of the completed `iocb`.
    pub obj: u64,
    /// Bytes transferred, or a negated errno.
    pub res: i64,
    pub res2: i64,
}

/// An owned kernel AIO context, destroyed on drop.
///
/// `io_destroy` blocks until every outstanding operation has completed, so
/// buffers referenced by in-flight requests are never written after the
/// context is gone.
#[derive(Debug)]
pub struct AioContext {
    id: libc::c_ulong,
}

impl AioContext {
    /// Create a context able to hold `nr_events` concurrent operations.
    pub fn new(nr_events: u32) -> Result<Self, Errno> {
        let mut id: libc::c_ulong = 0;
        // SAFETY: `id` is a valid out-pointer for the duration of the call.
        Errno::result(unsafe {
            libc::syscall(
                libc::SYS_io_setup,
                nr_events as libc::c_long,
                &mut id as *mut libc::c_ulong,
            )
        })?;
        Ok(Self { id })
    }

    /// Submit a batch of requests. Returns how many the kernel accepted.
    ///
    /// # Safety
    ///
    /// Every `iocb` must point at a buffer that stays valid until its
    /// completion is reaped with [`AioContext::get_events`].
    pub unsafe fn submit(&self, iocbs: &mut [*mut Iocb]) -> Result<usize, Errno> {
        let res = Errno::result(unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.id,
                iocbs.len() as libc::c_long,
                iocbs.as_mut_ptr(),
            )
        })?;
        Ok(res as usize)
    }

    /// Reap between `min_nr` and `events.len()` completions.
    ///
    /// `None` waits without a deadline.
    pub fn get_events(
        &self,
        min_nr: usize,
        events: &mut [IoEvent],
        timeout: Option<Duration>,
    ) -> Result<usize, Errno> {
        let mut ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_mut()
            .map_or(std::ptr::null_mut(), |ts| ts as *mut libc::timespec);

        // SAFETY: `events` is writable for `events.len()` entries and `ts_ptr`
        // is either null or points at a live timespec.
        let res = Errno::result(unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                self.id,
                min_nr as libc::c_long,
                events.len() as libc::c_long,
                events.as_mut_ptr(),
                ts_ptr,
            )
        })?;
        Ok(res as usize)
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        // SAFETY: `id` came from a successful io_setup and is destroyed once.
        unsafe {
            libc::syscall(libc::SYS_io_destroy, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_layout() {
        assert_eq!(std::mem::size_of::<Iocb>(), 64);
        assert_eq!(std::mem::size_of::<IoEvent>(), 32);
    }

    #[test]
    fn test_iocb_fields() {
        let iocb = Iocb::new(IOCB_CMD_PWRITE, 3, 0x1000 as *mut u8, 512, 4096, 42, 7);
        assert_eq!(iocb.aio_data, 42);
        assert_eq!(iocb.aio_lio_opcode, IOCB_CMD_PWRITE);
        assert_eq!(iocb.aio_fildes, 3);
        assert_eq!(iocb.aio_buf, 0x1000);
        assert_eq!(iocb.aio_nbytes, 512);
        assert_eq!(iocb.aio_offset, 4096);
        assert_eq!(iocb.aio_flags, IOCB_FLAG_RESFD);
        assert_eq!(iocb.aio_resfd, 7);
    }

    #[test]
    fn test_empty_poll_times_out() {
        let ctx = match AioContext::new(4) {
            Ok(ctx) => ctx,
            Err(Errno::ENOSYS | Errno::EPERM) => return,
            Err(e) => panic!("io_setup failed: {e}"),
        };
        let mut events = [IoEvent::default(); 4];
        let n = ctx
            .get_events(0, &mut events, Some(Duration::ZERO))
            .unwrap();
        assert_eq!(n, 0);
    }
}
