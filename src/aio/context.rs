//! Kernel execution context for asynchronous I/O.
//!
//! `AioContext` is the seam between the queue protocol and the kernel. The
//! Linux implementation issues the raw AIO syscalls through `libc::syscall`;
//! libc does not export the `linux/aio_abi.h` structures, so `Iocb` and
//! `IoEvent` mirror them here.

use std::io;
use std::time::Duration;

/// `IOCB_CMD_PREADV` from `linux/aio_abi.h`.
pub const IOCB_CMD_PREADV: u16 = 7;
/// `IOCB_CMD_PWRITEV` from `linux/aio_abi.h`.
pub const IOCB_CMD_PWRITEV: u16 = 8;

/// Kernel I/O control block (`struct iocb`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Iocb {
    pub aio_data: u64,
    #[cfg(target_endian = "little")]
    pub aio_key: u32,
    #[cfg(target_endian = "little")]
    pub aio_rw_flags: i32,
    #[cfg(target_endian = "big")]
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

/// Completion record (`struct io_event`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IoEvent {
    /// `aio_data` of the completed control block.
    pub data: u64,
    /// Address of the completed control block.
    pub obj: u64,
    /// Bytes transferred, or a negative errno.
    pub res: i64,
    pub res2: i64,
}

/// A kernel AIO execution context.
///
/// Implementations must be safe to share between concurrent submitters and
/// reapers; the queue adds no locking of its own.
pub trait AioContext: Send + Sync {
    /// Hand control blocks to the kernel.
    ///
    /// Returns how many leading entries of `iocbs` were accepted, which may be
    /// fewer than offered.
    ///
    /// # Safety
    /// Every pointer must reference a prepared control block whose buffers
    /// stay valid until its completion is reaped.
    unsafe fn submit(&self, iocbs: &mut [*mut Iocb]) -> io::Result<usize>;

    /// Wait up to `timeout` for at least `min_nr` completions, filling
    /// `events` with at most `events.len()` of them.
    fn get_events(
        &self,
        min_nr: usize,
        events: &mut [IoEvent],
        timeout: Duration,
    ) -> io::Result<usize>;
}

#[cfg(target_os = "linux")]
pub use linux::LinuxAio;

#[cfg(target_os = "linux")]
mod linux {
    use super::{AioContext, IoEvent, Iocb};
    use std::io;
    use std::time::Duration;
    use tracing::{debug, warn};

    type AioContextId = libc::c_ulong;

    /// Linux AIO context created with `io_setup` and destroyed on drop.
    pub struct LinuxAio {
        ctx: AioContextId,
        max_iodepth: usize,
    }

    // The context id is an opaque kernel handle; the kernel serializes
    // concurrent io_submit and io_getevents calls on it.
    unsafe impl Send for LinuxAio {}
    unsafe impl Sync for LinuxAio {}

    impl LinuxAio {
        /// Create a context able to hold `max_iodepth` in-flight requests.
        pub fn new(max_iodepth: usize) -> io::Result<Self> {
            let mut ctx: AioContextId = 0;
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_io_setup,
                    max_iodepth as libc::c_long,
                    &mut ctx as *mut AioContextId,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            debug!(max_iodepth, "AIO context created");
            Ok(Self { ctx, max_iodepth })
        }

        /// Depth the context was created with.
        pub fn max_iodepth(&self) -> usize {
            self.max_iodepth
        }
    }

    impl Drop for LinuxAio {
        // io_destroy cancels or waits out every request still in flight, so
        // request memory may be released once this returns.
        fn drop(&mut self) {
            let ret = unsafe { libc::syscall(libc::SYS_io_destroy, self.ctx) };
            if ret < 0 {
                warn!(error = %io::Error::last_os_error(), "io_destroy failed");
            }
        }
    }

    impl AioContext for LinuxAio {
        unsafe fn submit(&self, iocbs: &mut [*mut Iocb]) -> io::Result<usize> {
            if iocbs.is_empty() {
                return Ok(0);
            }
            let ret = libc::syscall(
                libc::SYS_io_submit,
                self.ctx,
                iocbs.len() as libc::c_long,
                iocbs.as_mut_ptr(),
            );
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(ret as usize)
        }

        fn get_events(
            &self,
            min_nr: usize,
            events: &mut [IoEvent],
            timeout: Duration,
        ) -> io::Result<usize> {
            let mut ts = libc::timespec {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_nsec: timeout.subsec_nanos() as libc::c_long,
            };
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_io_getevents,
                    self.ctx,
                    min_nr as libc::c_long,
                    events.len() as libc::c_long,
                    events.as_mut_ptr(),
                    &mut ts as *mut libc::timespec,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(ret as usize)
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

    #[cfg(target_os = "linux")]
    #[test]
    fn test_poll_empty_context() {
        // io_setup is unavailable in some sandboxes
        let ctx = match LinuxAio::new(8) {
            Ok(ctx) => ctx,
            Err(_) => return,
        };
        assert_eq!(ctx.max_iodepth(), 8);

        let mut events = [IoEvent::default(); 4];
        let n = ctx.get_events(1, &mut events, Duration::ZERO).unwrap();
        assert_eq!(n, 0);
    }
}
