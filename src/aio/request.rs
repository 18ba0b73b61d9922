//! A single asynchronous I/O request.
//!
//! The request owns its kernel control block but not the memory its
//! segments point at. That memory belongs to the caller and must stay valid
//! and untouched from submission until the completion has been reaped.

use super::context::{Iocb, IOCB_CMD_PREADV, IOCB_CMD_PWRITEV};
use std::fmt;
use std::os::unix::io::RawFd;

/// Direction of a prepared request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

/// One vectored read or write.
///
/// `iocb` is the first field of a `#[repr(C)]` struct, so the control block
/// address the kernel hands back in a completion is the request address.
#[repr(C)]
pub struct AioRequest {
    iocb: Iocb,
    iov: Vec<libc::iovec>,
    fd: RawFd,
    offset: u64,
    length: u64,
    op: Option<Op>,
    owner: u64,
    rval: Option<i64>,
}

// Segment pointers reference caller-owned memory; the caller already
// guarantees it outlives the request's time in flight.
unsafe impl Send for AioRequest {}

impl AioRequest {
    /// Create an empty request against `fd`.
    pub fn new(fd: RawFd) -> Self {
        Self {
            iocb: Iocb::default(),
            iov: Vec::new(),
            fd,
            offset: 0,
            length: 0,
            op: None,
            owner: 0,
            rval: None,
        }
    }

    /// Append a source segment for a write.
    pub fn add_segment(&mut self, buf: &[u8]) {
        self.push_iovec(buf.as_ptr() as *mut u8, buf.len());
    }

    /// Append a destination segment for a read.
    pub fn add_segment_mut(&mut self, buf: &mut [u8]) {
        self.push_iovec(buf.as_mut_ptr(), buf.len());
    }

    fn push_iovec(&mut self, base: *mut u8, len: usize) {
        self.iov.push(libc::iovec {
            iov_base: base as *mut libc::c_void,
            iov_len: len,
        });
        self.length += len as u64;
    }

    /// Prepare a vectored write of all segments at `offset`.
    pub fn prep_pwritev(&mut self, offset: u64) {
        self.prep(Op::Write, IOCB_CMD_PWRITEV, offset);
    }

    /// Prepare a vectored read into all segments at `offset`.
    pub fn prep_preadv(&mut self, offset: u64) {
        self.prep(Op::Read, IOCB_CMD_PREADV, offset);
    }

    fn prep(&mut self, op: Op, opcode: u16, offset: u64) {
        self.offset = offset;
        self.op = Some(op);
        self.iocb = Iocb {
            aio_lio_opcode: opcode,
            aio_fildes: self.fd as u32,
            aio_buf: self.iov.as_ptr() as u64,
            aio_nbytes: self.iov.len() as u64,
            aio_offset: offset as i64,
            ..Iocb::default()
        };
    }

    /// Clear segments and result so the request can be filled again.
    pub fn reset(&mut self) {
        self.iocb = Iocb::default();
        self.iov.clear();
        self.offset = 0;
        self.length = 0;
        self.op = None;
        self.owner = 0;
        self.rval = None;
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total bytes across all segments.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn op(&self) -> Option<Op> {
        self.op
    }

    pub fn segments(&self) -> &[libc::iovec] {
        &self.iov
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }

    pub fn set_owner(&mut self, owner: u64) {
        self.owner = owner;
    }

    /// Bytes transferred or negative errno; `None` until reaped.
    pub fn return_value(&self) -> Option<i64> {
        self.rval
    }

    pub(crate) fn set_return_value(&mut self, rval: i64) {
        self.rval = Some(rval);
    }

    /// The control block handed to the kernel.
    ///
    /// The iovec array pointer and count are refreshed here, so segments
    /// added after `prep_*` are included and a reallocated array is never
    /// left dangling.
    pub(crate) fn iocb_ptr(&mut self) -> *mut Iocb {
        self.iocb.aio_buf = self.iov.as_ptr() as u64;
        self.iocb.aio_nbytes = self.iov.len() as u64;
        &mut self.iocb
    }
}

impl fmt::Display for AioRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aio: ")?;
        for (i, iov) in self.iov.iter().enumerate() {
            write!(f, "\n [{}] {:#x}~{:x}", i, iov.iov_base as usize, iov.iov_len)?;
        }
        Ok(())
    }
}

impl fmt::Debug for AioRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AioRequest")
            .field("fd", &self.fd)
            .field("op", &self.op)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("segments", &self.iov.len())
            .field("owner", &self.owner)
            .field("rval", &self.rval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prep_pwritev() {
        let a = vec![1u8; 512];
        let b = vec![2u8; 1024];
        let mut req = AioRequest::new(7);
        req.add_segment(&a);
        req.add_segment(&b);
        req.prep_pwritev(4096);

        assert_eq!(req.len(), 1536);
        assert_eq!(req.op(), Some(Op::Write));
        assert_eq!(req.offset(), 4096);
        assert_eq!(req.iocb.aio_lio_opcode, IOCB_CMD_PWRITEV);
        assert_eq!(req.iocb.aio_fildes, 7);
        assert_eq!(req.iocb.aio_nbytes, 2);
        assert_eq!(req.iocb.aio_offset, 4096);
        assert_eq!(req.iocb.aio_buf, req.segments().as_ptr() as u64);
        assert_eq!(req.return_value(), None);
    }

    #[test]
    fn test_prep_preadv() {
        let mut buf = vec![0u8; 4096];
        let mut req = AioRequest::new(3);
        req.add_segment_mut(&mut buf);
        req.prep_preadv(0);

        assert_eq!(req.op(), Some(Op::Read));
        assert_eq!(req.iocb.aio_lio_opcode, IOCB_CMD_PREADV);
        assert_eq!(req.segments()[0].iov_base as usize, buf.as_ptr() as usize);
    }

    #[test]
    fn test_segments_added_after_prep_reach_iocb() {
        let bufs: Vec<Vec<u8>> = (0..9).map(|i| vec![i as u8; 512]).collect();
        let mut req = AioRequest::new(4);
        req.add_segment(&bufs[0]);
        req.prep_pwritev(0);
        // Growing past the first allocation moves the iovec array
        for buf in &bufs[1..] {
            req.add_segment(buf);
        }

        let iocb = unsafe { &*req.iocb_ptr() };
        assert_eq!(iocb.aio_nbytes, 9);
        assert_eq!(iocb.aio_buf, req.segments().as_ptr() as u64);
        assert_eq!(iocb.aio_lio_opcode, IOCB_CMD_PWRITEV);
        assert_eq!(req.len(), 9 * 512);
    }

    #[test]
    fn test_iocb_is_request_address() {
        let mut req = AioRequest::new(0);
        let iocb = req.iocb_ptr() as usize;
        assert_eq!(iocb, &req as *const AioRequest as usize);
    }

    #[test]
    fn test_reset() {
        let buf = vec![0u8; 16];
        let mut req = AioRequest::new(5);
        req.add_segment(&buf);
        req.prep_pwritev(32);
        req.set_owner(9);
        req.set_return_value(16);

        req.reset();
        assert!(req.is_empty());
        assert!(req.segments().is_empty());
        assert_eq!(req.owner(), 0);
        assert_eq!(req.return_value(), None);
        assert_eq!(req.op(), None);
        assert_eq!(req.fd(), 5);
    }

    #[test]
    fn test_display_lists_segments() {
        let buf = vec![0u8; 0x200];
        let mut req = AioRequest::new(0);
        req.add_segment(&buf);
        req.add_segment(&buf[..0x10]);

        let rendered = req.to_string();
        let base = buf.as_ptr() as usize;
        assert_eq!(
            rendered,
            format!("aio: \n [0] {:#x}~200\n [1] {:#x}~10", base, base)
        );
    }

    #[test]
    fn test_display_empty() {
        assert_eq!(AioRequest::new(0).to_string(), "aio: ");
    }
}
