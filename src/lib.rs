//! bdev-aio: batched asynchronous I/O for a block-device layer.
//!
//! Wraps the Linux kernel AIO interface (`io_setup`, `io_submit`,
//! `io_getevents`) with:
//! - Single and batched submission with bounded exponential backoff
//! - Chunking of large batches into bounded submission calls
//! - Timed completion reaping that maps events back to their requests

pub mod aio;
pub mod bench;
pub mod config;
