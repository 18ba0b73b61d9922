//! Kernel AIO submission and completion queue.
//!
//! The pieces, leaves first:
//! - `AioRequest`: one I/O operation and its kernel control block
//! - `AioContext`: the kernel execution context (`LinuxAio` on Linux)
//! - `Backoff`: bounded doubling delay for `EAGAIN` retries
//! - `AioQueue`: submission and completion entry points

mod backoff;
mod context;
mod queue;
mod request;

#[cfg(test)]
pub(crate) mod mock;

pub use backoff::{Backoff, RetryPolicy};
pub use context::{AioContext, IoEvent, Iocb};
#[cfg(target_os = "linux")]
pub use context::LinuxAio;
pub use queue::{AioQueue, QueueConfig};
pub use request::{AioRequest, Op};
