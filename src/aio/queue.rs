//! Submission and completion queue over one kernel AIO context.
//!
//! Submission absorbs `EAGAIN` with bounded exponential backoff and splits
//! large batches into chunks of at most `max_submissions_per_call`.
//! Completion reaping performs one bounded wait and maps each event back to
//! the request that produced it.
//!
//! No locking is added here: concurrent submitters and reapers rely on the
//! kernel serializing access to the context.

use super::backoff::{Backoff, RetryPolicy};
use super::context::{AioContext, IoEvent, Iocb};
use super::request::AioRequest;
use std::io;
use std::ptr::NonNull;
use std::time::Duration;
use tracing::{debug, trace};

/// Queue settings supplied by the device layer.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Upper bound on requests handed to one `io_submit` call.
    pub max_submissions_per_call: usize,
    /// Throttle applied after each chunk of a blocking batch.
    pub post_chunk_sleep: Duration,
    /// Depth the kernel context was created with.
    pub max_iodepth: usize,
    /// Backoff applied to `EAGAIN`.
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_submissions_per_call: 16,
            post_chunk_sleep: Duration::ZERO,
            max_iodepth: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

/// Asynchronous I/O queue owning one kernel context.
pub struct AioQueue<C: AioContext> {
    ctx: C,
    config: QueueConfig,
}

#[cfg(target_os = "linux")]
impl AioQueue<super::context::LinuxAio> {
    /// Create a Linux AIO context sized by `config.max_iodepth`.
    pub fn open(config: QueueConfig) -> io::Result<Self> {
        let ctx = super::context::LinuxAio::new(config.max_iodepth)?;
        Ok(Self::with_context(ctx, config))
    }
}

impl<C: AioContext> AioQueue<C> {
    /// Wrap an existing context.
    pub fn with_context(ctx: C, config: QueueConfig) -> Self {
        Self { ctx, config }
    }

    /// Settings this queue submits with.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The kernel context requests are submitted to and reaped from.
    pub fn context(&self) -> &C {
        &self.ctx
    }

    /// Submit a single prepared request.
    ///
    /// `EAGAIN` is retried with backoff, bumping `retries` once per retry.
    /// Any other error, or `EAGAIN` after the retry budget, is returned as is.
    ///
    /// # Safety
    /// `req` and the memory behind its segments must stay valid and must not
    /// move or be modified until its completion has been reaped.
    ///
    /// # Panics
    /// Panics if the kernel reports success with a count other than one.
    pub unsafe fn submit(&self, req: &mut AioRequest, retries: &mut u32) -> io::Result<()> {
        let mut iocbs = [req.iocb_ptr()];
        let mut backoff = Backoff::new(self.config.retry);

        loop {
            match self.ctx.submit(&mut iocbs) {
                Ok(1) => return Ok(()),
                Ok(n) => panic!("io_submit of one request reported {} accepted", n),
                Err(e) if is_eagain(&e) && backoff.wait() => {
                    *retries += 1;
                    trace!(retries = *retries, "io_submit EAGAIN, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Submit a batch of prepared requests, tagging each with `owner`.
    ///
    /// The batch goes out in `ceil(len / max_submissions_per_call)` chunks.
    /// Partially accepted chunks resubmit their remainder; `EAGAIN` backs off
    /// with a budget that starts fresh for every chunk. With `block` set the
    /// queue sleeps `post_chunk_sleep` after each chunk.
    ///
    /// Returns the number of requests accepted. A hard error stops the batch
    /// at the failing chunk; requests already accepted stay in flight.
    ///
    /// # Safety
    /// Same contract as [`AioQueue::submit`], for every request in the batch.
    ///
    /// # Panics
    /// Panics if the kernel reports success with zero requests accepted.
    pub unsafe fn submit_batch<'a, I>(
        &self,
        requests: I,
        owner: u64,
        retries: &mut u32,
        block: bool,
    ) -> io::Result<usize>
    where
        I: IntoIterator<Item = &'a mut AioRequest>,
        I::IntoIter: ExactSizeIterator,
    {
        let mut requests = requests.into_iter();
        let total = requests.len();
        let per_call = self.config.max_submissions_per_call.max(1);
        let max_iodepth = self.config.max_iodepth.max(1);
        let chunks = total.div_ceil(per_call);

        debug!(total, chunks, per_call, "submit_batch start");

        let mut iocbs: Vec<*mut Iocb> = Vec::with_capacity(per_call.min(total));
        let mut backoff = Backoff::new(self.config.retry);
        let mut done_all = 0;

        for chunk in 0..chunks {
            iocbs.clear();
            iocbs.extend(requests.by_ref().take(per_call).map(|req| {
                req.set_owner(owner);
                req.iocb_ptr()
            }));
            trace!(chunk, size = iocbs.len(), "submitting chunk");

            backoff.reset();
            let mut done = 0;
            while done < iocbs.len() {
                let want = (iocbs.len() - done).min(max_iodepth);
                match self.ctx.submit(&mut iocbs[done..done + want]) {
                    Ok(0) => panic!("io_submit reported success with no requests accepted"),
                    Ok(n) => {
                        done += n;
                        backoff.reset();
                    }
                    Err(e) if is_eagain(&e) && backoff.wait() => {
                        *retries += 1;
                        trace!(chunk, retries = *retries, "io_submit EAGAIN, retrying");
                    }
                    Err(e) => {
                        debug!(chunk, submitted = done_all + done, error = %e, "submit_batch failed");
                        return Err(e);
                    }
                }
            }
            done_all += done;

            if block {
                std::thread::sleep(self.config.post_chunk_sleep);
                trace!(chunk, "submit_batch sleep");
            } else {
                trace!(chunk, "submit_batch no sleep");
            }
        }

        debug!(submitted = done_all, retries = *retries, "submit_batch end");
        Ok(done_all)
    }

    /// Harvest up to `max` completed requests into `completed`.
    ///
    /// Waits at most `timeout_ms` (zero polls) for the first completion.
    /// Interrupted waits are retried. Each harvested request has its return
    /// value set before its pointer is pushed. Returns the number harvested.
    ///
    /// Pointers are only valid under the submission contract: the request
    /// memory is still owned by whoever submitted it.
    pub fn get_next_completed(
        &self,
        timeout_ms: u64,
        completed: &mut Vec<NonNull<AioRequest>>,
        max: usize,
    ) -> io::Result<usize> {
        if max == 0 {
            return Ok(0);
        }

        let timeout = Duration::from_millis(timeout_ms);
        let mut events = vec![IoEvent::default(); max];

        let n = loop {
            match self.ctx.get_events(1, &mut events, timeout) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other?,
            }
        };

        for event in &events[..n] {
            // Control blocks are the first field of their request.
            let mut req = match NonNull::new(event.obj as *mut AioRequest) {
                Some(req) => req,
                None => panic!("io_getevents returned a completion without a control block"),
            };
            unsafe { req.as_mut().set_return_value(event.res) };
            completed.push(req);
        }

        if n > 0 {
            trace!(harvested = n, "reaped completions");
        }
        Ok(n)
    }
}

fn is_eagain(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EAGAIN)
}
