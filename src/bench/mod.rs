//! Bench driver: writes a file through the AIO queue.
//!
//! The calling thread fills requests and submits them batch by batch while
//! a dedicated reaper thread harvests completions and folds them into per
//! batch state. An optional verify pass reads every block back through
//! single-request submission.

mod buffer;
mod token;

pub use buffer::{pattern_byte, BlockPool, BLOCK_ALIGN};
pub use token::{BatchState, BatchTracker};

use crate::aio::{AioContext, AioQueue, AioRequest};
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Totals from one bench run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BenchReport {
    /// Requests accepted by the kernel.
    pub submitted: usize,
    /// Requests whose completion was reaped.
    pub completed: usize,
    /// Completions carrying a negative errno.
    pub failed: usize,
    /// Completions that moved fewer bytes than requested.
    pub short: usize,
    /// `EAGAIN` retries across all submissions.
    pub retries: u32,
    /// Batches that saw every completion.
    pub batches: usize,
    /// Blocks whose read-back contents did not match, when verifying.
    pub mismatched: usize,
}

/// Reaper settings.
#[derive(Debug, Clone, Copy)]
pub struct ReapConfig {
    pub timeout_ms: u64,
    pub max: usize,
}

/// One prepared write per block of `pool`, grouped `batch_size` to a batch.
///
/// Block `i` lands at offset `i * block_size`. The requests point into
/// `pool`, which must outlive them.
pub fn write_requests(fd: i32, pool: &BlockPool, batch_size: usize) -> Vec<Vec<AioRequest>> {
    let block_size = pool.block_size();
    (0..pool.count())
        .collect::<Vec<_>>()
        .chunks(batch_size.max(1))
        .map(|idxs| {
            idxs.iter()
                .map(|&idx| {
                    let mut req = AioRequest::new(fd);
                    req.add_segment(pool.block(idx));
                    req.prep_pwritev((idx * block_size) as u64);
                    req
                })
                .collect()
        })
        .collect()
}

/// One prepared read per block of `pool`, each tagged with its block index.
pub fn read_requests(fd: i32, pool: &mut BlockPool) -> Vec<AioRequest> {
    let block_size = pool.block_size();
    (0..pool.count())
        .map(|idx| {
            let mut req = AioRequest::new(fd);
            req.add_segment_mut(pool.block_mut(idx));
            req.prep_preadv((idx * block_size) as u64);
            req.set_owner(idx as u64);
            req
        })
        .collect()
}

/// Submit `batches` one after another while a reaper thread harvests them.
///
/// Returns after every request of every fully submitted batch has been
/// reaped. A hard submission error stops further batches and is returned
/// once those have drained. Requests the failed batch got accepted are
/// reaped until the first empty poll; any still in flight after that are
/// only guaranteed finished once the queue's context is destroyed, so the
/// caller must keep `batches` and their buffers alive until the queue drops.
pub fn write_blocks<C: AioContext + 'static>(
    queue: &Arc<AioQueue<C>>,
    batches: &mut [Vec<AioRequest>],
    block: bool,
    reap: ReapConfig,
) -> io::Result<BenchReport> {
    let tracker = Arc::new(Mutex::new(BatchTracker::new(batches.len())));
    let submitting = Arc::new(AtomicBool::new(true));
    let aborted = Arc::new(AtomicBool::new(false));

    let reaper = {
        let queue = Arc::clone(queue);
        let tracker = Arc::clone(&tracker);
        let submitting = Arc::clone(&submitting);
        let aborted = Arc::clone(&aborted);
        thread::Builder::new()
            .name("aio-reaper".to_string())
            .spawn(move || reap_loop(&queue, &tracker, &submitting, &aborted, reap))?
    };

    let mut report = BenchReport::default();
    let mut result = Ok(());

    for (idx, batch) in batches.iter_mut().enumerate() {
        let token = lock(&tracker).begin(batch.len());
        let submitted =
            unsafe { queue.submit_batch(batch.iter_mut(), token, &mut report.retries, block) };
        match submitted {
            Ok(n) => {
                debug!(batch = idx, token, submitted = n, "batch submitted");
                report.submitted += n;
            }
            Err(e) => {
                warn!(batch = idx, error = %e, "batch submission failed, draining");
                let partial = lock(&tracker).abandon(token);
                debug!(token, ?partial, "abandoned failed batch");
                aborted.store(true, Ordering::Release);
                result = Err(e);
                break;
            }
        }
    }
    submitting.store(false, Ordering::Release);

    let reaped = reaper
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "reaper thread panicked"))??;

    report.completed = reaped.completed;
    report.failed = reaped.failed;
    report.short = reaped.short;
    report.batches = reaped.batches;

    result.map(|()| report)
}

/// Submit `requests` one at a time, reap them on the calling thread and
/// count blocks of `pool` whose contents differ from their pattern.
///
/// `requests` must come from `read_requests` over `pool`. On error, reads
/// still in flight keep pointing into `pool` until the queue drops.
pub fn verify_blocks<C: AioContext>(
    queue: &AioQueue<C>,
    requests: &mut [AioRequest],
    pool: &BlockPool,
    reap: ReapConfig,
    retries: &mut u32,
) -> io::Result<usize> {
    let mut in_flight = 0;
    for req in requests.iter_mut() {
        match unsafe { queue.submit(req, retries) } {
            Ok(()) => in_flight += 1,
            Err(e) => {
                drain(queue, in_flight, reap)?;
                return Err(e);
            }
        }
    }
    drain(queue, in_flight, reap)?;

    let block_size = pool.block_size();
    let mut mismatched = 0;
    for (idx, req) in requests.iter().enumerate() {
        let expected = pattern_byte(idx);
        let ok = req.return_value() == Some(block_size as i64)
            && pool.block(idx).iter().all(|&b| b == expected);
        if !ok {
            debug!(block = idx, rval = ?req.return_value(), "verify mismatch");
            mismatched += 1;
        }
    }
    Ok(mismatched)
}

fn drain<C: AioContext>(
    queue: &AioQueue<C>,
    mut in_flight: usize,
    reap: ReapConfig,
) -> io::Result<()> {
    let mut completed = Vec::with_capacity(reap.max);
    while in_flight > 0 {
        completed.clear();
        let max = reap.max.min(in_flight);
        in_flight -= queue.get_next_completed(reap.timeout_ms, &mut completed, max)?;
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Reaped {
    completed: usize,
    failed: usize,
    short: usize,
    batches: usize,
}

fn reap_loop<C: AioContext>(
    queue: &AioQueue<C>,
    tracker: &Mutex<BatchTracker>,
    submitting: &AtomicBool,
    aborted: &AtomicBool,
    reap: ReapConfig,
) -> io::Result<Reaped> {
    let mut reaped = Reaped::default();
    let mut completed: Vec<NonNull<AioRequest>> = Vec::with_capacity(reap.max);

    loop {
        // Sampled before polling so a quiet poll covers every submission.
        let finishing = !submitting.load(Ordering::Acquire);

        completed.clear();
        let n = queue.get_next_completed(reap.timeout_ms, &mut completed, reap.max)?;

        for req in &completed {
            // The caller keeps requests alive until the queue drops.
            let req = unsafe { req.as_ref() };
            let rval = req.return_value().unwrap_or_default();
            reaped.completed += 1;
            if rval < 0 {
                reaped.failed += 1;
                warn!(
                    offset = req.offset(),
                    error = %io::Error::from_raw_os_error(-rval as i32),
                    "write failed"
                );
            } else if (rval as u64) < req.len() {
                reaped.short += 1;
            }

            if let Some(state) = lock(tracker).complete(req.owner(), rval, req.len()) {
                reaped.batches += 1;
                debug!(token = req.owner(), ?state, "batch complete");
            }
        }

        // Fully submitted batches are waited for exactly.
        if !finishing || !lock(tracker).is_empty() {
            continue;
        }
        // After an abort, the failed batch's accepted count is unknown, so
        // its stragglers are reaped until a poll comes back empty.
        if !aborted.load(Ordering::Acquire) || n == 0 {
            return Ok(reaped);
        }
    }
}

fn lock(tracker: &Mutex<BatchTracker>) -> std::sync::MutexGuard<'_, BatchTracker> {
    tracker.lock().unwrap_or_else(|e| e.into_inner())
}

/// Write `config.blocks` blocks to the configured target and optionally
/// read them back.
#[cfg(target_os = "linux")]
pub fn run(config: &crate::config::Config) -> io::Result<BenchReport> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use std::time::Instant;

    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    if config.direct {
        options.custom_flags(libc::O_DIRECT);
    }
    let file = options.open(&config.target)?;
    let fd = file.as_raw_fd();
    let reap = ReapConfig {
        timeout_ms: config.reap_timeout_ms,
        max: config.reap_max,
    };

    let mut pool = BlockPool::new(config.blocks, config.block_size)?;
    pool.fill_pattern();
    let mut writes = write_requests(fd, &pool, config.batch_size);
    let mut read_pool = if config.verify {
        Some(BlockPool::new(config.blocks, config.block_size)?)
    } else {
        None
    };
    let mut reads = read_pool
        .as_mut()
        .map(|pool| read_requests(fd, pool))
        .unwrap_or_default();

    // Declared after the requests and pools so it drops first: destroying
    // the context waits for anything still in flight.
    let queue = Arc::new(AioQueue::open(config.queue_config())?);

    info!(
        path = %config.target.display(),
        blocks = config.blocks,
        block_size = config.block_size,
        batch_size = config.batch_size,
        direct = config.direct,
        "Starting write pass"
    );

    let start = Instant::now();
    let mut report = write_blocks(&queue, &mut writes, config.block, reap)?;
    let elapsed = start.elapsed();
    log_throughput("write", report.completed, config.block_size, elapsed);

    if let Some(read_pool) = &read_pool {
        let start = Instant::now();
        report.mismatched =
            verify_blocks(&queue, &mut reads, read_pool, reap, &mut report.retries)?;
        log_throughput("verify", config.blocks, config.block_size, start.elapsed());
    }

    Ok(report)
}

fn log_throughput(phase: &str, ops: usize, block_size: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        phase,
        ops,
        elapsed_ms = elapsed.as_millis() as u64,
        iops = (ops as f64 / secs) as u64,
        mib_per_sec = (ops * block_size) as f64 / secs / (1024.0 * 1024.0),
        "Pass finished"
    );
}
