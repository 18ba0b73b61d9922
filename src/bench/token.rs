//! Batch tracking for completion correlation.
//!
//! Each submitted batch gets a token that doubles as the owner tag of its
//! requests. The reaper feeds completions back by token until the batch has
//! seen all of its requests.

use slab::Slab;

/// Progress of one in-flight batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchState {
    /// Requests in the batch.
    pub expected: usize,
    /// Completions seen so far.
    pub completed: usize,
    /// Completions carrying a negative errno.
    pub failed: usize,
    /// Completions that moved fewer bytes than requested.
    pub short: usize,
}

impl BatchState {
    fn is_done(&self) -> bool {
        self.completed >= self.expected
    }
}

/// Allocator for batch tokens with O(1) lookup.
pub struct BatchTracker {
    batches: Slab<BatchState>,
}

impl BatchTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            batches: Slab::with_capacity(capacity),
        }
    }

    /// Start tracking a batch of `expected` requests and return its token.
    pub fn begin(&mut self, expected: usize) -> u64 {
        self.batches.insert(BatchState {
            expected,
            ..BatchState::default()
        }) as u64
    }

    /// Record one completion for `token`.
    ///
    /// `rval` is the kernel result, `len` the bytes the request asked for.
    /// Returns the final state once the batch is complete, freeing the token.
    /// Unknown tokens return `None`.
    pub fn complete(&mut self, token: u64, rval: i64, len: u64) -> Option<BatchState> {
        let idx = token as usize;
        let state = self.batches.get_mut(idx)?;

        state.completed += 1;
        if rval < 0 {
            state.failed += 1;
        } else if (rval as u64) < len {
            state.short += 1;
        }

        if state.is_done() {
            Some(self.batches.remove(idx))
        } else {
            None
        }
    }

    pub fn get(&self, token: u64) -> Option<BatchState> {
        self.batches.get(token as usize).copied()
    }

    /// Stop tracking `token` without waiting for its remaining completions.
    ///
    /// Used for a batch whose submission failed part way, where the number
    /// of accepted requests is unknown. Later completions for the token are
    /// ignored by `complete`.
    pub fn abandon(&mut self, token: u64) -> Option<BatchState> {
        self.batches.try_remove(token as usize)
    }

    /// Number of batches still waiting on completions.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}
