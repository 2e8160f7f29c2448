//! Request bookkeeping.
//!
//! Parents and their per-cluster pieces live in an arena and refer to each
//! other by index, never by owning pointers. A parent carries the pending
//! piece count and the first error observed; completion of the last piece
//! resolves the parent.

use parking_lot::Mutex;
use ploop_error::{PloopError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation flag.
///
/// Queued pieces and control-operation loops poll it; an operation that has
/// become a slot owner is past its cancellation point and runs to
/// completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PloopError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
struct Node {
    pending: u32,
    error: Option<PloopError>,
}

#[derive(Debug, Default)]
struct ArenaState {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
}

/// Fixed-slab arena of in-flight parent requests.
#[derive(Debug, Default)]
pub(crate) struct RequestArena {
    state: Mutex<ArenaState>,
}

impl RequestArena {
    /// Register a parent expecting `pieces` completions.
    pub(crate) fn begin(&self, pieces: u32) -> usize {
        let mut state = self.state.lock();
        let node = Node {
            pending: pieces,
            error: None,
        };
        if let Some(slot) = state.free.pop() {
            state.nodes[slot] = Some(node);
            slot
        } else {
            state.nodes.push(Some(node));
            state.nodes.len() - 1
        }
    }

    /// Complete one piece. The first error wins; later results for the same
    /// parent do not overwrite it. Returns the parent's final result once
    /// the last piece lands, `None` while pieces remain.
    pub(crate) fn complete_piece(&self, parent: usize, result: Result<()>) -> Option<Result<()>> {
        let mut state = self.state.lock();
        let node = state.nodes[parent]
            .as_mut()
            .expect("piece completed for a retired parent");
        node.pending = node.pending.saturating_sub(1);
        if node.error.is_none() {
            if let Err(err) = result {
                node.error = Some(err);
            }
        }
        if node.pending > 0 {
            return None;
        }
        let node = state.nodes[parent].take().expect("node present");
        state.free.push(parent);
        Some(match node.error {
            Some(err) => Err(err),
            None => Ok(()),
        })
    }

    /// Abort pieces that were never issued (translator bailed early).
    pub(crate) fn abandon(&self, parent: usize, unissued: u32) -> Option<Result<()>> {
        let mut result = None;
        for _ in 0..unissued {
            result = self.complete_piece(parent, Ok(()));
        }
        result
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        let state = self.state.lock();
        state.nodes.iter().filter(|node| node.is_some()).count()
    }
}
