//! Download progress tracking, shared between the controller, every peer
//! session and the disk task.
//!
//! A small plain counter struct updated from the disk write path, made
//! clonable and shareable across tasks via an `Arc` since completion is
//! reported from the disk task rather than read back out of a single owner.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::PieceIndex;

struct Inner {
    total: AtomicUsize,
    completed: AtomicUsize,
}

/// A cheaply clonable handle for reporting and observing a single
/// download's progress.
#[derive(Clone)]
pub struct Progress {
    inner: Arc<Inner>,
}

impl Progress {
    pub fn new(total: usize) -> Self {
        Self { inner: Arc::new(Inner { total: AtomicUsize::new(total), completed: AtomicUsize::new(0) }) }
    }

    /// A magnet download doesn't know its piece count until metadata
    /// arrives, so `new` may start at 0 and `set_total` fills it in later.
    pub fn set_total(&self, total: usize) {
        self.inner.total.store(total, Ordering::SeqCst);
    }

    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::SeqCst)
    }

    pub fn piece_done(&self, index: PieceIndex) {
        let completed = self.inner.completed.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("Piece {} written ({}/{})", index, completed, self.total());
    }

    pub fn completed(&self) -> usize {
        self.inner.completed.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        let total = self.total();
        total > 0 && self.completed() >= total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_completion_against_a_deferred_total() {
        let progress = Progress::new(0);
        assert!(!progress.is_complete());
        progress.set_total(2);
        progress.piece_done(0);
        assert!(!progress.is_complete());
        progress.piece_done(1);
        assert!(progress.is_complete());
        assert_eq!(progress.completed(), 2);
    }
}
