//! The piece work queue (spec.md §4.5): a bounded multi-producer,
//! multi-consumer queue of outstanding pieces that every session pulls work
//! from and may push back onto when a peer can't serve a piece or a
//! downloaded piece fails its hash check.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};

use crate::{PieceIndex, Sha1Hash};

/// A unit of work: a piece that still needs to be downloaded.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PieceWork {
    pub index: PieceIndex,
    pub length: u32,
    pub hash: Sha1Hash,
}

/// The outcome of attempting to download and verify a piece, reported by a
/// session back to the disk task (spec.md §4.4 item 4, §8 S7).
#[derive(Debug)]
pub(crate) enum PieceResult {
    /// The piece was downloaded, hashed successfully, and should be written
    /// to disk at the given index with the given contiguous buffer.
    Done { index: PieceIndex, data: Vec<u8> },
}

/// A shared, bounded pool of piece work.
///
/// Closing the queue can't be modeled by simply dropping every sender, since
/// sessions hold cloned senders for the lifetime of their connection (to
/// requeue work a peer failed to serve) and the controller has no way to
/// reach into each session task to drop them early. Instead, closing is a
/// separate broadcasted signal: `take` races a queue receive against the
/// shutdown watch channel, so any session currently parked in `take` wakes
/// up immediately once the last piece has been accounted for.
#[derive(Clone)]
pub(crate) struct WorkQueue {
    tx: mpsc::Sender<PieceWork>,
    rx: Arc<Mutex<mpsc::Receiver<PieceWork>>>,
    shutdown: watch::Receiver<bool>,
}

/// The handle used to close a [`WorkQueue`] once every piece has been
/// accounted for (either downloaded or abandoned).
pub(crate) struct WorkQueueCloser {
    shutdown: watch::Sender<bool>,
}

impl WorkQueueCloser {
    pub fn close(&self) {
        // only fails if every receiver (every WorkQueue clone) has already
        // been dropped, which means there's nothing left to wake up anyway.
        let _ = self.shutdown.broadcast(true);
    }
}

impl WorkQueue {
    /// Builds a new queue pre-filled with the given work items.
    pub fn new(work: Vec<PieceWork>) -> (Self, WorkQueueCloser) {
        let (tx, rx) = mpsc::channel(work.len().max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut queue = Self { tx, rx: Arc::new(Mutex::new(rx)), shutdown: shutdown_rx };
        // populate synchronously: the channel was sized to fit every item, so
        // `try_send` cannot fail with `Full`.
        for item in work {
            queue.tx.try_send(item).expect("work queue capacity sized to fit all items");
        }
        (queue, WorkQueueCloser { shutdown: shutdown_tx })
    }

    /// Takes the next piece of work, or `None` once the queue has been
    /// closed and drained.
    pub async fn take(&self) -> Option<PieceWork> {
        let mut shutdown = self.shutdown.clone();
        let mut rx = self.rx.lock().await;
        loop {
            tokio::select! {
                work = rx.recv() => return work,
                result = shutdown.recv() => {
                    if result.is_none() || result == Some(true) {
                        // drain any work that raced in just before the close
                        // signal, so it isn't silently lost.
                        return rx.try_recv().ok();
                    }
                }
            }
        }
    }

    /// Returns a piece of work to the queue, e.g. because the peer serving it
    /// disconnected or didn't have it, or the downloaded data failed its hash
    /// check (spec.md §4.5's "requeue(work); continue").
    pub async fn requeue(&self, work: PieceWork) {
        // the channel is sized to the original work count, so a requeue can
        // never exceed capacity; if every receiver was dropped the piece is
        // simply lost, which only happens during shutdown.
        let _ = self.tx.clone().send(work).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work(index: usize) -> PieceWork {
        PieceWork { index, length: 16, hash: [0; 20] }
    }

    #[tokio::test]
    async fn takes_every_item_exactly_once() {
        let (queue, _closer) = WorkQueue::new(vec![work(0), work(1), work(2)]);
        let mut seen = Vec::new();
        while let Some(item) = queue.take().await {
            seen.push(item.index);
            if seen.len() == 3 {
                break;
            }
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn requeued_work_is_taken_again() {
        let (queue, _closer) = WorkQueue::new(vec![work(0)]);
        let item = queue.take().await.unwrap();
        queue.requeue(item).await;
        let item = queue.take().await.unwrap();
        assert_eq!(item.index, 0);
    }

    #[tokio::test]
    async fn closing_unblocks_a_pending_take() {
        let (queue, closer) = WorkQueue::new(Vec::new());
        let queue2 = queue.clone();
        let handle = tokio::spawn(async move { queue2.take().await });
        // give the spawned task a chance to block on `take`
        tokio::task::yield_now().await;
        closer.close();
        let result = handle.await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn closing_still_drains_outstanding_work() {
        let (queue, closer) = WorkQueue::new(vec![work(0)]);
        closer.close();
        let item = queue.take().await;
        assert_eq!(item.map(|w| w.index), Some(0));
    }
}
