//! The disk writer: opens a torrent's output files and places downloaded,
//! already-verified pieces at their correct file offsets (spec.md §4.7).
//!
//! Hashing happens in `session.rs` as each piece finishes downloading, not
//! here. An entire piece is downloaded by a single session before being
//! handed off to this task, so there is no partial-piece buffer to own here;
//! by the time a result reaches this task the piece is known-good and only
//! needs to be placed on disk (see DESIGN.md).

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use nix::sys::uio::pwrite;
use tokio::sync::mpsc;
use tokio::task;

use crate::{
    error::{Error, Result},
    progress::Progress,
    scheduler::{PieceResult, WorkQueueCloser},
    storage_info::StorageInfo,
};

/// Creates every output file (and any parent directories a multi-file
/// torrent needs) ahead of the download, open and ready for positional
/// writes.
fn open_files(storage: &StorageInfo) -> Result<Vec<File>> {
    let mut files = Vec::with_capacity(storage.files().len());
    for file in storage.files() {
        if let Some(parent) = file.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let handle = OpenOptions::new().create(true).write(true).open(&file.path)?;
        handle.set_len(file.len)?;
        files.push(handle);
    }
    Ok(files)
}

/// Writes a single piece's data to every file it overlaps with, per the
/// write plan computed from the piece index (spec.md §4.7).
fn write_piece(storage: &StorageInfo, files: &[File], index: crate::PieceIndex, data: &[u8]) -> Result<()> {
    let plan = storage.write_plan(index)?;
    for write in plan {
        let file = &files[write.file_index];
        let chunk = &data[write.piece_offset..write.piece_offset + write.len];
        pwrite_all(file, chunk, write.file_offset as i64)?;
    }
    Ok(())
}

/// Writes the whole buffer at the given offset, retrying as `pwrite` is not
/// guaranteed to write the entire buffer in a single call.
fn pwrite_all(file: &File, mut buf: &[u8], mut offset: i64) -> Result<()> {
    while !buf.is_empty() {
        let written = pwrite(file.as_raw_fd(), buf, offset).map_err(|e| {
            log::warn!("pwrite failed: {}", e);
            Error::Io(std::io::Error::last_os_error())
        })?;
        if written == 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        buf = &buf[written..];
        offset += written as i64;
    }
    Ok(())
}

/// Drains piece results, placing each valid piece on disk and reporting
/// completion to `progress`, until every piece is accounted for or every
/// session has given up (the results channel closes with pieces still
/// missing).
///
/// Closes the work queue once the torrent is complete, which is what wakes
/// up any session still parked in [`crate::scheduler::WorkQueue::take`]
/// waiting for more work (spec.md §4.5).
///
/// Runs the actual file IO on a blocking thread pool via
/// `task::spawn_blocking`, since positional writes are synchronous syscalls
/// and must not block the async reactor.
pub(crate) async fn run(
    storage: Arc<StorageInfo>,
    mut results_rx: mpsc::Receiver<PieceResult>,
    progress: Progress,
    closer: WorkQueueCloser,
) -> Result<()> {
    let files = Arc::new(open_files(&storage)?);
    while !progress.is_complete() {
        let result = match results_rx.recv().await {
            Some(result) => result,
            None => break,
        };
        match result {
            PieceResult::Done { index, data } => {
                let storage = Arc::clone(&storage);
                let files = Arc::clone(&files);
                let write_result = task::spawn_blocking(move || write_piece(&storage, &files, index, &data))
                    .await
                    .expect("disk write task panicked");
                match write_result {
                    Ok(()) => {
                        log::debug!("Piece {} written to disk", index);
                        progress.piece_done(index);
                    }
                    Err(e) => {
                        // A write failure is fatal (spec.md §7): the piece
                        // was already consumed from the results channel and
                        // can't be requeued, so leaving it unwritten would
                        // otherwise hang the controller waiting on a
                        // completion count it can never reach.
                        log::error!("Failed to write piece {}: {}", index, e);
                        closer.close();
                        return Err(e);
                    }
                }
            }
        }
    }
    closer.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::WorkQueue;
    use crate::torrent::Torrent;
    use tempfile::tempdir;

    fn torrent() -> Torrent {
        Torrent {
            info_hash: [0; 20],
            piece_length: 4,
            piece_hashes: vec![[0; 20]; 2],
            total_length: 8,
            name: "out.bin".into(),
            files: Vec::new(),
            announce: "udp://tr".into(),
            peer_id: [0; 20],
        }
    }

    #[tokio::test]
    async fn writes_piece_bytes_at_the_right_offset() {
        let dir = tempdir().unwrap();
        let torrent = torrent();
        let storage = StorageInfo::new(&torrent, dir.path().to_path_buf()).unwrap();
        let files = open_files(&storage).unwrap();

        write_piece(&storage, &files, 0, &[1, 2, 3, 4]).unwrap();
        write_piece(&storage, &files, 1, &[5, 6, 7, 8]).unwrap();

        let written = fs::read(&storage.files()[0].path).unwrap();
        assert_eq!(written, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn run_drains_results_until_senders_drop() {
        let dir = tempdir().unwrap();
        let torrent = torrent();
        let storage = Arc::new(StorageInfo::new(&torrent, dir.path().to_path_buf()).unwrap());
        let (mut tx, rx) = mpsc::channel(4);
        let progress = Progress::new(2);
        let progress2 = progress.clone();
        let (queue, closer) = WorkQueue::new(Vec::new());

        let handle = tokio::spawn(run(Arc::clone(&storage), rx, progress2, closer));
        tx.send(PieceResult::Done { index: 0, data: vec![0; 4] }).await.unwrap();
        tx.send(PieceResult::Done { index: 1, data: vec![0; 4] }).await.unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(progress.completed(), 2);
        // the queue must be closed once the torrent completes, so a session
        // still parked in take() is woken rather than left hanging
        assert!(queue.take().await.is_none());
    }
}
