//! The `Torrent` data type (spec.md §3) and the controller that drives a
//! single download from tracker announce through session spawning to
//! completion (spec.md §4.4 item 5's "controller", §4.6, §5).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify, RwLock};

use crate::{
    conf::TorrentConf,
    disk,
    error::{Error, Result},
    magnet::MagnetLink,
    metadata,
    metainfo::Metainfo,
    progress::Progress,
    scheduler::{PieceResult, PieceWork, WorkQueue, WorkQueueCloser},
    session,
    storage_info::StorageInfo,
    tracker, PeerId, PieceIndex, Sha1Hash,
};

/// One file entry as declared by a multi-file torrent's `info.files` list.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub length: u64,
    pub path_segments: Vec<String>,
}

/// The static description of a download (spec.md §3).
#[derive(Debug, Clone)]
pub struct Torrent {
    pub info_hash: Sha1Hash,
    pub piece_length: u32,
    pub piece_hashes: Vec<Sha1Hash>,
    pub total_length: u64,
    pub name: String,
    pub files: Vec<FileEntry>,
    pub announce: String,
    pub peer_id: PeerId,
}

impl Torrent {
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }
}

/// State that only becomes available once the torrent's metadata is known:
/// either immediately (a regular `.torrent` file) or after the first peer
/// delivers it in full (a magnet link, spec.md §4.6).
pub(crate) struct DownloadState {
    pub torrent: Arc<Torrent>,
    pub storage: Arc<StorageInfo>,
    pub queue: WorkQueue,
    pub results_tx: mpsc::Sender<PieceResult>,
}

/// Publishes `DownloadState` exactly once, letting every session (including
/// ones that were only fetching metadata) observe it as soon as it's ready.
///
/// Shares torrent-wide state across session tasks behind an `Arc<RwLock<_>>`,
/// generalized here to support the magnet bootstrap's "not ready yet" phase.
/// The results receiver and work-queue closer are published alongside the
/// state, in the same critical section, so whichever caller's `publish` call
/// wins the race is also the one the controller hands off to for running the
/// disk task -- the loser's receiver and closer are simply dropped with the
/// rest of its locally-built `DownloadState`.
pub(crate) struct Shared {
    state: RwLock<Option<Arc<DownloadState>>>,
    handoff: Mutex<Option<(mpsc::Receiver<PieceResult>, WorkQueueCloser)>>,
    notify: Notify,
}

impl Shared {
    fn empty() -> Self {
        Self { state: RwLock::new(None), handoff: Mutex::new(None), notify: Notify::new() }
    }

    pub async fn try_get(&self) -> Option<Arc<DownloadState>> {
        self.state.read().await.clone()
    }

    /// Waits until the download state is known, suspending on a `Notify`
    /// rather than polling (spec.md §5's "sessions suspend on ... channel
    /// send/receive").
    pub async fn wait(&self) -> Arc<DownloadState> {
        loop {
            if let Some(state) = self.try_get().await {
                return state;
            }
            self.notify.notified().await;
        }
    }

    /// Publishes the download state if it hasn't been published yet, and
    /// returns whichever state ends up current -- ours if we won the race,
    /// or someone else's if they set it first (spec.md §4.6: "the first
    /// session to deliver all pieces wins").
    pub async fn publish(
        &self,
        state: DownloadState,
        results_rx: mpsc::Receiver<PieceResult>,
        closer: WorkQueueCloser,
    ) -> Arc<DownloadState> {
        let mut guard = self.state.write().await;
        if let Some(existing) = guard.clone() {
            return existing;
        }
        let state = Arc::new(state);
        *guard = Some(Arc::clone(&state));
        *self.handoff.lock().await = Some((results_rx, closer));
        drop(guard);
        self.notify.notify();
        state
    }

    /// Takes the results receiver and work-queue closer published alongside
    /// the winning `DownloadState`. Only the controller calls this, and only
    /// once, right after `wait` first returns.
    async fn take_handoff(&self) -> (mpsc::Receiver<PieceResult>, WorkQueueCloser) {
        self.handoff
            .lock()
            .await
            .take()
            .expect("handoff is published in the same critical section as state")
    }
}

/// Orchestrates a single download: announces to the tracker, spawns one
/// session per returned peer, builds the scheduler and storage layer (either
/// immediately or once a magnet's metadata has been fetched), and drains
/// piece results until the torrent is complete.
pub struct TorrentController {
    conf: Arc<TorrentConf>,
}

/// What the controller was asked to download.
enum Source {
    Metainfo { announce: String, info_hash: Sha1Hash, torrent: Torrent },
    Magnet(MagnetLink),
}

impl TorrentController {
    pub fn new(conf: TorrentConf) -> Self {
        Self { conf: Arc::new(conf) }
    }

    /// Downloads a torrent described by a `.torrent` file's raw bytes.
    pub async fn download_metainfo(
        &self,
        buf: &[u8],
        peer_id: PeerId,
        progress: Progress,
    ) -> Result<()> {
        let metainfo = Metainfo::from_bytes(buf)?;
        let info_hash = Metainfo::info_hash(buf)?;
        let torrent = metainfo.into_torrent(info_hash, peer_id)?;
        let announce = torrent.announce.clone();
        self.run(Source::Metainfo { announce, info_hash, torrent }, peer_id, progress).await
    }

    /// Downloads a torrent described by a magnet URI (spec.md §4.6).
    pub async fn download_magnet(
        &self,
        uri: &str,
        peer_id: PeerId,
        progress: Progress,
    ) -> Result<()> {
        let magnet = MagnetLink::parse(uri)?;
        self.run(Source::Magnet(magnet), peer_id, progress).await
    }

    async fn run(&self, source: Source, our_peer_id: PeerId, progress: Progress) -> Result<()> {
        let (info_hash, announce, known_torrent, magnet) = match source {
            Source::Metainfo { announce, info_hash, torrent } => {
                (info_hash, announce, Some(torrent), None)
            }
            Source::Magnet(magnet) => {
                let announce = magnet.announce().to_string();
                (magnet.info_hash, announce, None, Some(magnet))
            }
        };

        let left = known_torrent.as_ref().map(|t| t.total_length).unwrap_or(u64::MAX);
        let peers =
            announce_to_tracker(&announce, info_hash, our_peer_id, left, &self.conf).await?;
        if peers.is_empty() {
            // spec.md §9 open question (a): a successful announce with zero
            // peers is fatal, since without a peer address there is nothing
            // further this torrent can do (see DESIGN.md).
            return Err(Error::NoPeers);
        }

        let shared = Arc::new(Shared::empty());
        if let Some(torrent) = known_torrent {
            let (state, results_rx, closer) =
                build_download_state(torrent, self.conf.download_dir.clone())?;
            shared.publish(state, results_rx, closer).await;
        }

        let addrs: HashSet<SocketAddr> = peers.into_iter().map(|p| p.0).collect();
        let mut handles = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let shared = Arc::clone(&shared);
            let conf = Arc::clone(&self.conf);
            let download_dir = self.conf.download_dir.clone();
            let magnet = magnet.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) =
                    session::run_session(addr, info_hash, our_peer_id, shared, conf, download_dir, magnet)
                        .await
                {
                    log::warn!("Session {} ended: {}", addr, e);
                }
            }));
        }

        // wait for the torrent to become known (immediately if we started
        // from a metainfo file, or once some session finishes the magnet
        // metadata exchange), then drain results until every piece is
        // accounted for.
        let state = shared.wait().await;
        let total = state.torrent.piece_count();
        progress.set_total(total);

        let (results_rx, closer) = shared.take_handoff().await;
        let disk_task =
            tokio::spawn(disk::run(Arc::clone(&state.storage), results_rx, progress.clone(), closer));

        for handle in handles {
            let _ = handle.await;
        }
        // Unlike a session dying (another peer may still finish the
        // torrent), a disk write failure is fatal: the piece it lost can
        // never be recovered from the results channel, so surface it
        // rather than let the caller see a misleading "ran out of peers".
        disk_task.await.expect("disk task panicked")?;

        if progress.completed() < total {
            return Err(Error::AllTrackersUnreachable);
        }

        Ok(())
    }
}

pub(crate) fn build_download_state(
    torrent: Torrent,
    download_dir: PathBuf,
) -> Result<(DownloadState, mpsc::Receiver<PieceResult>, WorkQueueCloser)> {
    let storage = Arc::new(StorageInfo::new(&torrent, download_dir)?);
    let work: Vec<PieceWork> = torrent
        .piece_hashes
        .iter()
        .enumerate()
        .map(|(index, hash)| PieceWork {
            index: index as PieceIndex,
            length: storage.piece_len(index as PieceIndex).unwrap_or(torrent.piece_length),
            hash: *hash,
        })
        .collect();
    let (queue, closer) = WorkQueue::new(work);
    // the results channel is unbuffered but for one slot of slack: this
    // throttles sessions to the write speed of the controller (spec.md
    // §4.5 "Backpressure").
    let (results_tx, results_rx) = mpsc::channel(1);
    let state = DownloadState { torrent: Arc::new(torrent), storage, queue, results_tx };
    Ok((state, results_rx, closer))
}

async fn announce_to_tracker(
    announce: &str,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    left: u64,
    conf: &TorrentConf,
) -> Result<Vec<tracker::PeerAddress>> {
    if announce.starts_with("udp://") {
        tracker::udp::announce(
            announce.trim_start_matches("udp://"),
            info_hash,
            peer_id,
            conf.port,
            left,
            conf.tracker_initial_timeout,
            conf.tracker_max_retries,
        )
        .await
    } else {
        tracker::http::announce(announce, info_hash, peer_id, conf.port, left).await
    }
}

/// Metadata-bootstrap helper used by sessions to hand off a freshly
/// reassembled `info` dictionary, turning it into a brand new
/// [`DownloadState`] ready to be published via [`Shared::publish`]
/// (spec.md §4.6 step (e)).
pub(crate) fn torrent_from_metadata(
    info_hash: Sha1Hash,
    info_bytes: Vec<u8>,
    announce: String,
    magnet: &MagnetLink,
    peer_id: PeerId,
) -> Result<Torrent> {
    let info = metadata::verify_and_parse(info_hash, info_bytes)?;
    let mut torrent = info.into_torrent(info_hash, announce, peer_id)?;
    if torrent.name.is_empty() {
        torrent.name = magnet.display_name_or_unknown().to_string();
    }
    Ok(torrent)
}
