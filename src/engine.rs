//! The public entry point to the crate (spec.md §4.1): a thin facade over
//! [`crate::torrent::TorrentController`] that owns the engine-wide
//! configuration and exposes the two ways a download can start.

use crate::{
    conf::Conf,
    progress::Progress,
    torrent::TorrentController,
};

/// A running instance of the torrent engine, configured once and reused for
/// any number of sequential downloads.
pub struct Engine {
    conf: Conf,
}

impl Engine {
    /// Creates an engine with the given configuration.
    pub fn new(conf: Conf) -> Self {
        Self { conf }
    }

    /// Downloads the torrent described by a `.torrent` file's raw bytes,
    /// blocking (asynchronously) until every piece has been written to disk
    /// or the download fails outright.
    pub async fn download_metainfo(&self, buf: &[u8]) -> crate::error::Result<()> {
        let controller = TorrentController::new(self.conf.torrent.clone());
        let progress = Progress::new(0);
        controller.download_metainfo(buf, self.conf.engine.client_id, progress).await
    }

    /// Downloads the torrent described by a magnet URI, first bootstrapping
    /// its metadata over the wire before downloading any pieces
    /// (spec.md §4.6).
    pub async fn download_magnet(&self, uri: &str) -> crate::error::Result<()> {
        let controller = TorrentController::new(self.conf.torrent.clone());
        let progress = Progress::new(0);
        controller.download_magnet(uri, self.conf.engine.client_id, progress).await
    }
}
