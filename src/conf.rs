//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use rand::Rng;

use crate::PeerId;

/// The fixed prefix used when generating this client's peer id, following
/// the Azureus-style convention described in BEP-20: two dashes bracketing a
/// two-letter client code and a four-digit version, followed by random
/// digits to round out the 20-byte identity.
const CLIENT_ID_PREFIX: &[u8] = b"-LC0001-";

/// Generates a fresh 20-byte peer id for this client, chosen once at
/// startup, per spec.md's "fixed 20-byte identity chosen by this client at
/// startup". See [BEP-20](http://bittorrent.org/beps/bep_0020.html) for the
/// convention this follows.
pub fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..CLIENT_ID_PREFIX.len()].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in &mut id[CLIENT_ID_PREFIX.len()..] {
        *byte = rng.gen_range(b'0'..=b'9');
    }
    id
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the engine configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. Generates a fresh peer id via [`generate_peer_id`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: generate_peer_id(),
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent download.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download.
    pub download_dir: PathBuf,

    /// The port we claim to listen on when announcing to trackers. We never
    /// actually accept inbound connections (no seeding), but trackers expect
    /// a plausible value.
    pub port: u16,

    /// The maximum number of blocks a peer session keeps outstanding at
    /// once: the request pipeline depth (spec.md §4.4 `MAX_BACKLOG`).
    pub max_backlog: usize,

    /// The read deadline after which an idle peer session is considered
    /// dead and torn down (spec.md §4.4/§5).
    pub peer_read_timeout: Duration,

    /// The UDP tracker's initial per-attempt timeout; doubles on each retry
    /// (spec.md §4.3).
    pub tracker_initial_timeout: Duration,

    /// The maximum number of retry attempts per UDP tracker dialogue step.
    pub tracker_max_retries: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            port: 6881,
            max_backlog: 5,
            peer_read_timeout: Duration::from_secs(20),
            tracker_initial_timeout: Duration::from_secs(15),
            tracker_max_retries: 8,
        }
    }
}
