//! The crate-wide error type and the `Result` alias built on top of it.
//!
//! Every fallible operation in `leech` returns one of these variants. The
//! policy for what happens with each kind (abort the program, abort the
//! session, retry, requeue silently) is documented per call site, not here;
//! this module only names the failure modes.

use crate::PieceIndex;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed bencode: bad metainfo file, bad tracker response, bad
    /// extension message payload.
    #[error("malformed bencode: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid magnet uri: {0}")]
    InvalidMagnetUri(String),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The metainfo's `info` dictionary is missing a required key or has a
    /// field of the wrong shape (e.g. neither `length` nor `files`).
    #[error("malformed metainfo: {0}")]
    InvalidMetainfo(String),

    #[error("piece index {0} is out of bounds for this torrent")]
    InvalidPieceIndex(PieceIndex),

    /// Peer's first handshake byte or protocol string didn't match BEP-3.
    #[error("peer sent an invalid handshake")]
    InvalidHandshake,

    /// Peer's advertised info hash didn't match ours.
    #[error("peer handshake info hash mismatch")]
    InvalidPeerInfoHash,

    /// A bitfield message arrived outside the availability-exchange phase of
    /// the session, or with the wrong length.
    #[error("peer sent a bitfield message out of order or with invalid length")]
    InvalidBitfield,

    /// A fixed-length message (have/request/cancel/piece) had the wrong
    /// payload length.
    #[error("peer sent a malformed message")]
    InvalidMessage,

    /// Peer sent extension handshake payload we couldn't parse, or sent an
    /// extension message for an ID we never negotiated.
    #[error("peer sent a malformed or unnegotiated extension message")]
    InvalidExtensionMessage,

    /// Peer does not support the extension protocol (BEP-10); required for
    /// the magnet metadata exchange.
    #[error("peer does not support the extension protocol")]
    PeerLacksExtensionProtocol,

    /// A peer's advertised `metadata_size` changed between handshakes on the
    /// same connection. Per spec this is an open question resolved as: fail
    /// loudly rather than silently adopt the new size (see DESIGN.md).
    #[error("peer's advertised metadata_size changed from {old} to {new}")]
    MetadataSizeChanged { old: i64, new: i64 },

    /// The SHA-1 of reassembled magnet metadata didn't match the info hash
    /// named in the magnet URI.
    #[error("reassembled metadata hash does not match the magnet info hash")]
    MetadataHashMismatch,

    /// The read deadline (20s since the last progress event) elapsed.
    #[error("peer session timed out waiting for progress")]
    SessionTimeout,

    #[error("tracker request failed: {0}")]
    Tracker(String),

    /// The UDP tracker exhausted its retry budget (8 attempts, doubling from
    /// 15s) without a matching response.
    #[error("udp tracker timed out after {0} attempts")]
    TrackerTimedOut(usize),

    /// The tracker answered successfully but with an empty peer list.
    #[error("tracker returned zero peers")]
    NoPeers,

    #[error("no trackers could be reached")]
    AllTrackersUnreachable,

    /// An internal channel (work queue, results, disk commands) was closed
    /// unexpectedly; this is always an engine shutdown signal, not a peer
    /// protocol error.
    #[error("internal channel closed")]
    ChannelClosed,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
