//! The per-peer wire session (spec.md §4.2 handshake, §4.4 peer session &
//! piece download, §4.6 magnet bootstrap, §9 design notes).
//!
//! Connects to a peer by exchanging handshakes over a
//! `Framed<TcpStream, HandshakeCodec>`, then hands the same socket to a
//! `Framed<TcpStream, PeerCodec>` via `FramedParts` so the connection keeps
//! its buffered bytes across the codec swap. Everything past the handshake
//! -- extension negotiation, metadata fetching, request pipelining -- drives
//! a download to completion rather than just logging incoming messages.
//!
//! A session moves through the states named in spec.md §9: `Handshaking`,
//! `ExtensionHandshaking`, `FetchingMetadata`, `Ready`/`Downloading`, and
//! `Terminated`. A session that starts from a known torrent (a `.torrent`
//! file) skips straight from `ExtensionHandshaking` to `Downloading`, since
//! `FetchingMetadata`'s only purpose is discovering a magnet's `info`
//! dictionary.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    bitfield::{self, Bitfield, BitfieldExt},
    block_count, block_len,
    conf::TorrentConf,
    error::{Error, Result},
    magnet::MagnetLink,
    metadata::MetadataAssembler,
    scheduler::PieceWork,
    torrent::{build_download_state, torrent_from_metadata, DownloadState, Shared},
    wire::{
        ExtensionHandshake, Handshake, HandshakeCodec, MetadataMessage, Message, PeerCodec,
        UT_METADATA, UT_METADATA_LOCAL_ID,
    },
    BlockInfo, PeerId, PieceIndex, Sha1Hash, BLOCK_LEN,
};

type PeerIo = Framed<TcpStream, PeerCodec>;

/// How long to wait for more of the peer's initial `bitfield`/`have`/
/// `unchoke` burst before assuming it's finished sending it.
const INITIAL_BURST_WINDOW: Duration = Duration::from_millis(200);

/// Mirrors the session state machine named in spec.md §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Handshaking,
    ExtensionHandshaking,
    FetchingMetadata,
    Downloading,
    Terminated,
}

/// Connects to a single peer and runs it for as long as it has work to do:
/// handshake, extension negotiation, an optional metadata bootstrap phase,
/// then piece downloading until the shared work queue closes.
///
/// `magnet` is `Some` only when this download started from a magnet URI
/// and the torrent's metadata isn't known up front; it carries the
/// information this session needs to finish building a [`crate::Torrent`]
/// if it's the one that completes the `ut_metadata` exchange first.
pub(crate) async fn run_session(
    addr: SocketAddr,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    shared: Arc<Shared>,
    conf: Arc<TorrentConf>,
    download_dir: PathBuf,
    magnet: Option<MagnetLink>,
) -> Result<()> {
    let mut session = Session::new(addr, info_hash, peer_id, shared, conf, download_dir, magnet);
    session.run().await
}

struct Session {
    addr: SocketAddr,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    shared: Arc<Shared>,
    conf: Arc<TorrentConf>,
    download_dir: PathBuf,
    magnet: Option<MagnetLink>,

    state: State,
    choked_by_remote: bool,
    remote_bitfield: Bitfield,
    supports_extension: bool,
    peer_extension_ids: BTreeMap<String, u8>,
    peer_metadata_size: Option<i64>,
}

impl Session {
    fn new(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        peer_id: PeerId,
        shared: Arc<Shared>,
        conf: Arc<TorrentConf>,
        download_dir: PathBuf,
        magnet: Option<MagnetLink>,
    ) -> Self {
        Self {
            addr,
            info_hash,
            peer_id,
            shared,
            conf,
            download_dir,
            magnet,
            state: State::Handshaking,
            choked_by_remote: true,
            remote_bitfield: bitfield::empty(0),
            supports_extension: false,
            peer_extension_ids: BTreeMap::new(),
            peer_metadata_size: None,
        }
    }

    async fn run(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        let socket = TcpStream::connect(self.addr).await?;
        log::info!("Connected to peer {}", self.addr);

        let mut io = self.handshake(socket).await?;
        self.state = State::ExtensionHandshaking;

        let state = self.bootstrap(&mut io).await?;
        self.state = State::Downloading;

        self.download(&mut io, &state).await
    }

    /// Performs the fixed 68-byte BEP-3 handshake, then swaps the
    /// handshake codec for the peer message codec over the same socket
    /// (spec.md §4.2).
    async fn handshake(&mut self, socket: TcpStream) -> Result<PeerIo> {
        let mut io = Framed::new(socket, HandshakeCodec);
        let ours = Handshake::new(self.info_hash, self.peer_id);
        io.send(ours).await?;

        let their_handshake = timeout(self.conf.peer_read_timeout, io.next())
            .await
            .map_err(|_| Error::SessionTimeout)?
            .ok_or(Error::InvalidHandshake)??;
        if their_handshake.info_hash != self.info_hash {
            return Err(Error::InvalidPeerInfoHash);
        }
        self.supports_extension = their_handshake.supports_extension_protocol();
        log::debug!(
            "Peer {} handshake ok, extension protocol: {}",
            self.addr,
            self.supports_extension
        );

        let parts = io.into_parts();
        let mut new_parts = FramedParts::new(parts.io, PeerCodec);
        new_parts.read_buf = parts.read_buf;
        new_parts.write_buf = parts.write_buf;
        Ok(Framed::from_parts(new_parts))
    }

    /// Runs the session until the torrent's metadata is known, either
    /// because it already was (a `.torrent` file), because this session
    /// fetches it over `ut_metadata` and wins the race to publish it, or
    /// because another session publishes it first (spec.md §4.6).
    async fn bootstrap(&mut self, io: &mut PeerIo) -> Result<Arc<DownloadState>> {
        if self.supports_extension {
            let payload = ExtensionHandshake::ours().encode()?;
            io.send(Message::Extension { id: 0, payload }).await?;
        }
        // spec.md §4.4 item 2: send unchoke and interested, regardless of
        // whether we're about to request metadata or pieces.
        io.send(Message::Unchoke).await?;
        io.send(Message::Interested).await?;

        self.state = State::FetchingMetadata;
        let mut assembler: Option<MetadataAssembler> = None;
        let mut next_piece = 0usize;
        let mut raw_bitfield: Option<Bitfield> = None;
        let mut pending_haves: Vec<PieceIndex> = Vec::new();
        let mut deadline = Instant::now() + self.conf.peer_read_timeout;
        // A `.torrent` download publishes its `DownloadState` before any
        // session even connects, so `try_get` can succeed on the very first
        // iteration below. Give the peer this short window to finish
        // sending its initial `bitfield`/`have`/`unchoke` burst first --
        // otherwise that availability information is never read and the
        // session has no pieces to request once it starts downloading.
        let mut settled = false;

        let state = loop {
            let msg = if settled {
                if let Some(state) = self.shared.try_get().await {
                    break state;
                }
                recv_message(io, &mut deadline).await?
            } else {
                match timeout(INITIAL_BURST_WINDOW, recv_message(io, &mut deadline)).await {
                    Ok(received) => received?,
                    Err(_) => {
                        settled = true;
                        continue;
                    }
                }
            };
            match msg {
                Message::KeepAlive => {}
                Message::Choke => self.choked_by_remote = true,
                Message::Unchoke => {
                    self.choked_by_remote = false;
                    deadline = Instant::now() + self.conf.peer_read_timeout;
                }
                Message::Have { piece_index } => pending_haves.push(piece_index),
                Message::Bitfield(bits) => raw_bitfield = Some(bits),
                Message::Interested | Message::NotInterested => {
                    // we never serve pieces, so the remote's interest in us
                    // is a no-op (spec.md §1 non-goals)
                }
                Message::Request(_) | Message::Cancel(_) | Message::Block { .. } => {
                    // we never serve pieces or metadata (spec.md §1 non-goals)
                }
                Message::Extension { id, payload } => {
                    if id == 0 {
                        self.handle_extension_handshake(&payload)?;
                        if assembler.is_none() {
                            if let (Some(_), Some(size)) = (
                                self.peer_extension_ids.get(UT_METADATA).copied(),
                                self.peer_metadata_size,
                            ) {
                                assembler = Some(MetadataAssembler::new(size)?);
                                next_piece = 0;
                                self.request_metadata_piece(io, next_piece).await?;
                            }
                        }
                    } else if id == UT_METADATA_LOCAL_ID {
                        if let Some(won) =
                            self.handle_metadata_message(io, &payload, &mut assembler, &mut next_piece).await?
                        {
                            break won;
                        }
                    }
                }
            }
        };

        self.finalize_bitfield(state.torrent.piece_count(), raw_bitfield, &pending_haves)?;
        Ok(state)
    }

    fn handle_extension_handshake(&mut self, payload: &[u8]) -> Result<()> {
        let handshake = ExtensionHandshake::decode(payload)?;
        if let (Some(old), Some(new)) = (self.peer_metadata_size, handshake.metadata_size) {
            if old != new {
                // spec.md §9 open question (c): fail loudly rather than
                // silently adopt a changed metadata_size.
                return Err(Error::MetadataSizeChanged { old, new });
            }
        }
        if handshake.metadata_size.is_some() {
            self.peer_metadata_size = handshake.metadata_size;
        }
        self.peer_extension_ids = handshake.extensions;
        Ok(())
    }

    /// Handles a `ut_metadata` protocol message addressed to our assigned
    /// extension ID. Returns `Some(state)` once this session's metadata
    /// assembly has completed and its reassembled torrent has been
    /// published (whether or not this session actually won the race).
    async fn handle_metadata_message(
        &mut self,
        io: &mut PeerIo,
        payload: &[u8],
        assembler: &mut Option<MetadataAssembler>,
        next_piece: &mut usize,
    ) -> Result<Option<Arc<DownloadState>>> {
        match MetadataMessage::decode(payload)? {
            MetadataMessage::Data { piece, data, .. } => {
                let mut completed = false;
                if let Some(asm) = assembler.as_mut() {
                    asm.set_piece(piece, data)?;
                    completed = asm.is_complete();
                }
                if completed {
                    let bytes = assembler.take().expect("just checked Some").into_bytes()?;
                    let magnet = self
                        .magnet
                        .clone()
                        .ok_or(Error::InvalidExtensionMessage)?;
                    let torrent = torrent_from_metadata(
                        self.info_hash,
                        bytes,
                        magnet.announce().to_string(),
                        &magnet,
                        self.peer_id,
                    )?;
                    let (state, results_rx, closer) =
                        build_download_state(torrent, self.download_dir.clone())?;
                    let state = self.shared.publish(state, results_rx, closer).await;
                    return Ok(Some(state));
                }
                if let Some(asm) = assembler.as_ref() {
                    *next_piece += 1;
                    if *next_piece < asm.piece_count() {
                        self.request_metadata_piece(io, *next_piece).await?;
                    }
                }
                Ok(None)
            }
            MetadataMessage::Reject { piece } => {
                log::debug!("Peer {} rejected metadata piece {}", self.addr, piece);
                // give up fetching metadata from this peer; we'll still
                // transition into downloading once another peer publishes
                // the state.
                *assembler = None;
                Ok(None)
            }
            MetadataMessage::Request { .. } => Ok(None),
        }
    }

    async fn request_metadata_piece(&self, io: &mut PeerIo, piece: usize) -> Result<()> {
        let remote_id = self
            .peer_extension_ids
            .get(UT_METADATA)
            .copied()
            .ok_or(Error::PeerLacksExtensionProtocol)?;
        let payload = MetadataMessage::Request { piece }.encode()?;
        io.send(Message::Extension { id: remote_id, payload }).await?;
        Ok(())
    }

    /// Builds the session's view of the remote's piece availability from
    /// whatever `bitfield`/`have` messages arrived before the torrent's
    /// piece count was known (spec.md §4.4, §8 invariant 8).
    fn finalize_bitfield(
        &mut self,
        piece_count: usize,
        raw_bitfield: Option<Bitfield>,
        pending_haves: &[PieceIndex],
    ) -> Result<()> {
        self.remote_bitfield = bitfield::empty(piece_count);
        if let Some(bits) = raw_bitfield {
            let wire_bytes = bits.len() / 8;
            let expected_bytes = (piece_count + 7) / 8;
            if wire_bytes != expected_bytes {
                return Err(Error::InvalidBitfield);
            }
            let mut bits = bits;
            bits.resize(piece_count, false);
            self.remote_bitfield = bits;
        }
        for &index in pending_haves {
            self.remote_bitfield.set_piece(index);
        }
        Ok(())
    }

    /// Drains the shared work queue, downloading and verifying pieces the
    /// remote has until the queue closes (spec.md §4.5).
    async fn download(&mut self, io: &mut PeerIo, state: &DownloadState) -> Result<()> {
        let mut deadline = Instant::now() + self.conf.peer_read_timeout;
        while let Some(work) = state.queue.take().await {
            if !self.remote_bitfield.has(work.index) {
                // Don't just requeue and spin: a peer can gain pieces over
                // the life of the connection, and the only way to find out
                // is to actually read from the socket. This also means a
                // peer that never gets anything we need eventually times
                // out here instead of looping forever.
                match recv_message(io, &mut deadline).await {
                    Ok(Message::Have { piece_index }) => self.remote_bitfield.set_piece(piece_index),
                    Ok(Message::Bitfield(_)) => return Err(Error::InvalidBitfield),
                    Ok(Message::Choke) => self.choked_by_remote = true,
                    Ok(Message::Unchoke) => {
                        self.choked_by_remote = false;
                        deadline = Instant::now() + self.conf.peer_read_timeout;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        state.queue.requeue(work).await;
                        self.state = State::Terminated;
                        return Err(e);
                    }
                }
                state.queue.requeue(work).await;
                continue;
            }
            deadline = Instant::now() + self.conf.peer_read_timeout;

            match self.download_piece(io, &work).await {
                Ok(data) => {
                    let digest = Sha1::digest(&data);
                    if digest.as_slice() != work.hash {
                        log::debug!("Peer {} sent a corrupt piece {}", self.addr, work.index);
                        state.queue.requeue(work).await;
                        continue;
                    }
                    // ignore a failed `have` send: the piece is already
                    // ours, and if the socket is dead the next request will
                    // surface the same error anyway.
                    let _ = io.send(Message::Have { piece_index: work.index }).await;
                    if state
                        .results_tx
                        .clone()
                        .send(crate::scheduler::PieceResult::Done { index: work.index, data })
                        .await
                        .is_err()
                    {
                        // the controller has gone away; nothing left to do.
                        return Ok(());
                    }
                }
                Err(e) => {
                    state.queue.requeue(work).await;
                    self.state = State::Terminated;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Downloads one piece by pipelining up to `max_backlog` outstanding
    /// block requests, per spec.md §4.4 item 4.
    async fn download_piece(&mut self, io: &mut PeerIo, work: &PieceWork) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; work.length as usize];
        let mut received = 0usize;
        let total_blocks = block_count(work.length);
        let mut next_block = 0usize;
        let mut in_flight = 0usize;
        let mut deadline = Instant::now() + self.conf.peer_read_timeout;

        loop {
            if received == buf.len() {
                return Ok(buf);
            }

            while !self.choked_by_remote && in_flight < self.conf.max_backlog && next_block < total_blocks
            {
                let offset = next_block as u32 * BLOCK_LEN;
                let len = block_len(work.length, next_block);
                io.send(Message::Request(BlockInfo { piece_index: work.index, offset, len }))
                    .await?;
                next_block += 1;
                in_flight += 1;
            }

            let msg = recv_message(io, &mut deadline).await?;
            match msg {
                Message::KeepAlive => {}
                Message::Choke => self.choked_by_remote = true,
                Message::Unchoke => {
                    self.choked_by_remote = false;
                    deadline = Instant::now() + self.conf.peer_read_timeout;
                }
                Message::Have { piece_index } => self.remote_bitfield.set_piece(piece_index),
                Message::Bitfield(_) => return Err(Error::InvalidBitfield),
                Message::Block { piece_index, offset, data } => {
                    if piece_index != work.index {
                        // a block from a piece we already abandoned; ignore
                        continue;
                    }
                    let start = offset as usize;
                    let end = start.checked_add(data.len()).ok_or(Error::InvalidMessage)?;
                    if end > buf.len() {
                        return Err(Error::InvalidMessage);
                    }
                    buf[start..end].copy_from_slice(&data);
                    received += data.len();
                    in_flight = in_flight.saturating_sub(1);
                    deadline = Instant::now() + self.conf.peer_read_timeout;
                }
                Message::Interested
                | Message::NotInterested
                | Message::Request(_)
                | Message::Cancel(_)
                | Message::Extension { .. } => {}
            }
        }
    }
}

/// Reads the next framed message, enforcing the absolute `deadline` rather
/// than resetting a timer on every call, so messages that don't count as
/// progress (e.g. a stray `have`) don't extend the session's lifetime
/// (spec.md §4.4 "Read-deadline policy").
async fn recv_message(io: &mut PeerIo, deadline: &mut Instant) -> Result<Message> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(Error::SessionTimeout);
    }
    match timeout(remaining, io.next()).await {
        Ok(Some(item)) => item,
        Ok(None) => Err(Error::ChannelClosed),
        Err(_) => Err(Error::SessionTimeout),
    }
}
