//! The UDP tracker protocol (BEP-15), spec.md §4.3 "UDP tracker" and §8 S6
//! (retry with exponential backoff).

use std::convert::TryInto;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

use super::{parse_compact_peers, PeerAddress};
use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

const PROTOCOL_ID: i64 = 0x0417_2710_1980;
const ACTION_CONNECT: i32 = 0;
const ACTION_ANNOUNCE: i32 = 1;
const ACTION_ERROR: i32 = 3;

/// Announces to a UDP tracker, retrying the connect/announce exchange with
/// exponentially doubling timeouts (starting at `initial_timeout`) up to
/// `max_retries` times, per BEP-15's recommended `15 * 2^n` second schedule.
pub(crate) async fn announce(
    host_port: &str,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
    left: u64,
    initial_timeout: Duration,
    max_retries: usize,
) -> Result<Vec<PeerAddress>> {
    let host_port = host_port.split('/').next().unwrap_or(host_port);
    let addr = lookup_host(host_port)
        .await?
        .next()
        .ok_or_else(|| Error::Tracker(format!("could not resolve tracker address {}", host_port)))?;

    let mut socket = UdpSocket::bind(("0.0.0.0", 0)).await?;

    for attempt in 0..max_retries {
        let attempt_timeout = initial_timeout * 2u32.pow(attempt as u32);
        match try_announce_once(&mut socket, addr, info_hash, peer_id, port, left, attempt_timeout).await {
            Ok(peers) => return Ok(peers),
            Err(e) => log::warn!("UDP tracker attempt {} failed: {}", attempt, e),
        }
    }
    Err(Error::TrackerTimedOut(max_retries))
}

async fn try_announce_once(
    socket: &mut UdpSocket,
    addr: SocketAddr,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
    left: u64,
    attempt_timeout: Duration,
) -> Result<Vec<PeerAddress>> {
    let transaction_id: i32 = rand::thread_rng().gen();
    let connection_id = connect(socket, addr, transaction_id, attempt_timeout).await?;

    let transaction_id: i32 = rand::thread_rng().gen();
    let mut request = BytesMut::with_capacity(98);
    request.put_i64(connection_id);
    request.put_i32(ACTION_ANNOUNCE);
    request.put_i32(transaction_id);
    request.put_slice(&info_hash);
    request.put_slice(&peer_id);
    request.put_i64(0); // downloaded
    request.put_i64(left as i64);
    request.put_i64(0); // uploaded
    request.put_i32(0); // event: none
    request.put_i32(0); // ip: default
    request.put_u32(0); // key: spec.md §4.3 fixes this at 0
    request.put_i32(-1); // num_want: default
    request.put_u16(port);

    socket.send_to(&request, addr).await?;

    // A stray or stale datagram (a mismatched transaction id, or an action
    // we're not expecting) is ignored rather than failing the attempt: per
    // spec.md §4.3 we keep listening until this attempt's own timer fires.
    let deadline = Instant::now() + attempt_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Tracker("udp tracker announce timed out".into()));
        }

        let mut buf = vec![0u8; 2048];
        let len = timeout(remaining, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Tracker("udp tracker announce timed out".into()))??;
        let mut response = &buf[..len];

        if response.len() < 20 {
            continue;
        }
        let action = response.get_i32();
        let received_transaction_id = response.get_i32();
        if received_transaction_id != transaction_id {
            continue;
        }
        if action == ACTION_ERROR {
            let message = String::from_utf8_lossy(response).into_owned();
            return Err(Error::Tracker(message));
        }
        if action != ACTION_ANNOUNCE {
            continue;
        }

        let _interval = response.get_i32();
        let _leechers = response.get_i32();
        let _seeders = response.get_i32();
        return Ok(parse_compact_peers(response));
    }
}

async fn connect(
    socket: &mut UdpSocket,
    addr: SocketAddr,
    transaction_id: i32,
    attempt_timeout: Duration,
) -> Result<i64> {
    let mut request = BytesMut::with_capacity(16);
    request.put_i64(PROTOCOL_ID);
    request.put_i32(ACTION_CONNECT);
    request.put_i32(transaction_id);
    socket.send_to(&request, addr).await?;

    // Same ignore-and-keep-waiting policy as the announce response below.
    let deadline = Instant::now() + attempt_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Tracker("udp tracker connect timed out".into()));
        }

        let mut buf = [0u8; 16];
        let len = timeout(remaining, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Tracker("udp tracker connect timed out".into()))??;
        if len < 16 {
            continue;
        }
        let action = i32::from_be_bytes(buf[0..4].try_into().unwrap());
        let received_transaction_id = i32::from_be_bytes(buf[4..8].try_into().unwrap());
        if received_transaction_id != transaction_id {
            continue;
        }
        if action == ACTION_ERROR {
            return Err(Error::Tracker("udp tracker refused connect".into()));
        }
        if action != ACTION_CONNECT {
            continue;
        }
        return Ok(i64::from_be_bytes(buf[8..16].try_into().unwrap()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A minimal fake tracker that drops the first `drop_count` connect
    /// packets before answering correctly, so the retry/backoff path is
    /// exercised (spec.md §8 S6).
    async fn spawn_flaky_tracker(drop_count: usize) -> SocketAddr {
        let mut socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));

        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let action = i32::from_be_bytes(buf[8..12].try_into().unwrap());
                if action == ACTION_CONNECT {
                    if dropped.fetch_add(1, Ordering::SeqCst) < drop_count {
                        continue;
                    }
                    let transaction_id = &buf[12..16];
                    let mut resp = BytesMut::with_capacity(16);
                    resp.put_i32(ACTION_CONNECT);
                    resp.put_slice(transaction_id);
                    resp.put_i64(42);
                    let _ = socket.send_to(&resp, from).await;
                } else if action == ACTION_ANNOUNCE && len >= 16 {
                    let transaction_id = &buf[12..16];
                    let mut resp = BytesMut::with_capacity(26);
                    resp.put_i32(ACTION_ANNOUNCE);
                    resp.put_slice(transaction_id);
                    resp.put_i32(1800); // interval
                    resp.put_i32(0); // leechers
                    resp.put_i32(1); // seeders
                    resp.put_slice(&[127, 0, 0, 9]);
                    resp.put_u16(4000);
                    let _ = socket.send_to(&resp, from).await;
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn succeeds_after_retrying_past_dropped_connect_packets() {
        let addr = spawn_flaky_tracker(2).await;
        let peers = announce(
            &addr.to_string(),
            [1; 20],
            [2; 20],
            6881,
            0,
            Duration::from_millis(50),
            5,
        )
        .await
        .unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].0.port(), 4000);
    }

    #[tokio::test]
    async fn gives_up_after_exhausting_retries() {
        // bind a socket that never replies
        let silent = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = silent.local_addr().unwrap();
        let err = announce(&addr.to_string(), [1; 20], [2; 20], 6881, 0, Duration::from_millis(10), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TrackerTimedOut(3)));
    }
}
