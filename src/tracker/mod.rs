//! Tracker adapters (spec.md §4.3): HTTP (BEP-3) and UDP (BEP-15) trackers,
//! behind a single `announce` entry point per protocol that both resolve to
//! a plain list of peer addresses.

pub(crate) mod http;
pub(crate) mod udp;

use std::net::SocketAddr;

/// A peer address as returned by a tracker's compact peer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PeerAddress(pub SocketAddr);

/// Parses a BEP-23 compact peer list: a byte string that is a concatenation
/// of 6-byte entries, 4 bytes of big-endian IPv4 address followed by 2 bytes
/// of big-endian port (spec.md §8 S3).
pub(crate) fn parse_compact_peers(bytes: &[u8]) -> Vec<PeerAddress> {
    const ENTRY_LEN: usize = 6;
    bytes
        .chunks_exact(ENTRY_LEN)
        .map(|entry| {
            let ip = std::net::Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            PeerAddress(SocketAddr::from((ip, port)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_compact_peer_list() {
        // spec.md §8 S3: two peers, 127.0.0.1:6881 and 10.0.0.2:51413
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[127, 0, 0, 1]);
        bytes.extend_from_slice(&6881u16.to_be_bytes());
        bytes.extend_from_slice(&[10, 0, 0, 2]);
        bytes.extend_from_slice(&51413u16.to_be_bytes());

        let peers = parse_compact_peers(&bytes);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].0, "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1].0, "10.0.0.2:51413".parse().unwrap());
    }

    #[test]
    fn ignores_a_trailing_partial_entry() {
        let bytes = vec![127, 0, 0, 1, 0x1a, 0xe1, 0xff];
        let peers = parse_compact_peers(&bytes);
        assert_eq!(peers.len(), 1);
    }
}
