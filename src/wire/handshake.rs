//! The fixed 68-byte BEP-3 handshake, plus the BEP-10 extension-capability
//! bit (spec.md §4.2).

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, PeerId, Sha1Hash};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Byte index into the 8 reserved handshake bytes that carries the
/// extension-protocol capability bit.
const EXTENSION_RESERVED_BYTE: usize = 5;
/// The bit within that byte indicating extension protocol support.
const EXTENSION_RESERVED_BIT: u8 = 0x10;

/// The BEP-3 handshake message, exchanged once, first thing, in both
/// directions of a peer connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Builds our outgoing handshake, with the extension-protocol bit set.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_RESERVED_BYTE] |= EXTENSION_RESERVED_BIT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the reserved bytes (ours if this is our handshake, the
    /// peer's if this was received) advertise extension protocol support.
    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[EXTENSION_RESERVED_BYTE] & EXTENSION_RESERVED_BIT != 0
    }
}

/// Length of the handshake on the wire: 1 (pstrlen) + 19 (pstr) + 8
/// (reserved) + 20 (info_hash) + 20 (peer_id).
const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

pub(crate) struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if src.len() < HANDSHAKE_LEN {
            src.reserve(HANDSHAKE_LEN - src.len());
            return Ok(None);
        }

        // validate the first 20 bytes exactly: pstrlen must be 19 and pstr
        // must be the fixed BitTorrent protocol string
        if src[0] as usize != PROTOCOL_STRING.len()
            || &src[1..20] != PROTOCOL_STRING.as_bytes()
        {
            return Err(Error::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&src[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&src[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&src[48..68]);

        src.advance(HANDSHAKE_LEN);

        Ok(Some(Handshake {
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<(), Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(PROTOCOL_STRING.len() as u8);
        dst.put_slice(PROTOCOL_STRING.as_bytes());
        dst.put_slice(&handshake.reserved);
        dst.put_slice(&handshake.info_hash);
        dst.put_slice(&handshake.peer_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_codec() {
        let info_hash = [7u8; 20];
        let peer_id = [9u8; 20];
        let handshake = Handshake::new(info_hash, peer_id);

        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn extension_bit_is_set_at_byte_5() {
        let handshake = Handshake::new([0; 20], [0; 20]);
        assert_eq!(handshake.reserved[5] & 0x10, 0x10);
        assert!(handshake.supports_extension_protocol());
    }

    #[test]
    fn rejects_wrong_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(b"NotBitTorrent proto"); // 19 bytes, wrong content
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&[0u8; 20]);
        buf.put_slice(&[0u8; 20]);
        let err = HandshakeCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::InvalidHandshake));
    }

    #[test]
    fn decode_returns_none_until_full_frame_present() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        // only partial reserved bytes so far
        buf.put_slice(&[0u8; 3]);
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_none());
    }
}
