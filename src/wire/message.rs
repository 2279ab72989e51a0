//! The peer wire message framer (spec.md §4.1): `<u32 length><u8 id><payload>`,
//! with a length of 0 meaning keep-alive, and unknown IDs drained and
//! discarded silently.

use bitvec::prelude::{BitVec, Msb0};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{bitfield::Bitfield, error::Error, BlockInfo, PieceIndex};

/// Recognized message IDs (spec.md §4.1). Values not in this set are read
/// (to drain their bytes off the wire) and discarded without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Extension = 20,
}

impl MessageId {
    fn from_u8(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Choke),
            1 => Some(Self::Unchoke),
            2 => Some(Self::Interested),
            3 => Some(Self::NotInterested),
            4 => Some(Self::Have),
            5 => Some(Self::Bitfield),
            6 => Some(Self::Request),
            7 => Some(Self::Piece),
            8 => Some(Self::Cancel),
            20 => Some(Self::Extension),
            _ => None,
        }
    }
}

/// A decoded peer message. `KeepAlive` never reaches the application layer
/// of a session as a distinct branch to act on; it is surfaced only so
/// sessions can refresh their read-deadline timers on any traffic.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block { piece_index: PieceIndex, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
    /// A BEP-10 extension protocol message: the first payload byte is the
    /// locally-assigned extension ID (0 is always the extension handshake
    /// itself), the remainder is the extension-specific payload.
    Extension { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Returns the message's wire ID, or `None` for the synthetic
    /// `KeepAlive` variant, which has no ID on the wire.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Extension { .. } => Some(MessageId::Extension),
        }
    }
}

pub(crate) struct PeerCodec;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        loop {
            if src.len() < 4 {
                return Ok(None);
            }

            let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

            if len == 0 {
                // keep-alive: bare 4-byte zero, consume and yield it
                src.advance(4);
                return Ok(Some(Message::KeepAlive));
            }

            if src.len() < 4 + len {
                src.reserve(4 + len - src.len());
                return Ok(None);
            }

            let id = src[4];
            let payload = src[5..4 + len].to_vec();
            src.advance(4 + len);

            let id = match MessageId::from_u8(id) {
                Some(id) => id,
                None => {
                    // unknown message id: bytes already drained above, just
                    // discard and keep looking for the next frame
                    continue;
                }
            };

            return Ok(Some(decode_payload(id, payload)?));
        }
    }
}

fn decode_payload(id: MessageId, payload: Vec<u8>) -> Result<Message, Error> {
    match id {
        MessageId::Choke => Ok(Message::Choke),
        MessageId::Unchoke => Ok(Message::Unchoke),
        MessageId::Interested => Ok(Message::Interested),
        MessageId::NotInterested => Ok(Message::NotInterested),
        MessageId::Have => {
            if payload.len() != 4 {
                return Err(Error::InvalidMessage);
            }
            let piece_index = u32::from_be_bytes([
                payload[0], payload[1], payload[2], payload[3],
            ]) as PieceIndex;
            Ok(Message::Have { piece_index })
        }
        MessageId::Bitfield => {
            let bitfield: Bitfield = BitVec::<Msb0, u8>::from_vec(payload);
            Ok(Message::Bitfield(bitfield))
        }
        MessageId::Request | MessageId::Cancel => {
            if payload.len() != 12 {
                return Err(Error::InvalidMessage);
            }
            let piece_index = u32::from_be_bytes([
                payload[0], payload[1], payload[2], payload[3],
            ]) as PieceIndex;
            let offset = u32::from_be_bytes([
                payload[4], payload[5], payload[6], payload[7],
            ]);
            let len = u32::from_be_bytes([
                payload[8], payload[9], payload[10], payload[11],
            ]);
            let block = BlockInfo { piece_index, offset, len };
            if id == MessageId::Request {
                Ok(Message::Request(block))
            } else {
                Ok(Message::Cancel(block))
            }
        }
        MessageId::Piece => {
            if payload.len() < 8 {
                return Err(Error::InvalidMessage);
            }
            let piece_index = u32::from_be_bytes([
                payload[0], payload[1], payload[2], payload[3],
            ]) as PieceIndex;
            let offset = u32::from_be_bytes([
                payload[4], payload[5], payload[6], payload[7],
            ]);
            let data = payload[8..].to_vec();
            Ok(Message::Block { piece_index, offset, data })
        }
        MessageId::Extension => {
            if payload.is_empty() {
                return Err(Error::InvalidExtensionMessage);
            }
            let id = payload[0];
            let payload = payload[1..].to_vec();
            Ok(Message::Extension { id, payload })
        }
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Error> {
        match msg {
            Message::KeepAlive => {
                dst.reserve(4);
                dst.put_u32(0);
            }
            Message::Choke => encode_header_only(dst, MessageId::Choke),
            Message::Unchoke => encode_header_only(dst, MessageId::Unchoke),
            Message::Interested => encode_header_only(dst, MessageId::Interested),
            Message::NotInterested => {
                encode_header_only(dst, MessageId::NotInterested)
            }
            Message::Have { piece_index } => {
                dst.reserve(4 + 1 + 4);
                dst.put_u32(5);
                dst.put_u8(MessageId::Have as u8);
                dst.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                dst.reserve(4 + 1 + bytes.len());
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.put_slice(&bytes);
            }
            Message::Request(block) => {
                encode_block_info(dst, MessageId::Request, block);
            }
            Message::Cancel(block) => {
                encode_block_info(dst, MessageId::Cancel, block);
            }
            Message::Block { piece_index, offset, data } => {
                dst.reserve(4 + 1 + 8 + data.len());
                dst.put_u32(9 + data.len() as u32);
                dst.put_u8(MessageId::Piece as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.put_slice(&data);
            }
            Message::Extension { id, payload } => {
                dst.reserve(4 + 1 + 1 + payload.len());
                dst.put_u32(2 + payload.len() as u32);
                dst.put_u8(MessageId::Extension as u8);
                dst.put_u8(id);
                dst.put_slice(&payload);
            }
        }
        Ok(())
    }
}

fn encode_header_only(dst: &mut BytesMut, id: MessageId) {
    dst.reserve(5);
    dst.put_u32(1);
    dst.put_u8(id as u8);
}

fn encode_block_info(dst: &mut BytesMut, id: MessageId, block: BlockInfo) {
    dst.reserve(4 + 1 + 12);
    dst.put_u32(13);
    dst.put_u8(id as u8);
    dst.put_u32(block.piece_index as u32);
    dst.put_u32(block.offset);
    dst.put_u32(block.len);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) -> Message {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        PeerCodec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn keep_alive_round_trips() {
        assert_eq!(round_trip(Message::KeepAlive), Message::KeepAlive);
    }

    #[test]
    fn simple_messages_round_trip() {
        assert_eq!(round_trip(Message::Choke), Message::Choke);
        assert_eq!(round_trip(Message::Unchoke), Message::Unchoke);
        assert_eq!(round_trip(Message::Interested), Message::Interested);
        assert_eq!(round_trip(Message::NotInterested), Message::NotInterested);
    }

    #[test]
    fn have_round_trips() {
        let msg = Message::Have { piece_index: 42 };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn request_and_cancel_round_trip() {
        let block = BlockInfo { piece_index: 3, offset: 16384, len: 16384 };
        assert_eq!(round_trip(Message::Request(block)), Message::Request(block));
        assert_eq!(round_trip(Message::Cancel(block)), Message::Cancel(block));
    }

    #[test]
    fn block_round_trips() {
        let msg = Message::Block { piece_index: 1, offset: 0, data: vec![1, 2, 3, 4] };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn extension_message_round_trips() {
        let msg = Message::Extension { id: 3, payload: vec![0xde, 0xad] };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn unknown_message_id_is_drained_and_discarded() {
        let mut buf = BytesMut::new();
        // an unrecognized id (99) followed by a valid choke message
        buf.put_u32(3);
        buf.put_u8(99);
        buf.put_slice(&[1, 2]);
        buf.put_u32(1);
        buf.put_u8(MessageId::Choke as u8);

        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, Message::Choke);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Have as u8);
        // missing the 4-byte piece index payload
        assert!(PeerCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn bitfield_round_trips() {
        let mut bits: Bitfield = BitVec::<Msb0, u8>::from_vec(vec![0b1010_0000]);
        bits.resize(8, false);
        let msg = Message::Bitfield(bits.clone());
        match round_trip(msg) {
            Message::Bitfield(got) => assert_eq!(got, bits),
            other => panic!("expected Bitfield, got {:?}", other),
        }
    }
}
