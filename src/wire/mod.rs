//! The peer wire protocol: handshake, message framer, and the BEP-10
//! extension protocol plus its `ut_metadata` subprotocol (spec.md §4.1,
//! §4.2, §4.4 item 1, §4.6).

mod extension;
mod handshake;
mod message;

pub(crate) use extension::{
    ExtensionHandshake, MetadataMessage, METADATA_MSG_DATA, METADATA_MSG_REJECT,
    METADATA_MSG_REQUEST, METADATA_PIECE_LEN, UT_METADATA, UT_METADATA_LOCAL_ID,
};
pub(crate) use handshake::{Handshake, HandshakeCodec, PROTOCOL_STRING};
pub(crate) use message::{Message, MessageId, PeerCodec};
