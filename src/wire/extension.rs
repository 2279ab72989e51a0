//! BEP-10 extension protocol handshake and the BEP-9 `ut_metadata`
//! subprotocol used to fetch the `info` dictionary from a magnet link
//! (spec.md §4.4 item 1, §4.6).

use std::collections::BTreeMap;

use serde_bencode::value::Value;

use crate::error::Error;

/// The name of the metadata-exchange extension, as negotiated in the `m`
/// dict of the extension handshake.
pub(crate) const UT_METADATA: &str = "ut_metadata";

/// The extension ID we assign to `ut_metadata` in our own handshake. Peers
/// address messages to us using this ID.
pub(crate) const UT_METADATA_LOCAL_ID: u8 = 1;

/// Sub-message IDs of the `ut_metadata` extension (BEP-9).
pub(crate) const METADATA_MSG_REQUEST: i64 = 0;
pub(crate) const METADATA_MSG_DATA: i64 = 1;
pub(crate) const METADATA_MSG_REJECT: i64 = 2;

/// The size, in bytes, of one metadata piece (all but possibly the last).
pub(crate) const METADATA_PIECE_LEN: usize = 16384;

/// The bencoded `{ "m": { "ut_metadata": 1 }, "metadata_size": N }`
/// extension handshake payload (spec.md §4.4 item 1). `metadata_size` is
/// omitted (by being `None`) when we don't yet know the torrent's metadata,
/// which is always true for us since we never seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExtensionHandshake {
    /// Extension name -> locally assigned ID, as advertised by whichever
    /// side sent this handshake.
    pub extensions: BTreeMap<String, u8>,
    /// The size of the `info` dictionary in bytes, if the sender knows it.
    pub metadata_size: Option<i64>,
}

impl ExtensionHandshake {
    /// Builds our own outgoing handshake, advertising support for
    /// `ut_metadata` at [`UT_METADATA_LOCAL_ID`].
    pub fn ours() -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert(UT_METADATA.to_string(), UT_METADATA_LOCAL_ID);
        Self { extensions, metadata_size: None }
    }

    /// Encodes this handshake as the payload of a type-20 extension message
    /// whose sub-ID is 0 (the handshake itself).
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut dict = BTreeMap::new();
        let mut m = BTreeMap::new();
        for (name, id) in &self.extensions {
            m.insert(name.clone().into_bytes(), Value::Int(*id as i64));
        }
        dict.insert(b"m".to_vec(), Value::Dict(m.into_iter().collect()));
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), Value::Int(size));
        }
        serde_bencode::to_bytes(&Value::Dict(dict.into_iter().collect())).map_err(Error::Bencode)
    }

    /// Parses a received extension handshake payload. Unknown keys are
    /// ignored, per BEP-10's forward-compatibility requirement.
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let value: Value = serde_bencode::from_bytes(payload)?;
        let dict = match value {
            Value::Dict(d) => d,
            _ => return Err(Error::InvalidExtensionMessage),
        };

        let mut extensions = BTreeMap::new();
        if let Some(Value::Dict(m)) = dict.get(b"m".as_ref()) {
            for (name, id) in m {
                if let Value::Int(id) = id {
                    if let Ok(name) = String::from_utf8(name.clone()) {
                        extensions.insert(name, *id as u8);
                    }
                }
            }
        }

        let metadata_size = match dict.get(b"metadata_size".as_ref()) {
            Some(Value::Int(size)) => Some(*size),
            _ => None,
        };

        Ok(Self { extensions, metadata_size })
    }

    /// Returns the remote-assigned extension ID for `ut_metadata`, if the
    /// peer advertised support for it.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.extensions.get(UT_METADATA).copied()
    }
}

/// One `ut_metadata` protocol message, as exchanged over extension ID
/// [`UT_METADATA_LOCAL_ID`]/the peer's equivalent (spec.md §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MetadataMessage {
    Request { piece: usize },
    Data { piece: usize, total_size: usize, data: Vec<u8> },
    Reject { piece: usize },
}

impl MetadataMessage {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut dict = BTreeMap::new();
        let (msg_type, piece, total_size) = match self {
            Self::Request { piece } => (METADATA_MSG_REQUEST, *piece, None),
            Self::Data { piece, total_size, .. } => {
                (METADATA_MSG_DATA, *piece, Some(*total_size))
            }
            Self::Reject { piece } => (METADATA_MSG_REJECT, *piece, None),
        };
        dict.insert(b"msg_type".to_vec(), Value::Int(msg_type));
        dict.insert(b"piece".to_vec(), Value::Int(piece as i64));
        if let Some(total_size) = total_size {
            dict.insert(b"total_size".to_vec(), Value::Int(total_size as i64));
        }
        let mut encoded = serde_bencode::to_bytes(&Value::Dict(dict.into_iter().collect()))?;
        if let Self::Data { data, .. } = self {
            encoded.extend_from_slice(data);
        }
        Ok(encoded)
    }

    /// Decodes a `ut_metadata` message. The dictionary is bencoded and, for
    /// `Data` messages, is immediately followed by the raw piece bytes
    /// (spec.md §4.6): we locate the dictionary's end by scanning for the
    /// length of the leading bencode value rather than trusting the bencode
    /// library to tell us how much of the buffer it consumed.
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let consumed = bencode_value_len(payload)?;
        let value: Value = serde_bencode::from_bytes(&payload[..consumed])?;

        let dict = match value {
            Value::Dict(d) => d,
            _ => return Err(Error::InvalidExtensionMessage),
        };

        let msg_type = match dict.get(b"msg_type".as_ref()) {
            Some(Value::Int(t)) => *t,
            _ => return Err(Error::InvalidExtensionMessage),
        };
        let piece = match dict.get(b"piece".as_ref()) {
            Some(Value::Int(p)) => *p as usize,
            _ => return Err(Error::InvalidExtensionMessage),
        };

        match msg_type {
            t if t == METADATA_MSG_REQUEST => Ok(Self::Request { piece }),
            t if t == METADATA_MSG_REJECT => Ok(Self::Reject { piece }),
            t if t == METADATA_MSG_DATA => {
                let total_size = match dict.get(b"total_size".as_ref()) {
                    Some(Value::Int(s)) => *s as usize,
                    _ => return Err(Error::InvalidExtensionMessage),
                };
                let data = payload[consumed..].to_vec();
                Ok(Self::Data { piece, total_size, data })
            }
            _ => Err(Error::InvalidExtensionMessage),
        }
    }
}

/// Returns the byte length of the single well-formed bencode value (of any
/// of the four primitive forms) starting at the front of `buf`. Used only to
/// find the boundary between the bencoded dict prefix and the raw trailing
/// bytes of a `ut_metadata` data message, since that framing has no length
/// marker of its own (spec.md §4.6).
fn bencode_value_len(buf: &[u8]) -> Result<usize, Error> {
    fn scan(buf: &[u8], pos: usize) -> Result<usize, Error> {
        match buf.get(pos) {
            Some(b'i') => {
                let end = find(buf, pos + 1, b'e')?;
                Ok(end + 1)
            }
            Some(b'l') | Some(b'd') => {
                let mut cursor = pos + 1;
                while buf.get(cursor) != Some(&b'e') {
                    if buf.get(cursor) == None {
                        return Err(Error::InvalidExtensionMessage);
                    }
                    if buf[pos] == b'd' {
                        // dict: key (always a byte string) then value
                        cursor = scan(buf, cursor)?;
                    }
                    cursor = scan(buf, cursor)?;
                }
                Ok(cursor + 1)
            }
            Some(c) if c.is_ascii_digit() => {
                let colon = find(buf, pos, b':')?;
                let len: usize = std::str::from_utf8(&buf[pos..colon])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(Error::InvalidExtensionMessage)?;
                let start = colon + 1;
                let end = start + len;
                if end > buf.len() {
                    return Err(Error::InvalidExtensionMessage);
                }
                Ok(end)
            }
            _ => Err(Error::InvalidExtensionMessage),
        }
    }

    fn find(buf: &[u8], from: usize, needle: u8) -> Result<usize, Error> {
        buf[from..]
            .iter()
            .position(|&b| b == needle)
            .map(|i| from + i)
            .ok_or(Error::InvalidExtensionMessage)
    }

    scan(buf, 0)
}
