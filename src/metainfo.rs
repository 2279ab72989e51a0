//! Parsing of `.torrent` metainfo files (spec.md §6 "Metainfo file") and
//! their conversion into a [`Torrent`](crate::torrent::Torrent).
//!
//! The bencode codec itself is out of scope for this crate (spec.md §1): all
//! decoding goes through `serde_bencode`. Computing the canonical
//! `info_hash` is handled specially (see [`Metainfo::info_hash`]) since the
//! spec only requires that its SHA-1 matches what trackers and peers expect,
//! not that we preserve the original byte layout.

use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    torrent::{FileEntry, Torrent},
    PeerId, Sha1Hash,
};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(buf).map_err(Error::Bencode)
    }

    /// Computes the torrent's info hash by locating the `info` value in the
    /// generic bencode tree and re-encoding just that sub-value.
    ///
    /// `serde_bencode::value::Value::Dict` is backed by a `BTreeMap`, so
    /// re-encoding always produces lexicographically sorted keys regardless
    /// of the byte order the original file used, which is the canonical form
    /// the BitTorrent protocol expects (spec.md §1's explicit allowance to
    /// "re-encode the parsed dictionary").
    pub fn info_hash(buf: &[u8]) -> Result<Sha1Hash> {
        let value: Value = serde_bencode::from_bytes(buf)?;
        let dict = match value {
            Value::Dict(d) => d,
            _ => {
                return Err(Error::InvalidMetainfo(
                    "top-level value is not a dictionary".into(),
                ))
            }
        };
        let info = dict.get(b"info".as_ref()).ok_or_else(|| {
            Error::InvalidMetainfo("missing info dictionary".into())
        })?;
        let encoded = serde_bencode::to_bytes(info)?;
        let digest = Sha1::digest(&encoded);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        Ok(hash)
    }

    /// Consumes this metainfo and its already-computed info hash, producing
    /// the engine's internal [`Torrent`] representation.
    pub fn into_torrent(self, info_hash: Sha1Hash, peer_id: PeerId) -> Result<Torrent> {
        self.info.into_torrent(info_hash, self.announce, peer_id)
    }
}

#[derive(Debug, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct File {
    pub path: Vec<ByteBuf>,
    pub length: u64,
}

impl Info {
    /// Splits the concatenated `pieces` byte string into individual 20-byte
    /// SHA-1 digests, one per piece (spec.md §3 `piece_hashes`).
    fn piece_hashes(&self) -> Result<Vec<Sha1Hash>> {
        if self.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "pieces length is not a multiple of 20".into(),
            ));
        }
        Ok(self
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    fn total_length(&self) -> Result<u64> {
        match (&self.length, &self.files) {
            (Some(length), None) => Ok(*length),
            (None, Some(files)) => Ok(files.iter().map(|f| f.length).sum()),
            _ => Err(Error::InvalidMetainfo(
                "info must have exactly one of length or files".into(),
            )),
        }
    }

    fn file_entries(&self) -> Vec<FileEntry> {
        match &self.files {
            None => Vec::new(),
            Some(files) => files
                .iter()
                .map(|f| FileEntry {
                    length: f.length,
                    path_segments: f
                        .path
                        .iter()
                        .map(|segment| String::from_utf8_lossy(segment).into_owned())
                        .collect(),
                })
                .collect(),
        }
    }

    pub(crate) fn into_torrent(
        self,
        info_hash: Sha1Hash,
        announce: String,
        peer_id: PeerId,
    ) -> Result<Torrent> {
        let piece_hashes = self.piece_hashes()?;
        let total_length = self.total_length()?;
        let files = self.file_entries();
        Ok(Torrent {
            info_hash,
            piece_length: self.piece_length,
            piece_hashes,
            total_length,
            name: self.name,
            files,
            announce,
            peer_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_bytes() -> Vec<u8> {
        // d8:announce9:udp://tr4:infod6:lengthi10e4:name3:foo12:piece lengthi16e6:pieces20:AAAAAAAAAAAAAAAAAAAAee
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce9:udp://tr4:infod6:lengthi10e4:name3:foo12:piece lengthi16e6:pieces20:");
        buf.extend_from_slice(&[b'A'; 20]);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn parses_single_file_metainfo() {
        let bytes = single_file_bytes();
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(metainfo.announce, "udp://tr");
        assert_eq!(metainfo.info.name, "foo");
        assert_eq!(metainfo.info.length, Some(10));
        assert!(metainfo.info.files.is_none());
    }

    #[test]
    fn info_hash_is_stable_regardless_of_key_order_in_source() {
        let bytes = single_file_bytes();
        let hash_a = Metainfo::info_hash(&bytes).unwrap();
        // re-encoding the same logical dict with keys in a different order
        // in the source bytes must still produce the same hash, since the
        // hash is computed over a canonical (sorted-key) re-encoding
        let reordered = b"d8:announce9:udp://tr4:infod4:name3:foo6:lengthi10e12:piece lengthi16e6:pieces20:AAAAAAAAAAAAAAAAAAAAee";
        let mut reordered = reordered.to_vec();
        // patch in real 20 'A' bytes in place of the placeholder text above
        let marker = b"pieces20:";
        let pos = reordered.windows(marker.len()).position(|w| w == marker).unwrap() + marker.len();
        reordered.splice(pos..pos + 20, std::iter::repeat(b'A').take(20));
        let hash_b = Metainfo::info_hash(&reordered).unwrap();
        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn rejects_pieces_not_a_multiple_of_twenty() {
        let info = Info {
            name: "x".into(),
            pieces: vec![0; 19],
            piece_length: 16,
            length: Some(10),
            files: None,
            private: None,
        };
        assert!(info.piece_hashes().is_err());
    }

    #[test]
    fn multi_file_entries_preserve_order_and_lossily_decode_paths() {
        let info = Info {
            name: "root".into(),
            pieces: vec![0; 20],
            piece_length: 16,
            length: None,
            files: Some(vec![
                File { path: vec![ByteBuf::from(b"a".to_vec())], length: 4 },
                File {
                    path: vec![
                        ByteBuf::from(b"dir".to_vec()),
                        ByteBuf::from(b"b".to_vec()),
                    ],
                    length: 6,
                },
            ]),
            private: None,
        };
        assert_eq!(info.total_length().unwrap(), 10);
        let entries = info.file_entries();
        assert_eq!(entries[0].path_segments, vec!["a"]);
        assert_eq!(entries[1].path_segments, vec!["dir", "b"]);
    }
}
