//! Reassembly and verification of a torrent's `info` dictionary fetched
//! piece by piece over the `ut_metadata` extension (BEP-9), spec.md §4.6.

use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    metainfo::Info,
    wire::METADATA_PIECE_LEN,
    Sha1Hash,
};

/// Accumulates `ut_metadata` `Data` message payloads into the complete,
/// contiguous `info` dictionary bytes.
///
/// Pieces may arrive out of order (nothing in BEP-9 guarantees otherwise),
/// so each is placed directly at its slot rather than appended.
pub(crate) struct MetadataAssembler {
    metadata_size: usize,
    pieces: Vec<Option<Vec<u8>>>,
}

impl MetadataAssembler {
    pub fn new(metadata_size: i64) -> Result<Self> {
        if metadata_size <= 0 {
            return Err(Error::InvalidMetainfo("metadata_size must be positive".into()));
        }
        let metadata_size = metadata_size as usize;
        let piece_count = (metadata_size + METADATA_PIECE_LEN - 1) / METADATA_PIECE_LEN;
        Ok(Self { metadata_size, pieces: vec![None; piece_count] })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn set_piece(&mut self, index: usize, data: Vec<u8>) -> Result<()> {
        let slot = self
            .pieces
            .get_mut(index)
            .ok_or_else(|| Error::InvalidMetainfo(format!("metadata piece index {} out of range", index)))?;
        *slot = Some(data);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    /// Concatenates every piece into the final `info` dictionary bytes,
    /// trimmed to the advertised `metadata_size` (the last piece is padded
    /// out to a 16 KiB boundary by no one, but may be shorter than
    /// `METADATA_PIECE_LEN`, so no trimming is actually expected to occur in
    /// practice -- this only guards against a malicious peer sending extra
    /// trailing bytes in the final piece).
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if !self.is_complete() {
            return Err(Error::InvalidMetainfo("metadata assembly incomplete".into()));
        }
        let mut bytes: Vec<u8> = self.pieces.into_iter().flatten().flatten().collect();
        bytes.truncate(self.metadata_size);
        if bytes.len() != self.metadata_size {
            return Err(Error::InvalidMetainfo("assembled metadata shorter than metadata_size".into()));
        }
        Ok(bytes)
    }
}

/// Verifies that reassembled metadata bytes hash to the info hash named in
/// the magnet link, then parses them as an `info` dictionary.
pub(crate) fn verify_and_parse(info_hash: Sha1Hash, info_bytes: Vec<u8>) -> Result<Info> {
    let digest = Sha1::digest(&info_bytes);
    if digest.as_slice() != info_hash {
        return Err(Error::MetadataHashMismatch);
    }
    serde_bencode::from_bytes(&info_bytes).map_err(Error::Bencode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_out_of_order_pieces() {
        let mut assembler = MetadataAssembler::new(METADATA_PIECE_LEN as i64 + 10).unwrap();
        assert_eq!(assembler.piece_count(), 2);
        assembler.set_piece(1, vec![9; 10]).unwrap();
        assert!(!assembler.is_complete());
        assembler.set_piece(0, vec![1; METADATA_PIECE_LEN]).unwrap();
        assert!(assembler.is_complete());

        let bytes = assembler.into_bytes().unwrap();
        assert_eq!(bytes.len(), METADATA_PIECE_LEN + 10);
        assert_eq!(&bytes[..METADATA_PIECE_LEN], &vec![1u8; METADATA_PIECE_LEN][..]);
        assert_eq!(&bytes[METADATA_PIECE_LEN..], &vec![9u8; 10][..]);
    }

    #[test]
    fn rejects_an_out_of_range_piece_index() {
        let mut assembler = MetadataAssembler::new(10).unwrap();
        assert!(assembler.set_piece(5, vec![0; 10]).is_err());
    }

    #[test]
    fn verify_and_parse_rejects_a_hash_mismatch() {
        let bytes = b"d4:name3:fooe".to_vec();
        let err = verify_and_parse([0; 20], bytes).unwrap_err();
        assert!(matches!(err, Error::MetadataHashMismatch));
    }

    #[test]
    fn verify_and_parse_accepts_matching_hash() {
        let bytes = b"d6:lengthi4e4:name3:foo12:piece lengthi4e6:pieces4:AAAAe".to_vec();
        let hash = Sha1::digest(&bytes);
        let mut expected = [0u8; 20];
        expected.copy_from_slice(&hash);
        let info = verify_and_parse(expected, bytes).unwrap();
        assert_eq!(info.name, "foo");
    }
}
