//! The bit-addressable have-set over piece indices (spec.md §2 "Bitfield",
//! §4.1, §8 invariant 7).
//!
//! The wire representation is most-significant-bit first: the highest bit of
//! the first byte represents piece 0, the next highest piece 1, and so on,
//! so a wire byte of `0b1100_0001` means the peer has pieces 0, 1 and 7.

use bitvec::prelude::{BitVec, Msb0};

use crate::PieceIndex;

/// The piece availability bitfield. A truthy value at position `i` means the
/// peer has piece `i`.
pub type Bitfield = BitVec<Msb0, u8>;

/// Returns an all-zero bitfield sized to `piece_count` pieces.
pub(crate) fn empty(piece_count: usize) -> Bitfield {
    let mut bitfield = Bitfield::new();
    bitfield.resize(piece_count, false);
    bitfield
}

/// Convenience accessors shared by sessions and the piece picker.
pub(crate) trait BitfieldExt {
    /// Returns whether the peer has the piece at `index`. Out-of-bounds
    /// indices are treated as not-had rather than panicking, since a
    /// malformed or short wire bitfield must not crash the session.
    fn has(&self, index: PieceIndex) -> bool;

    /// Marks the piece at `index` as had. A no-op if `index` is out of
    /// bounds.
    fn set_piece(&mut self, index: PieceIndex);
}

impl BitfieldExt for Bitfield {
    fn has(&self, index: PieceIndex) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }

    fn set_piece(&mut self, index: PieceIndex) {
        if index < self.len() {
            self.set(index, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_and_set_are_consistent_over_an_otherwise_zero_bitfield() {
        let total_pieces = 16;
        for i in 0..total_pieces {
            let mut bitfield = empty(total_pieces);
            bitfield.set_piece(i);
            for j in 0..total_pieces {
                assert_eq!(bitfield.has(j), j == i);
            }
        }
    }

    #[test]
    fn out_of_bounds_access_does_not_panic() {
        let bitfield = empty(4);
        assert!(!bitfield.has(100));
        let mut bitfield = bitfield;
        // setting an out of bounds piece is a silent no-op
        bitfield.set_piece(100);
    }

    #[test]
    fn msb_first_byte_layout_matches_wire_order() {
        // 0b1100_0001 => pieces 0, 1 and 7
        let mut bitfield: Bitfield = Bitfield::from_vec(vec![0b1100_0001]);
        bitfield.resize(8, false);
        assert!(bitfield.has(0));
        assert!(bitfield.has(1));
        for i in 2..7 {
            assert!(!bitfield.has(i));
        }
        assert!(bitfield.has(7));
    }

    #[test]
    fn resize_truncates_trailing_padding_bits() {
        // a 10-piece torrent pads its last wire byte with 6 zero bits
        let mut bitfield: Bitfield = Bitfield::from_vec(vec![0xFF, 0xFF]);
        bitfield.resize(10, false);
        assert_eq!(bitfield.len(), 10);
        assert!(bitfield.iter().all(|b| *b));
    }
}
