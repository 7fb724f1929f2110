//! Byte range to piece arithmetic.

use crate::torrent::PieceIndex;

/// Inclusive piece range covering `size` bytes at `offset`, clamped to the torrent.
///
/// An empty region maps to the single piece containing `offset`.
pub fn region_pieces(
    offset: u64,
    size: u64,
    piece_length: u32,
    piece_count: u32,
) -> (PieceIndex, PieceIndex) {
    if piece_length == 0 || piece_count == 0 {
        return (PieceIndex(0), PieceIndex(0));
    }
    let piece_length = piece_length as u64;
    let last_index = (piece_count - 1) as u64;

    let first = (offset / piece_length).min(last_index);
    let last = ((offset + size.max(1) - 1) / piece_length).min(last_index);
    (PieceIndex(first as u32), PieceIndex(last as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_covers_partial_pieces() {
        assert_eq!(
            region_pieces(16000, 1000, 16384, 10),
            (PieceIndex(0), PieceIndex(1))
        );
        assert_eq!(
            region_pieces(0, 100_000, 16384, 7),
            (PieceIndex(0), PieceIndex(6))
        );
    }

    #[test]
    fn test_region_is_clamped_to_piece_count() {
        assert_eq!(
            region_pieces(0, 1_000_000, 16384, 7),
            (PieceIndex(0), PieceIndex(6))
        );
    }

    #[test]
    fn test_empty_region_is_single_piece() {
        assert_eq!(region_pieces(40_000, 0, 16384, 7), (PieceIndex(2), PieceIndex(2)));
    }
}
