//! Fixed-size set of piece indices.

use crate::torrent::PieceIndex;

/// Bitset over the pieces of one torrent.
///
/// Indices past the size the set was created with are never members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PieceSet {
    bits: Vec<bool>,
    len: usize,
}

impl PieceSet {
    pub fn with_capacity(piece_count: u32) -> Self {
        Self {
            bits: vec![false; piece_count as usize],
            len: 0,
        }
    }

    /// Builds a set from `pieces`, dropping indices out of range.
    pub fn from_pieces(piece_count: u32, pieces: impl IntoIterator<Item = PieceIndex>) -> Self {
        let mut set = Self::with_capacity(piece_count);
        for piece in pieces {
            set.insert(piece);
        }
        set
    }

    pub fn contains(&self, piece: PieceIndex) -> bool {
        self.bits.get(piece.as_usize()).copied().unwrap_or(false)
    }

    /// Returns true if the piece was newly added.
    pub fn insert(&mut self, piece: PieceIndex) -> bool {
        match self.bits.get_mut(piece.as_usize()) {
            Some(bit) if !*bit => {
                *bit = true;
                self.len += 1;
                true
            }
            _ => false,
        }
    }

    /// Returns true if the piece was a member.
    pub fn remove(&mut self, piece: PieceIndex) -> bool {
        match self.bits.get_mut(piece.as_usize()) {
            Some(bit) if *bit => {
                *bit = false;
                self.len -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|bit| *bit = false);
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, bit)| **bit)
            .map(|(index, _)| PieceIndex(index as u32))
    }
}
