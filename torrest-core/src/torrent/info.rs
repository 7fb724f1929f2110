//! Torrent metadata in the shape the streaming layer needs.

use crate::torrent::PieceIndex;

/// One file of a torrent with its position inside the concatenated content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the save directory, `/` separated
    pub path: String,
    /// Last path component
    pub name: String,
    pub size: u64,
    /// Byte offset of the file inside the torrent content
    pub offset: u64,
}

/// Piece geometry and file layout of a torrent, available once metadata is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u32,
    pub total_size: u64,
    pub files: Vec<FileEntry>,
}

impl TorrentInfo {
    /// Builds the layout from `(path, size)` pairs in torrent order.
    pub fn new(name: impl Into<String>, piece_length: u32, files: Vec<(String, u64)>) -> Self {
        let mut offset = 0;
        let files = files
            .into_iter()
            .map(|(path, size)| {
                let name = path.rsplit('/').next().unwrap_or(&path).to_string();
                let entry = FileEntry {
                    path,
                    name,
                    size,
                    offset,
                };
                offset += size;
                entry
            })
            .collect();

        Self {
            name: name.into(),
            piece_length,
            total_size: offset,
            files,
        }
    }

    /// Number of pieces covering the content.
    pub fn piece_count(&self) -> u32 {
        if self.piece_length == 0 {
            return 0;
        }
        self.total_size.div_ceil(self.piece_length as u64) as u32
    }

    /// Length of `piece`; the last piece may be shorter, pieces past the end are empty.
    pub fn piece_size(&self, piece: PieceIndex) -> u32 {
        let start = self.piece_offset(piece);
        if start >= self.total_size {
            return 0;
        }
        (self.total_size - start).min(self.piece_length as u64) as u32
    }

    /// Offset of `piece` inside the torrent content.
    pub fn piece_offset(&self, piece: PieceIndex) -> u64 {
        piece.as_u32() as u64 * self.piece_length as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_offsets_accumulate() {
        let info = TorrentInfo::new(
            "show",
            16384,
            vec![
                ("show/episode1.mkv".to_string(), 40_000),
                ("show/episode2.mkv".to_string(), 60_000),
            ],
        );

        assert_eq!(info.total_size, 100_000);
        assert_eq!(info.files[0].offset, 0);
        assert_eq!(info.files[1].offset, 40_000);
        assert_eq!(info.files[1].name, "episode2.mkv");
    }

    #[test]
    fn test_piece_geometry() {
        let info = TorrentInfo::new("movie.mp4", 16384, vec![("movie.mp4".to_string(), 100_000)]);

        assert_eq!(info.piece_count(), 7);
        assert_eq!(info.piece_size(PieceIndex(0)), 16384);
        assert_eq!(info.piece_size(PieceIndex(6)), 100_000 - 6 * 16384);
        assert_eq!(info.piece_size(PieceIndex(7)), 0);
        assert_eq!(info.piece_offset(PieceIndex(2)), 32768);
    }

    #[test]
    fn test_empty_torrent_has_no_pieces() {
        let info = TorrentInfo::new("empty", 16384, vec![]);
        assert_eq!(info.piece_count(), 0);
    }
}
