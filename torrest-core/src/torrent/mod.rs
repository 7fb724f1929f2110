//! Torrents as seen by the streaming layer: identity, metadata, state and piece scheduling

pub mod handle;
pub mod info;
pub mod metainfo;
pub mod priority;
pub mod state;
pub mod status;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use handle::{Torrent, TorrentOptions, TrackerInfo};
pub use info::{FileEntry, TorrentInfo};
pub use metainfo::{Metainfo, TorrentCreator};
pub use state::{TorrentState, derive_state};
pub use status::{FileStatus, SessionStatus, TorrentStatus};

use crate::engine::EngineError;
use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary. Displayed and serialized as
/// 40 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for InfoHash {
    type Err = TorrentError;

    /// Parses 40 hex characters, ignoring surrounding whitespace and case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TorrentError::InvalidInfoHash {
            value: s.to_string(),
        };

        let trimmed = s.trim();
        if trimmed.len() != 40 {
            return Err(invalid());
        }

        let bytes = hex::decode(trimmed.to_ascii_lowercase()).map_err(|_| invalid())?;
        let hash: [u8; 20] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Self(hash))
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index for slice addressing.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PieceIndex {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

/// Errors surfaced by torrent lookups and torrent-level operations.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("File {index} not found in torrent {info_hash}")]
    FileNotFound { info_hash: InfoHash, index: usize },

    #[error("Metadata for torrent {info_hash} is not available")]
    MetadataUnavailable { info_hash: InfoHash },

    #[error("Invalid info hash: {value}")]
    InvalidInfoHash { value: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_info_hash_parse_accepts_upper_case_and_whitespace() {
        let parsed: InfoHash = " 0123456789ABCDEF0123456789abcdef01234567 ".parse().unwrap();
        assert_eq!(parsed.as_bytes()[1], 0x23);
        assert_eq!(
            parsed.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_info_hash_parse_rejects_bad_input() {
        assert!("abc".parse::<InfoHash>().is_err());
        assert!(
            "zz23456789abcdef0123456789abcdef01234567"
                .parse::<InfoHash>()
                .is_err()
        );
    }

    #[test]
    fn test_info_hash_serializes_as_hex() {
        let info_hash = InfoHash::new([0xab; 20]);
        let json = serde_json::to_string(&info_hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(20)));

        let back: InfoHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info_hash);
    }

    #[test]
    fn test_piece_index_ordering() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
        assert_eq!(piece2.as_usize(), 10);
        assert_eq!(piece2.to_string(), "10");
    }
}
