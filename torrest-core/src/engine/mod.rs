//! Boundary to the BitTorrent download engine.
//!
//! The engine downloads pieces asynchronously and out of order. The streaming
//! layer only steers it through piece priorities and deadlines, reads bytes
//! back through `read_piece` or an attached `PieceStorage`, and learns about
//! progress from the `Alert` queue.

pub mod alerts;
pub mod status;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use alerts::{Alert, SessionCounters};
pub use status::{EngineState, EngineStatus, PartialPiece};

use crate::storage::{PieceStorage, StorageType};
use crate::torrent::{InfoHash, PieceIndex, TorrentInfo};

/// Piece and file priorities understood by the engine.
pub mod priority {
    /// Not wanted, the engine never requests the piece.
    pub const DONT_DOWNLOAD: u8 = 0;
    pub const LOW: u8 = 1;
    pub const DEFAULT: u8 = 4;
    /// Second highest level, used for pieces right behind the read cursor.
    pub const READER_NEXT: u8 = 6;
    pub const TOP: u8 = 7;
}

/// Errors reported by the download engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid torrent source: {reason}")]
    InvalidSource { reason: String },

    #[error("Invalid metainfo: {reason}")]
    Metainfo { reason: String },

    #[error("Torrent {info_hash} is already added")]
    DuplicateTorrent { info_hash: InfoHash },

    #[error("Torrent {info_hash} is not known to the engine")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("Reading piece {piece} failed: {reason}")]
    ReadFailed { piece: PieceIndex, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the engine takes a torrent from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentSource {
    /// `magnet:` URI, metadata arrives later through `Alert::MetadataReceived`
    Magnet(String),
    /// Raw bencoded `.torrent` content
    Metainfo(Vec<u8>),
}

/// Parameters for `EngineSession::add_torrent`.
#[derive(Debug, Clone)]
pub struct AddTorrentParams {
    pub source: TorrentSource,
    pub save_path: PathBuf,
    /// Already resolved, never `StorageType::Automatic`
    pub storage: StorageType,
    pub paused: bool,
    pub sequential_download: bool,
    pub resume_data: Option<Vec<u8>>,
}

/// Per-torrent capability set of the engine.
///
/// Implementations must not hold internal locks while calling into an
/// attached `PieceStorage`, since storage eviction calls back into
/// `forget_piece`, `set_piece_priority` and `reset_piece_deadline`.
pub trait EngineTorrent: Send + Sync {
    fn info_hash(&self) -> InfoHash;

    /// Metadata, `None` until it has been received for magnet links.
    fn torrent_info(&self) -> Option<Arc<TorrentInfo>>;

    fn status(&self) -> EngineStatus;

    fn have_piece(&self, piece: PieceIndex) -> bool;

    fn piece_priority(&self, piece: PieceIndex) -> u8;

    /// Priorities of every piece, indexed by piece.
    fn piece_priorities(&self) -> Vec<u8>;

    fn set_piece_priority(&self, piece: PieceIndex, priority: u8);

    /// Applies a batch of priorities at once.
    fn prioritize_pieces(&self, priorities: &[(PieceIndex, u8)]);

    /// Asks for `piece` to be completed within `deadline`.
    fn set_piece_deadline(&self, piece: PieceIndex, deadline: Duration);

    fn reset_piece_deadline(&self, piece: PieceIndex);

    /// Marks the piece as not had, its bytes are gone from storage.
    fn forget_piece(&self, piece: PieceIndex);

    /// Pieces currently being downloaded with their received byte counts.
    fn download_queue(&self) -> Vec<PartialPiece>;

    fn file_priority(&self, file: usize) -> u8;

    fn set_file_priority(&self, file: usize, priority: u8);

    /// Downloaded bytes per file, indexed by file.
    fn file_progress(&self) -> Vec<u64>;

    /// Hands the engine the storage it must write memory-backed pieces into.
    fn attach_storage(&self, storage: Arc<dyn PieceStorage>);

    /// Reads piece bytes from the engine's own disk storage.
    ///
    /// # Errors
    ///
    /// - `EngineError::ReadFailed` - The piece data could not be read
    fn read_piece(
        &self,
        piece: PieceIndex,
        offset: u32,
        out: &mut [u8],
    ) -> Result<usize, EngineError>;

    fn pause(&self);

    fn resume(&self);

    fn set_sequential_download(&self, sequential: bool);

    /// Requests resume data; the answer arrives as `Alert::SaveResumeData`.
    fn save_resume_data(&self);

    /// Bencoded `.torrent` content once metadata is known.
    fn metainfo(&self) -> Option<Vec<u8>>;
}

/// Session-wide capability set of the engine.
pub trait EngineSession: Send + Sync {
    /// Adds a torrent and returns its engine handle.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidSource` - Magnet URI or metainfo cannot be parsed
    /// - `EngineError::DuplicateTorrent` - The info hash is already known
    fn add_torrent(&self, params: AddTorrentParams) -> Result<Arc<dyn EngineTorrent>, EngineError>;

    /// Removes a torrent, optionally deleting downloaded files.
    ///
    /// # Errors
    ///
    /// - `EngineError::TorrentNotFound` - The info hash is unknown
    fn remove_torrent(&self, info_hash: InfoHash, delete_files: bool) -> Result<(), EngineError>;

    /// Drains the pending alerts.
    fn pop_alerts(&self) -> Vec<Alert>;

    /// Requests an `Alert::StateUpdate` for all torrents.
    fn post_torrent_updates(&self);

    /// Requests an `Alert::SessionStats`.
    fn post_session_stats(&self);

    fn pause(&self);

    fn resume(&self);

    fn is_paused(&self) -> bool;
}

/// Extracts the info hash from a magnet URI.
///
/// # Errors
///
/// - `EngineError::InvalidSource` - Malformed URI or missing `btih` topic
pub fn magnet_info_hash(uri: &str) -> Result<InfoHash, EngineError> {
    magnet_url::Magnet::new(uri).map_err(|e| EngineError::InvalidSource {
        reason: format!("Invalid magnet link: {e}"),
    })?;

    let query = uri.split_once('?').map(|(_, query)| query).unwrap_or(uri);

    query
        .split('&')
        .find_map(|param| param.strip_prefix("xt=urn:btih:"))
        .and_then(|hash| hash.parse::<InfoHash>().ok())
        .ok_or_else(|| EngineError::InvalidSource {
            reason: format!("Missing or invalid info hash in magnet link: {uri}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnet_info_hash_extraction() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=movie.mp4";
        let hash = magnet_info_hash(uri).unwrap();
        assert_eq!(hash.to_string(), "0123456789abcdef0123456789abcdef01234567");
    }

    #[test]
    fn test_magnet_without_btih_is_rejected() {
        let result = magnet_info_hash("magnet:?dn=movie.mp4");
        assert!(matches!(result, Err(EngineError::InvalidSource { .. })));
    }
}
