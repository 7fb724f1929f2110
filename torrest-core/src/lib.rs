//! Torrest Core - piece buffering and streaming reads over a BitTorrent engine
//!
//! This crate holds the streaming half of Torrest: the bounded in-memory piece
//! storage, the per-reader scheduling that decides which pieces the engine
//! should fetch next, blocking range readers for the HTTP layer, and the
//! session that dispatches engine alerts and runs the background loops.

pub mod config;
pub mod engine;
pub mod session;
pub mod shutdown;
pub mod storage;
pub mod streaming;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::TorrestConfig;
pub use engine::{EngineError, EngineSession, EngineTorrent};
pub use session::Session;
pub use shutdown::Shutdown;
pub use storage::{MemoryStorage, StorageBackend, StorageError, StorageType};
pub use streaming::{ByteRange, File, Reader};
pub use torrent::{InfoHash, PieceIndex, Torrent, TorrentError};

/// Core errors that can bubble up from any Torrest subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TorrestError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TorrestError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            TorrestError::Torrent(e) => match e {
                TorrentError::TorrentNotFound { info_hash } => {
                    format!("Torrent {info_hash} not found")
                }
                TorrentError::FileNotFound { index, .. } => {
                    format!("File {index} not found in torrent")
                }
                TorrentError::InvalidInfoHash { value } => {
                    format!("Invalid info hash: {value}")
                }
                TorrentError::MetadataUnavailable { .. } => {
                    "Torrent metadata is not available yet".to_string()
                }
                _ => "Torrent operation failed".to_string(),
            },
            TorrestError::Storage(_) => "Storage error occurred".to_string(),
            TorrestError::Engine(EngineError::DuplicateTorrent { info_hash }) => {
                format!("Torrent {info_hash} is already added")
            }
            TorrestError::Engine(_) => "Download engine error occurred".to_string(),
            TorrestError::Configuration { reason } => format!("Invalid configuration: {reason}"),
            TorrestError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TorrestError::Configuration { .. }
                | TorrestError::Torrent(TorrentError::InvalidInfoHash { .. })
                | TorrestError::Engine(EngineError::InvalidSource { .. })
                | TorrestError::Engine(EngineError::DuplicateTorrent { .. })
        )
    }

    /// Checks if this error reports a missing torrent or file.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TorrestError::Torrent(TorrentError::TorrentNotFound { .. })
                | TorrestError::Torrent(TorrentError::FileNotFound { .. })
                | TorrestError::Engine(EngineError::TorrentNotFound { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, TorrestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let err = TorrestError::from(TorrentError::TorrentNotFound {
            info_hash: InfoHash::new([7u8; 20]),
        });
        assert!(err.is_not_found());
        assert!(!err.is_user_error());
        assert!(err.user_message().contains("0707"));
    }

    #[test]
    fn test_configuration_is_user_error() {
        let err = TorrestError::Configuration {
            reason: "memory size must be positive".to_string(),
        };
        assert!(err.is_user_error());
        assert_eq!(
            err.user_message(),
            "Invalid configuration: memory size must be positive"
        );
    }
}
