//! Storage backends for piece data.
//!
//! Memory-backed torrents keep a bounded ring of piece buffers owned by
//! `MemoryStorage`; file-backed torrents read through the engine's own disk
//! storage. The backend of a torrent is picked once, when it is added, and
//! represented by `StorageBackend`.

pub mod buffer_pool;
pub mod memory_storage;
pub mod piece_set;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use buffer_pool::{BufferPool, PieceBuffer, PieceRecord};
pub use memory_storage::MemoryStorage;
pub use piece_set::PieceSet;

use crate::engine::EngineTorrent;
use crate::torrent::PieceIndex;

/// Storage interface the engine writes downloaded pieces into.
///
/// Both calls return the number of bytes copied; zero means the data is not
/// available (read) or was not accepted (write). Neither call blocks waiting
/// for data.
pub trait PieceStorage: Send + Sync {
    /// Enables reads and writes; called once the torrent is ready.
    fn initialize(&self);

    fn read(&self, piece: PieceIndex, offset: u32, out: &mut [u8]) -> usize;

    fn write(&self, piece: PieceIndex, offset: u32, data: &[u8]) -> usize;
}

/// Which storage a torrent uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Resolved to the configured default when the torrent is added
    #[default]
    Automatic,
    File,
    Memory,
}

impl StorageType {
    /// Replaces `Automatic` with `default`.
    pub fn resolve(self, default: StorageType) -> StorageType {
        match self {
            StorageType::Automatic => match default {
                StorageType::Automatic => StorageType::Memory,
                other => other,
            },
            other => other,
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Automatic => write!(f, "automatic"),
            StorageType::File => write!(f, "file"),
            StorageType::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for StorageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "automatic" | "auto" => Ok(StorageType::Automatic),
            "file" => Ok(StorageType::File),
            "memory" => Ok(StorageType::Memory),
            _ => Err(format!(
                "Invalid storage type: '{s}'. Valid options are: automatic, file, memory"
            )),
        }
    }
}

/// Errors raised by storage configuration.
///
/// Data that is not available yet is never an error; reads and writes report
/// it with a zero byte count.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage is not initialized")]
    NotInitialized,

    /// Pinning this many pieces would leave no slot to evict
    #[error("Cannot reserve {reserved} pieces with only {buffers} buffers")]
    ReservedExceedsCapacity { reserved: usize, buffers: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Disk storage owned by the engine, read through `EngineTorrent::read_piece`.
#[derive(Clone)]
pub struct FileStorage {
    engine: Arc<dyn EngineTorrent>,
}

impl FileStorage {
    pub fn new(engine: Arc<dyn EngineTorrent>) -> Self {
        Self { engine }
    }

    /// Reads piece bytes, logging engine failures and reporting them as zero bytes.
    pub fn read(&self, piece: PieceIndex, offset: u32, out: &mut [u8]) -> usize {
        match self.engine.read_piece(piece, offset, out) {
            Ok(read) => read,
            Err(e) => {
                tracing::warn!(
                    info_hash = %self.engine.info_hash(),
                    piece = %piece,
                    error = %e,
                    "Engine read failed"
                );
                0
            }
        }
    }
}

/// Storage selected for a torrent once its metadata is known.
#[derive(Clone)]
pub enum StorageBackend {
    Memory(Arc<MemoryStorage>),
    File(FileStorage),
}

impl StorageBackend {
    pub fn storage_type(&self) -> StorageType {
        match self {
            StorageBackend::Memory(_) => StorageType::Memory,
            StorageBackend::File(_) => StorageType::File,
        }
    }

    pub fn read(&self, piece: PieceIndex, offset: u32, out: &mut [u8]) -> usize {
        match self {
            StorageBackend::Memory(storage) => storage.read(piece, offset, out),
            StorageBackend::File(storage) => storage.read(piece, offset, out),
        }
    }

    /// The memory storage, `None` for file-backed torrents.
    pub fn memory(&self) -> Option<&Arc<MemoryStorage>> {
        match self {
            StorageBackend::Memory(storage) => Some(storage),
            StorageBackend::File(_) => None,
        }
    }
}
