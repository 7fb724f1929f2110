//! Content the simulated swarm can deliver.
//!
//! Every seeded item is described by real bencoded metainfo, so torrents
//! added from its `.torrent` bytes or its magnet link resolve to the same
//! info hash a real client would compute.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use torrest_core::torrent::{InfoHash, Metainfo, TorrentCreator};
use tracing::info;

/// Errors raised while seeding content.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("Content path {path} does not exist")]
    NotFound { path: PathBuf },

    #[error("Failed to build metainfo: {0}")]
    Metainfo(#[from] torrest_core::EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the bytes of a seeded item live.
#[derive(Debug, Clone)]
enum ContentSource {
    Memory(Arc<Vec<u8>>),
    /// Disk files in torrent order with their sizes
    Files(Vec<(PathBuf, u64)>),
}

/// One seeded torrent.
#[derive(Debug, Clone)]
pub struct SeededContent {
    pub metainfo: Metainfo,
    /// Bencoded `.torrent` content
    pub torrent_bytes: Vec<u8>,
    source: ContentSource,
}

impl SeededContent {
    pub fn info_hash(&self) -> InfoHash {
        self.metainfo.info_hash
    }

    pub fn magnet_uri(&self) -> String {
        self.metainfo.magnet_uri()
    }

    /// Reads `len` bytes starting at `offset` of the concatenated content.
    ///
    /// # Errors
    ///
    /// - `io::Error` - A backing file is missing or shorter than advertised
    pub fn read_range(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let end = (offset + len as u64).min(self.metainfo.info.total_size);
        if offset >= end {
            return Ok(Vec::new());
        }

        match &self.source {
            ContentSource::Memory(data) => Ok(data[offset as usize..end as usize].to_vec()),
            ContentSource::Files(files) => {
                let mut out = Vec::with_capacity((end - offset) as usize);
                let mut file_start = 0u64;
                for (path, size) in files {
                    let file_end = file_start + size;
                    if file_end > offset && file_start < end {
                        let from = offset.max(file_start);
                        let to = end.min(file_end);
                        let mut file = fs::File::open(path)?;
                        file.seek(SeekFrom::Start(from - file_start))?;
                        let mut chunk = vec![0u8; (to - from) as usize];
                        file.read_exact(&mut chunk)?;
                        out.extend_from_slice(&chunk);
                    }
                    file_start = file_end;
                }
                Ok(out)
            }
        }
    }
}

/// Registry of seeded content keyed by info hash.
#[derive(Debug, Default)]
pub struct Swarm {
    content: RwLock<HashMap<InfoHash, Arc<SeededContent>>>,
    piece_length: Option<u32>,
}

impl Swarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swarm creating metainfo with a fixed piece length.
    pub fn with_piece_length(piece_length: u32) -> Self {
        Self {
            content: RwLock::new(HashMap::new()),
            piece_length: Some(piece_length),
        }
    }

    fn creator(&self) -> TorrentCreator {
        let creator = TorrentCreator::new();
        match self.piece_length {
            Some(piece_length) => creator.with_piece_length(piece_length),
            None => creator,
        }
    }

    /// Seeds in-memory content as a single-file torrent.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Metainfo` - Empty content
    pub fn seed_bytes(&self, name: &str, data: Vec<u8>) -> Result<Arc<SeededContent>, SwarmError> {
        let torrent_bytes = self.creator().create_from_bytes(name, &data)?;
        self.insert(torrent_bytes, ContentSource::Memory(Arc::new(data)))
    }

    /// Seeds a single file from disk.
    ///
    /// # Errors
    ///
    /// - `SwarmError::NotFound` - `path` is not a file
    /// - `SwarmError::Metainfo` - The file is empty or unreadable
    pub fn seed_file(&self, path: &Path) -> Result<Arc<SeededContent>, SwarmError> {
        if !path.is_file() {
            return Err(SwarmError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let torrent_bytes = self.creator().create_from_file(path)?;
        let size = fs::metadata(path)?.len();
        self.insert(torrent_bytes, ContentSource::Files(vec![(path.to_path_buf(), size)]))
    }

    /// Seeds every file below `directory` as one multi-file torrent.
    ///
    /// # Errors
    ///
    /// - `SwarmError::NotFound` - `directory` is not a directory
    /// - `SwarmError::Metainfo` - The directory is empty or unreadable
    pub fn seed_directory(&self, directory: &Path) -> Result<Arc<SeededContent>, SwarmError> {
        if !directory.is_dir() {
            return Err(SwarmError::NotFound {
                path: directory.to_path_buf(),
            });
        }
        let torrent_bytes = self.creator().create_from_directory(directory)?;
        let metainfo = Metainfo::from_bytes(&torrent_bytes)?;

        let prefix = format!("{}/", metainfo.info.name);
        let files = metainfo
            .info
            .files
            .iter()
            .map(|entry| {
                let relative = entry.path.strip_prefix(&prefix).unwrap_or(&entry.path);
                (directory.join(relative), entry.size)
            })
            .collect();
        self.insert(torrent_bytes, ContentSource::Files(files))
    }

    /// Seeds each entry of `directory`: files as single-file torrents and
    /// subdirectories as multi-file torrents.
    ///
    /// Entries that cannot be seeded are skipped.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Io` - `directory` cannot be listed
    pub fn seed_entries(&self, directory: &Path) -> Result<Vec<Arc<SeededContent>>, SwarmError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(directory)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .collect();
        paths.sort();

        let mut seeded = Vec::new();
        for path in paths {
            let result = if path.is_dir() {
                self.seed_directory(&path)
            } else {
                self.seed_file(&path)
            };
            match result {
                Ok(content) => seeded.push(content),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping content"),
            }
        }
        Ok(seeded)
    }

    fn insert(
        &self,
        torrent_bytes: Vec<u8>,
        source: ContentSource,
    ) -> Result<Arc<SeededContent>, SwarmError> {
        let metainfo = Metainfo::from_bytes(&torrent_bytes)?;
        let content = Arc::new(SeededContent {
            metainfo,
            torrent_bytes,
            source,
        });
        info!(
            info_hash = %content.info_hash(),
            name = %content.metainfo.info.name,
            size = content.metainfo.info.total_size,
            "Seeded content"
        );
        self.content
            .write()
            .insert(content.info_hash(), Arc::clone(&content));
        Ok(content)
    }

    pub fn lookup(&self, info_hash: InfoHash) -> Option<Arc<SeededContent>> {
        self.content.read().get(&info_hash).cloned()
    }

    /// Seeded items sorted by name.
    pub fn contents(&self) -> Vec<Arc<SeededContent>> {
        let mut contents: Vec<_> = self.content.read().values().cloned().collect();
        contents.sort_by(|a, b| a.metainfo.info.name.cmp(&b.metainfo.info.name));
        contents
    }

    pub fn len(&self) -> usize {
        self.content.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.read().is_empty()
    }
}
