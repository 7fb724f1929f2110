//! Bencoded `.torrent` metainfo: parsing, info hash calculation and creation.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::engine::EngineError;
use crate::torrent::{InfoHash, TorrentInfo};

/// Default piece length for created torrents (256 KiB).
pub const DEFAULT_PIECE_LENGTH: u32 = 262_144;

#[derive(Debug, Serialize, Deserialize)]
struct MetainfoFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    announce: Option<String>,
    #[serde(rename = "announce-list", default, skip_serializing_if = "Option::is_none")]
    announce_list: Option<Vec<Vec<String>>>,
    #[serde(rename = "created by", default, skip_serializing_if = "Option::is_none")]
    created_by: Option<String>,
    info: InfoDict,
}

#[derive(Debug, Serialize, Deserialize)]
struct InfoDict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    files: Option<Vec<FileDict>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u64,
    pieces: ByteBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileDict {
    length: u64,
    path: Vec<String>,
}

/// Parsed metainfo of a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub info_hash: InfoHash,
    pub info: TorrentInfo,
    pub piece_hashes: Vec<[u8; 20]>,
    pub trackers: Vec<String>,
}

impl Metainfo {
    /// Parses bencoded `.torrent` content.
    ///
    /// # Errors
    ///
    /// - `EngineError::Metainfo` - Malformed bencode or missing required fields
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        let file: MetainfoFile = serde_bencode::from_bytes(bytes)
            .map_err(|e| invalid(format!("Bencode parsing failed: {e}")))?;
        let info_hash = info_hash_of(bytes)?;
        let info = file.info;

        if info.piece_length == 0 || info.piece_length > u32::MAX as u64 {
            return Err(invalid(format!("Invalid piece length {}", info.piece_length)));
        }
        if info.pieces.len() % 20 != 0 {
            return Err(invalid("Invalid pieces length".to_string()));
        }
        let piece_hashes: Vec<[u8; 20]> = info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let files = match (info.length, info.files) {
            (Some(length), _) => vec![(info.name.clone(), length)],
            (None, Some(files)) if !files.is_empty() => files
                .into_iter()
                .map(|file| {
                    let mut path = vec![info.name.clone()];
                    path.extend(file.path);
                    (path.join("/"), file.length)
                })
                .collect(),
            _ => return Err(invalid("Missing 'files' or 'length' field".to_string())),
        };

        let torrent_info = TorrentInfo::new(info.name, info.piece_length as u32, files);
        if torrent_info.piece_count() as usize != piece_hashes.len() {
            return Err(invalid(format!(
                "Expected {} piece hashes, found {}",
                torrent_info.piece_count(),
                piece_hashes.len()
            )));
        }

        let mut trackers: Vec<String> = file.announce.into_iter().collect();
        for url in file.announce_list.into_iter().flatten().flatten() {
            if !trackers.contains(&url) {
                trackers.push(url);
            }
        }

        Ok(Self {
            info_hash,
            info: torrent_info,
            piece_hashes,
            trackers,
        })
    }

    /// Magnet URI pointing at this torrent.
    pub fn magnet_uri(&self) -> String {
        let mut uri = format!(
            "magnet:?xt=urn:btih:{}&dn={}",
            self.info_hash,
            urlencoding::encode(&self.info.name)
        );
        for tracker in &self.trackers {
            uri.push_str("&tr=");
            uri.push_str(&urlencoding::encode(tracker));
        }
        uri
    }
}

fn invalid(reason: String) -> EngineError {
    EngineError::Metainfo { reason }
}

/// SHA-1 of the raw `info` dictionary as it appears in `bytes`.
///
/// # Errors
///
/// - `EngineError::Metainfo` - The top-level dictionary has no `info` entry
pub fn info_hash_of(bytes: &[u8]) -> Result<InfoHash, EngineError> {
    if bytes.first() != Some(&b'd') {
        return Err(invalid("Root element must be dictionary".to_string()));
    }

    let mut pos = 1;
    while pos < bytes.len() && bytes[pos] != b'e' {
        let key_end = value_end(bytes, pos)?;
        let key = string_contents(bytes, pos, key_end);
        let value_start = key_end;
        let value_stop = value_end(bytes, value_start)?;

        if key == b"info" {
            let digest = Sha1::digest(&bytes[value_start..value_stop]);
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&digest);
            return Ok(InfoHash::new(hash));
        }
        pos = value_stop;
    }

    Err(invalid("Missing 'info' field".to_string()))
}

fn string_contents(bytes: &[u8], start: usize, end: usize) -> &[u8] {
    bytes[start..end]
        .iter()
        .position(|&b| b == b':')
        .map(|colon| &bytes[start + colon + 1..end])
        .unwrap_or(&[])
}

/// End offset of the bencoded value starting at `pos`.
fn value_end(data: &[u8], pos: usize) -> Result<usize, EngineError> {
    match data.get(pos) {
        Some(b'i') => data[pos..]
            .iter()
            .position(|&b| b == b'e')
            .map(|end| pos + end + 1)
            .ok_or_else(|| invalid("Unterminated integer".to_string())),
        Some(b'l') | Some(b'd') => {
            let mut cursor = pos + 1;
            while data.get(cursor) != Some(&b'e') {
                if cursor >= data.len() {
                    return Err(invalid("Incomplete bencode container".to_string()));
                }
                cursor = value_end(data, cursor)?;
            }
            Ok(cursor + 1)
        }
        Some(b'0'..=b'9') => {
            let colon = data[pos..]
                .iter()
                .position(|&b| b == b':')
                .map(|colon| pos + colon)
                .ok_or_else(|| invalid("Invalid string format".to_string()))?;
            let length: usize = std::str::from_utf8(&data[pos..colon])
                .ok()
                .and_then(|length| length.parse().ok())
                .ok_or_else(|| invalid("Invalid string length".to_string()))?;
            let end = colon + 1 + length;
            if end > data.len() {
                return Err(invalid("String runs past end of data".to_string()));
            }
            Ok(end)
        }
        _ => Err(invalid("Invalid bencode character".to_string())),
    }
}

/// Builds `.torrent` files from local content.
#[derive(Debug, Clone)]
pub struct TorrentCreator {
    piece_length: u32,
    trackers: Vec<String>,
}

impl Default for TorrentCreator {
    fn default() -> Self {
        Self::new()
    }
}

impl TorrentCreator {
    pub fn new() -> Self {
        Self {
            piece_length: DEFAULT_PIECE_LENGTH,
            trackers: Vec::new(),
        }
    }

    pub fn with_piece_length(mut self, piece_length: u32) -> Self {
        self.piece_length = piece_length.max(1);
        self
    }

    pub fn with_trackers(mut self, trackers: Vec<String>) -> Self {
        self.trackers = trackers;
        self
    }

    /// Creates a single-file torrent from in-memory content.
    ///
    /// # Errors
    ///
    /// - `EngineError::Metainfo` - Empty content
    pub fn create_from_bytes(&self, name: &str, content: &[u8]) -> Result<Vec<u8>, EngineError> {
        if content.is_empty() {
            return Err(invalid("Cannot create torrent from empty content".to_string()));
        }
        let mut hasher = PieceHasher::new(self.piece_length);
        hasher.update(content);
        self.encode(name, Some(content.len() as u64), None, hasher.finish())
    }

    /// Creates a multi-file torrent from in-memory `(path components, content)` pairs.
    ///
    /// # Errors
    ///
    /// - `EngineError::Metainfo` - No files given
    pub fn create_from_files(
        &self,
        name: &str,
        files: Vec<(Vec<String>, Vec<u8>)>,
    ) -> Result<Vec<u8>, EngineError> {
        if files.is_empty() {
            return Err(invalid("Cannot create torrent without files".to_string()));
        }
        let mut hasher = PieceHasher::new(self.piece_length);
        let files = files
            .into_iter()
            .map(|(path, content)| {
                hasher.update(&content);
                FileDict {
                    length: content.len() as u64,
                    path,
                }
            })
            .collect();
        self.encode(name, None, Some(files), hasher.finish())
    }

    /// Creates a single-file torrent from a file on disk.
    ///
    /// # Errors
    ///
    /// - `EngineError::Io` - The file cannot be read
    /// - `EngineError::Metainfo` - Empty file or unusable file name
    pub fn create_from_file(&self, path: &Path) -> Result<Vec<u8>, EngineError> {
        let name = file_name(path)?;
        let length = fs::metadata(path)?.len();
        if length == 0 {
            return Err(invalid("Cannot create torrent from empty file".to_string()));
        }

        let mut hasher = PieceHasher::new(self.piece_length);
        hasher.update_from(fs::File::open(path)?)?;
        self.encode(&name, Some(length), None, hasher.finish())
    }

    /// Creates a multi-file torrent from every file below `directory`.
    ///
    /// Files are ordered by relative path.
    ///
    /// # Errors
    ///
    /// - `EngineError::Io` - The directory or a file cannot be read
    /// - `EngineError::Metainfo` - The directory holds no files
    pub fn create_from_directory(&self, directory: &Path) -> Result<Vec<u8>, EngineError> {
        let name = file_name(directory)?;
        let mut paths = Vec::new();
        collect_files(directory, &mut paths)?;
        paths.sort();
        if paths.is_empty() {
            return Err(invalid("Directory contains no files".to_string()));
        }

        let mut hasher = PieceHasher::new(self.piece_length);
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let relative = path
                .strip_prefix(directory)
                .map_err(|_| invalid(format!("Path escapes directory: {}", path.display())))?;
            let components = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .collect();
            files.push(FileDict {
                length: fs::metadata(&path)?.len(),
                path: components,
            });
            hasher.update_from(fs::File::open(&path)?)?;
        }

        self.encode(&name, None, Some(files), hasher.finish())
    }

    fn encode(
        &self,
        name: &str,
        length: Option<u64>,
        files: Option<Vec<FileDict>>,
        pieces: Vec<u8>,
    ) -> Result<Vec<u8>, EngineError> {
        let file = MetainfoFile {
            announce: self.trackers.first().cloned(),
            announce_list: (self.trackers.len() > 1)
                .then(|| self.trackers.iter().map(|url| vec![url.clone()]).collect()),
            created_by: Some(format!("torrest/{}", env!("CARGO_PKG_VERSION"))),
            info: InfoDict {
                files,
                length,
                name: name.to_string(),
                piece_length: self.piece_length as u64,
                pieces: ByteBuf::from(pieces),
            },
        };
        serde_bencode::to_bytes(&file).map_err(|e| invalid(format!("Bencode encoding failed: {e}")))
    }
}

fn file_name(path: &Path) -> Result<String, EngineError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| invalid(format!("Invalid file name: {}", path.display())))
}

fn collect_files(directory: &Path, out: &mut Vec<PathBuf>) -> Result<(), EngineError> {
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Hashes a byte stream into concatenated SHA-1 piece digests.
struct PieceHasher {
    piece_length: usize,
    current: Sha1,
    filled: usize,
    pieces: Vec<u8>,
}

impl PieceHasher {
    fn new(piece_length: u32) -> Self {
        Self {
            piece_length: piece_length as usize,
            current: Sha1::new(),
            filled: 0,
            pieces: Vec::new(),
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (self.piece_length - self.filled).min(data.len());
            self.current.update(&data[..take]);
            self.filled += take;
            data = &data[take..];
            if self.filled == self.piece_length {
                let digest = std::mem::replace(&mut self.current, Sha1::new()).finalize();
                self.pieces.extend_from_slice(&digest);
                self.filled = 0;
            }
        }
    }

    fn update_from(&mut self, mut reader: impl Read) -> Result<(), EngineError> {
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let read = reader.read(&mut chunk)?;
            if read == 0 {
                return Ok(());
            }
            self.update(&chunk[..read]);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.pieces.extend_from_slice(&self.current.finalize());
        }
        self.pieces
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_torrent_parses_back() {
        let content: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let bytes = TorrentCreator::new()
            .with_piece_length(16384)
            .with_trackers(vec!["udp://tracker.example:6969".to_string()])
            .create_from_bytes("movie.mp4", &content)
            .unwrap();

        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(metainfo.info.name, "movie.mp4");
        assert_eq!(metainfo.info.total_size, 100_000);
        assert_eq!(metainfo.info.piece_count(), 7);
        assert_eq!(metainfo.piece_hashes.len(), 7);
        assert_eq!(metainfo.trackers, vec!["udp://tracker.example:6969".to_string()]);

        let first: [u8; 20] = Sha1::digest(&content[..16384]).into();
        assert_eq!(metainfo.piece_hashes[0], first);
    }

    #[test]
    fn test_info_hash_covers_raw_info_dictionary() {
        let bytes = b"d8:announce3:url4:infod6:lengthi5e4:name1:a12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        let info_start = bytes.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let expected: [u8; 20] = Sha1::digest(&bytes[info_start..bytes.len() - 1]).into();

        assert_eq!(info_hash_of(bytes).unwrap(), InfoHash::new(expected));
    }

    #[test]
    fn test_multi_file_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("show");
        std::fs::create_dir_all(root.join("extras")).unwrap();
        std::fs::write(root.join("episode1.mkv"), vec![1u8; 20_000]).unwrap();
        std::fs::write(root.join("extras/notes.txt"), b"hello").unwrap();

        let bytes = TorrentCreator::new()
            .with_piece_length(16384)
            .create_from_directory(&root)
            .unwrap();
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();

        let paths: Vec<&str> = metainfo.info.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["show/episode1.mkv", "show/extras/notes.txt"]);
        assert_eq!(metainfo.info.files[1].offset, 20_000);
        assert_eq!(metainfo.piece_hashes.len(), 2);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            Metainfo::from_bytes(b"not bencode"),
            Err(EngineError::Metainfo { .. })
        ));
        assert!(info_hash_of(b"d4:name1:ae").is_err());
    }

    #[test]
    fn test_magnet_uri_round_trips_hash() {
        let bytes = TorrentCreator::new()
            .create_from_bytes("My Movie.mp4", &[7u8; 1000])
            .unwrap();
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        let uri = metainfo.magnet_uri();

        assert!(uri.contains("dn=My%20Movie.mp4"));
        assert_eq!(crate::engine::magnet_info_hash(&uri).unwrap(), metainfo.info_hash);
    }
}
