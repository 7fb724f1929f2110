//! Files kept under the torrents directory.
//!
//! File-backed torrents persist `<hash>.torrent` once their metadata is known
//! and `<hash>.fastresume` whenever the engine produces resume data. Both are
//! picked up again on the next start.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::torrent::InfoHash;

pub fn torrent_file_path(torrents_path: &Path, info_hash: InfoHash) -> PathBuf {
    torrents_path.join(format!("{info_hash}.torrent"))
}

pub fn resume_file_path(torrents_path: &Path, info_hash: InfoHash) -> PathBuf {
    torrents_path.join(format!("{info_hash}.fastresume"))
}

/// Resume data saved for `info_hash`, if any.
pub fn load_resume_data(torrents_path: &Path, info_hash: InfoHash) -> Option<Vec<u8>> {
    let path = resume_file_path(torrents_path, info_hash);
    match std::fs::read(&path) {
        Ok(data) => {
            debug!(info_hash = %info_hash, path = %path.display(), "Using resume data");
            Some(data)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to load resume data");
            None
        }
    }
}

/// `.torrent` files in `torrents_path`, sorted by name.
///
/// A missing directory yields an empty list.
pub fn list_torrent_files(torrents_path: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(torrents_path) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %torrents_path.display(), error = %e, "Failed to list torrents directory");
            }
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "torrent"))
        .collect();
    paths.sort();
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_use_hex_hash() {
        let hash = InfoHash::new([0xab; 20]);
        let dir = Path::new("/data/torrents");
        assert_eq!(
            torrent_file_path(dir, hash),
            PathBuf::from(format!("/data/torrents/{}.torrent", "ab".repeat(20)))
        );
        assert!(resume_file_path(dir, hash).to_string_lossy().ends_with(".fastresume"));
    }

    #[test]
    fn test_lists_only_torrent_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.torrent"), b"x").unwrap();
        std::fs::write(dir.path().join("a.torrent"), b"x").unwrap();
        std::fs::write(dir.path().join("a.fastresume"), b"x").unwrap();

        let names: Vec<String> = list_torrent_files(dir.path())
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.torrent", "b.torrent"]);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_torrent_files(&dir.path().join("missing")).is_empty());
        assert_eq!(load_resume_data(dir.path(), InfoHash::new([1; 20])), None);
    }
}
