//! Resume data produced and consumed by the development engine.

use serde::{Deserialize, Serialize};
use torrest_core::torrent::InfoHash;

/// Downloaded pieces and file selection of one torrent, stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    /// Hex info hash
    pub info_hash: String,
    pub pieces: Vec<u32>,
    pub file_priorities: Vec<u8>,
}

impl ResumeData {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Parses `bytes`, ignoring data recorded for a different torrent.
    pub fn decode(bytes: &[u8], info_hash: InfoHash) -> Option<Self> {
        let data: Self = match serde_json::from_slice(bytes) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(info_hash = %info_hash, error = %e, "Ignoring malformed resume data");
                return None;
            }
        };
        if data.info_hash != info_hash.to_string() {
            tracing::warn!(info_hash = %info_hash, recorded = %data.info_hash, "Ignoring resume data of another torrent");
            return None;
        }
        Some(data)
    }
}
