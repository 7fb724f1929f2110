//! Asynchronous notifications from the engine.

use crate::engine::EngineStatus;
use crate::torrent::{InfoHash, PieceIndex};

/// Session-wide transfer counters carried by `Alert::SessionStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub download_rate: u64,
    pub upload_rate: u64,
    pub total_download: u64,
    pub total_upload: u64,
    pub num_torrents: usize,
}

/// Engine events drained by the session alert loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    StateUpdate {
        statuses: Vec<(InfoHash, EngineStatus)>,
    },
    MetadataReceived {
        info_hash: InfoHash,
    },
    PieceFinished {
        info_hash: InfoHash,
        piece: PieceIndex,
    },
    SaveResumeData {
        info_hash: InfoHash,
        data: Vec<u8>,
    },
    SaveResumeDataFailed {
        info_hash: InfoHash,
        reason: String,
    },
    TrackerAnnounce {
        info_hash: InfoHash,
        url: String,
    },
    TrackerReply {
        info_hash: InfoHash,
        url: String,
        num_peers: u32,
    },
    TrackerWarning {
        info_hash: InfoHash,
        url: String,
        message: String,
    },
    TrackerError {
        info_hash: InfoHash,
        url: String,
        message: String,
    },
    DhtReply {
        info_hash: InfoHash,
        num_peers: u32,
    },
    TorrentError {
        info_hash: InfoHash,
        message: String,
    },
    SessionStats(SessionCounters),
}

impl Alert {
    /// Torrent the alert belongs to, `None` for session-wide alerts.
    pub fn info_hash(&self) -> Option<InfoHash> {
        match self {
            Alert::MetadataReceived { info_hash }
            | Alert::PieceFinished { info_hash, .. }
            | Alert::SaveResumeData { info_hash, .. }
            | Alert::SaveResumeDataFailed { info_hash, .. }
            | Alert::TrackerAnnounce { info_hash, .. }
            | Alert::TrackerReply { info_hash, .. }
            | Alert::TrackerWarning { info_hash, .. }
            | Alert::TrackerError { info_hash, .. }
            | Alert::DhtReply { info_hash, .. }
            | Alert::TorrentError { info_hash, .. } => Some(*info_hash),
            Alert::StateUpdate { .. } | Alert::SessionStats(_) => None,
        }
    }
}
