//! Torrent state derived from engine status.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::engine::{EngineState, EngineStatus};

/// User-facing torrent state, serialized as its integer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum TorrentState {
    #[default]
    Unknown = -1,
    Queued = 0,
    ForcedDownloading = 1,
    Downloading = 2,
    DownloadingMetadata = 3,
    StalledDownloading = 4,
    ForcedUploading = 5,
    Uploading = 6,
    StalledUploading = 7,
    CheckingResumeData = 8,
    QueuedDownloading = 9,
    QueuedUploading = 10,
    CheckingUploading = 11,
    CheckingDownloading = 12,
    PausedDownloading = 13,
    PausedUploading = 14,
    Moving = 15,
    MissingFiles = 16,
    Error = 17,
}

impl TorrentState {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TorrentState::Unknown => "Unknown",
            TorrentState::Queued => "Queued",
            TorrentState::ForcedDownloading => "Forced downloading",
            TorrentState::Downloading => "Downloading",
            TorrentState::DownloadingMetadata => "Downloading metadata",
            TorrentState::StalledDownloading => "Stalled downloading",
            TorrentState::ForcedUploading => "Forced uploading",
            TorrentState::Uploading => "Uploading",
            TorrentState::StalledUploading => "Stalled uploading",
            TorrentState::CheckingResumeData => "Checking resume data",
            TorrentState::QueuedDownloading => "Queued downloading",
            TorrentState::QueuedUploading => "Queued uploading",
            TorrentState::CheckingUploading => "Checking uploading",
            TorrentState::CheckingDownloading => "Checking downloading",
            TorrentState::PausedDownloading => "Paused downloading",
            TorrentState::PausedUploading => "Paused uploading",
            TorrentState::Moving => "Moving",
            TorrentState::MissingFiles => "Missing files",
            TorrentState::Error => "Error",
        }
    }

    pub fn is_downloading(self) -> bool {
        matches!(
            self,
            TorrentState::Downloading
                | TorrentState::DownloadingMetadata
                | TorrentState::StalledDownloading
                | TorrentState::CheckingDownloading
                | TorrentState::PausedDownloading
                | TorrentState::QueuedDownloading
                | TorrentState::ForcedDownloading
        )
    }

    pub fn is_completed(self) -> bool {
        matches!(
            self,
            TorrentState::Uploading
                | TorrentState::StalledUploading
                | TorrentState::CheckingUploading
                | TorrentState::PausedUploading
                | TorrentState::QueuedUploading
                | TorrentState::ForcedUploading
        )
    }

    pub fn is_errored(self) -> bool {
        matches!(self, TorrentState::MissingFiles | TorrentState::Error)
    }
}

impl fmt::Display for TorrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TorrentState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

/// Derives the state from engine `status`, checking conditions in a fixed order.
///
/// `stopped` is the user pause flag of the torrent; `has_seed_status` tells
/// whether the torrent was ever seen seeding, which decides the flavour of a
/// re-check. Checking resume data preempts errors, errors preempt missing
/// metadata, which preempts checking, nothing wanted, seeding and finally
/// downloading.
pub fn derive_state(status: &EngineStatus, stopped: bool, has_seed_status: bool) -> TorrentState {
    let is_queued = !stopped && status.is_auto_managed && status.is_paused;
    let is_forced = !stopped && !status.is_auto_managed;
    let is_seed = matches!(status.state, EngineState::Finished | EngineState::Seeding);

    if status.state == EngineState::CheckingResumeData {
        TorrentState::CheckingResumeData
    } else if status.error.is_some() {
        TorrentState::Error
    } else if !status.has_metadata {
        if stopped {
            TorrentState::PausedDownloading
        } else if is_queued {
            TorrentState::QueuedDownloading
        } else {
            TorrentState::DownloadingMetadata
        }
    } else if status.state == EngineState::CheckingFiles
        && (!stopped || status.is_auto_managed || !status.is_paused)
    {
        if has_seed_status {
            TorrentState::CheckingUploading
        } else {
            TorrentState::CheckingDownloading
        }
    } else if status.total_wanted == 0 {
        TorrentState::Queued
    } else if is_seed {
        if stopped {
            TorrentState::PausedUploading
        } else if is_forced {
            TorrentState::ForcedUploading
        } else if status.upload_rate > 0 {
            TorrentState::Uploading
        } else {
            TorrentState::StalledUploading
        }
    } else if stopped {
        TorrentState::PausedDownloading
    } else if is_forced {
        TorrentState::ForcedDownloading
    } else if status.download_rate > 0 {
        TorrentState::Downloading
    } else {
        TorrentState::StalledDownloading
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downloading() -> EngineStatus {
        EngineStatus {
            state: EngineState::Downloading,
            has_metadata: true,
            is_auto_managed: true,
            total_wanted: 1000,
            ..EngineStatus::default()
        }
    }

    #[test]
    fn test_checking_resume_data_preempts_errors() {
        let status = EngineStatus {
            state: EngineState::CheckingResumeData,
            error: Some("disk full".to_string()),
            ..downloading()
        };
        assert_eq!(derive_state(&status, false, false), TorrentState::CheckingResumeData);
    }

    #[test]
    fn test_error_preempts_everything_else() {
        let status = EngineStatus {
            error: Some("disk full".to_string()),
            has_metadata: false,
            ..downloading()
        };
        assert_eq!(derive_state(&status, true, false), TorrentState::Error);
    }

    #[test]
    fn test_metadata_states() {
        let status = EngineStatus {
            has_metadata: false,
            ..downloading()
        };
        assert_eq!(derive_state(&status, false, false), TorrentState::DownloadingMetadata);
        assert_eq!(derive_state(&status, true, false), TorrentState::PausedDownloading);

        let queued = EngineStatus {
            is_paused: true,
            ..status
        };
        assert_eq!(derive_state(&queued, false, false), TorrentState::QueuedDownloading);
    }

    #[test]
    fn test_checking_flavour_follows_seed_status() {
        let status = EngineStatus {
            state: EngineState::CheckingFiles,
            ..downloading()
        };
        assert_eq!(derive_state(&status, false, false), TorrentState::CheckingDownloading);
        assert_eq!(derive_state(&status, false, true), TorrentState::CheckingUploading);
    }

    #[test]
    fn test_nothing_wanted_is_queued() {
        let status = EngineStatus {
            total_wanted: 0,
            ..downloading()
        };
        assert_eq!(derive_state(&status, false, false), TorrentState::Queued);
    }

    #[test]
    fn test_downloading_states() {
        let mut status = downloading();
        assert_eq!(derive_state(&status, false, false), TorrentState::StalledDownloading);
        assert_eq!(derive_state(&status, true, false), TorrentState::PausedDownloading);

        status.download_rate = 1024;
        assert_eq!(derive_state(&status, false, false), TorrentState::Downloading);

        status.is_auto_managed = false;
        assert_eq!(derive_state(&status, false, false), TorrentState::ForcedDownloading);
    }

    #[test]
    fn test_seeding_states() {
        let mut status = EngineStatus {
            state: EngineState::Seeding,
            ..downloading()
        };
        assert_eq!(derive_state(&status, false, false), TorrentState::StalledUploading);

        status.upload_rate = 10;
        assert_eq!(derive_state(&status, false, false), TorrentState::Uploading);
        assert_eq!(derive_state(&status, true, false), TorrentState::PausedUploading);
    }

    #[test]
    fn test_state_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&TorrentState::Unknown).unwrap(), "-1");
        assert_eq!(serde_json::to_string(&TorrentState::Error).unwrap(), "17");
        assert_eq!(TorrentState::StalledUploading.as_str(), "Stalled uploading");
    }
}
