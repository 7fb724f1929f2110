//! Per-torrent state of the development engine.
//!
//! A `SimTorrent` keeps the piece bitmap, priorities and deadlines the
//! streaming layer steers, and turns the byte budget it is handed each tick
//! into completed pieces. Piece data comes from the seeded content and goes
//! into the attached memory storage or into files under the save path.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use sha1::{Digest, Sha1};
use torrest_core::engine::{
    Alert, EngineError, EngineState, EngineStatus, EngineTorrent, PartialPiece, priority,
};
use torrest_core::storage::{PieceStorage, StorageType};
use torrest_core::torrent::{InfoHash, Metainfo, PieceIndex, TorrentInfo};
use tracing::{debug, info, warn};

use crate::config::SimConfig;
use crate::resume::ResumeData;
use crate::swarm::SeededContent;

pub(crate) type AlertQueue = Arc<Mutex<Vec<Alert>>>;

/// Metadata of a torrent once it is known.
#[derive(Debug, Clone)]
struct KnownMetadata {
    info: Arc<TorrentInfo>,
    piece_hashes: Arc<Vec<[u8; 20]>>,
    torrent_bytes: Arc<Vec<u8>>,
}

impl KnownMetadata {
    fn new(metainfo: Metainfo, torrent_bytes: Vec<u8>) -> Self {
        Self {
            info: Arc::new(metainfo.info),
            piece_hashes: Arc::new(metainfo.piece_hashes),
            torrent_bytes: Arc::new(torrent_bytes),
        }
    }
}

#[derive(Debug, Default)]
struct PieceTable {
    have: Vec<bool>,
    priorities: Vec<u8>,
    /// When each deadline piece is due
    deadlines: HashMap<PieceIndex, Instant>,
    file_priorities: Vec<u8>,
    /// Bytes received for pieces in flight
    partial: BTreeMap<PieceIndex, u64>,
    checking: bool,
}

impl PieceTable {
    fn for_info(info: &TorrentInfo, file_priorities: Vec<u8>) -> Self {
        let pieces = info.piece_count() as usize;
        let mut table = Self {
            have: vec![false; pieces],
            priorities: vec![priority::DONT_DOWNLOAD; pieces],
            file_priorities,
            ..Self::default()
        };
        for file in 0..info.files.len() {
            table.apply_file_priority(info, file);
        }
        table
    }

    /// Sets the pieces of `file` to the highest priority among the files sharing them.
    fn apply_file_priority(&mut self, info: &TorrentInfo, file: usize) {
        let Some(entry) = info.files.get(file) else {
            return;
        };
        if entry.size == 0 {
            return;
        }
        let piece_length = info.piece_length as u64;
        let first = entry.offset / piece_length;
        let last = (entry.offset + entry.size - 1) / piece_length;

        for piece in first..=last {
            let start = piece * piece_length;
            let end = start + piece_length;
            let value = info
                .files
                .iter()
                .zip(&self.file_priorities)
                .filter(|(other, _)| other.size > 0 && other.offset < end && other.offset + other.size > start)
                .map(|(_, &value)| value)
                .max()
                .unwrap_or(priority::DONT_DOWNLOAD);
            if let Some(slot) = self.priorities.get_mut(piece as usize) {
                *slot = value;
            }
        }
    }

    fn is_wanted(&self, index: usize) -> bool {
        self.priorities.get(index).is_some_and(|&value| value > 0)
            && !self.have.get(index).copied().unwrap_or(true)
    }
}

/// Construction parameters of a `SimTorrent`.
pub(crate) struct SimTorrentParams {
    pub info_hash: InfoHash,
    pub content: Option<Arc<SeededContent>>,
    /// Parsed metainfo when the torrent was added from `.torrent` content
    pub metainfo: Option<(Metainfo, Vec<u8>)>,
    pub storage: StorageType,
    pub save_path: PathBuf,
    pub paused: bool,
    pub sequential: bool,
    pub resume_data: Option<Vec<u8>>,
    pub metadata_delay: Duration,
}

/// One torrent inside the simulated swarm.
pub struct SimTorrent {
    info_hash: InfoHash,
    content: Option<Arc<SeededContent>>,
    storage_type: StorageType,
    save_path: PathBuf,
    metadata: RwLock<Option<KnownMetadata>>,
    metadata_due: Mutex<Option<Instant>>,
    pieces: Mutex<PieceTable>,
    storage: Mutex<Option<Arc<dyn PieceStorage>>>,
    resume: Mutex<Option<ResumeData>>,
    alerts: AlertQueue,
    paused: AtomicBool,
    sequential: AtomicBool,
    added_at: Instant,
    transfer: Mutex<Transfer>,
}

#[derive(Debug, Default)]
struct Transfer {
    total_download: u64,
    last_tick_bytes: u64,
    last_tick: Option<Instant>,
    download_rate: u64,
    finished_at: Option<Instant>,
}

impl SimTorrent {
    pub(crate) fn new(params: SimTorrentParams, alerts: AlertQueue) -> Self {
        let resume = params
            .resume_data
            .as_deref()
            .and_then(|bytes| ResumeData::decode(bytes, params.info_hash));

        let torrent = Self {
            info_hash: params.info_hash,
            content: params.content,
            storage_type: params.storage,
            save_path: params.save_path,
            metadata: RwLock::new(None),
            metadata_due: Mutex::new(None),
            pieces: Mutex::new(PieceTable::default()),
            storage: Mutex::new(None),
            resume: Mutex::new(resume),
            alerts,
            paused: AtomicBool::new(params.paused),
            sequential: AtomicBool::new(params.sequential),
            added_at: Instant::now(),
            transfer: Mutex::new(Transfer::default()),
        };

        match (params.metainfo, &torrent.content) {
            (Some((metainfo, bytes)), _) => torrent.install_metadata(KnownMetadata::new(metainfo, bytes)),
            (None, Some(_)) => {
                *torrent.metadata_due.lock() = Some(Instant::now() + params.metadata_delay);
            }
            (None, None) => {
                debug!(info_hash = %torrent.info_hash, "No seeds for magnet, metadata will not arrive");
            }
        }
        torrent
    }

    fn push_alert(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }

    fn torrent_info_ref(&self) -> Option<Arc<TorrentInfo>> {
        self.metadata.read().as_ref().map(|known| Arc::clone(&known.info))
    }

    /// Installs metadata and restores pieces recorded in resume data.
    ///
    /// Without resume data every file starts deselected.
    fn install_metadata(&self, known: KnownMetadata) {
        let info = Arc::clone(&known.info);
        let resume = self.resume.lock().take();
        let file_priorities = match &resume {
            Some(data) if data.file_priorities.len() == info.files.len() => data.file_priorities.clone(),
            _ => vec![priority::DONT_DOWNLOAD; info.files.len()],
        };

        *self.pieces.lock() = PieceTable::for_info(&info, file_priorities);
        *self.metadata.write() = Some(known.clone());

        if let Some(data) = resume {
            if self.storage_type == StorageType::File {
                self.check_resume_pieces(&known, &data.pieces);
            }
        }
        info!(
            info_hash = %self.info_hash,
            name = %info.name,
            pieces = info.piece_count(),
            "Metadata available"
        );
    }

    /// Marks resumed pieces as had when the data on disk matches their hash.
    fn check_resume_pieces(&self, known: &KnownMetadata, pieces: &[u32]) {
        self.pieces.lock().checking = true;
        let mut verified = Vec::new();

        for &index in pieces {
            let piece = PieceIndex(index);
            let len = known.info.piece_size(piece) as usize;
            let Some(expected) = known.piece_hashes.get(index as usize) else {
                continue;
            };
            let mut data = vec![0u8; len];
            if read_disk(&self.save_path, &known.info, known.info.piece_offset(piece), &mut data).is_err() {
                continue;
            }
            let actual: [u8; 20] = Sha1::digest(&data).into();
            if &actual == expected {
                verified.push(index as usize);
            } else {
                warn!(
                    info_hash = %self.info_hash,
                    piece = index,
                    expected = %hex::encode(expected),
                    actual = %hex::encode(actual),
                    "Resume piece failed hash check"
                );
            }
        }

        let mut table = self.pieces.lock();
        for index in &verified {
            if let Some(had) = table.have.get_mut(*index) {
                *had = true;
            }
        }
        table.checking = false;
        debug!(info_hash = %self.info_hash, pieces = verified.len(), "Resume data checked");
    }

    fn maybe_receive_metadata(&self) {
        let due = *self.metadata_due.lock();
        let Some(due) = due else {
            return;
        };
        if Instant::now() < due {
            return;
        }
        let Some(content) = &self.content else {
            return;
        };

        *self.metadata_due.lock() = None;
        self.install_metadata(KnownMetadata::new(
            content.metainfo.clone(),
            content.torrent_bytes.clone(),
        ));
        self.push_alert(Alert::MetadataReceived {
            info_hash: self.info_hash,
        });
    }

    /// Pieces to work on this tick with their received byte counts.
    fn plan(&self, info: &TorrentInfo, config: &SimConfig, rng: &mut ChaCha8Rng) -> Vec<(PieceIndex, u64, u64)> {
        let sequential = self.sequential.load(Ordering::Acquire);
        let mut table = self.pieces.lock();

        let mut candidates: Vec<(bool, Option<Instant>, std::cmp::Reverse<u8>, u64, u32)> = (0..table.have.len())
            .filter(|&index| table.is_wanted(index))
            .map(|index| {
                let piece = PieceIndex(index as u32);
                let deadline = table.deadlines.get(&piece).copied();
                let order = if sequential || deadline.is_some() || config.jitter == 0 {
                    index as u64
                } else {
                    index as u64 + rng.random_range(0..=config.jitter as u64)
                };
                (
                    deadline.is_none(),
                    deadline,
                    std::cmp::Reverse(table.priorities[index]),
                    order,
                    index as u32,
                )
            })
            .collect();
        candidates.sort_unstable();
        candidates.truncate(config.pieces_per_tick.max(1));

        let selected: Vec<PieceIndex> = candidates.iter().map(|c| PieceIndex(c.4)).collect();
        table.partial.retain(|piece, _| selected.contains(piece));

        selected
            .into_iter()
            .map(|piece| {
                let received = table.partial.get(&piece).copied().unwrap_or(0);
                (piece, received, info.piece_size(piece) as u64)
            })
            .collect()
    }

    /// Spends up to `budget` bytes on wanted pieces, completing what fits.
    ///
    /// Returns the bytes spent.
    pub(crate) fn tick(&self, budget: u64, config: &SimConfig, rng: &mut ChaCha8Rng) -> u64 {
        self.maybe_receive_metadata();
        if self.paused.load(Ordering::Acquire) || self.content.is_none() {
            self.record_tick(0);
            return 0;
        }
        let Some(info) = self.torrent_info_ref() else {
            return 0;
        };

        let mut remaining = budget;
        let mut completed = Vec::new();
        let mut progress = Vec::new();
        for (piece, received, size) in self.plan(&info, config, rng) {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(size - received);
            remaining -= take;
            if received + take >= size {
                completed.push(piece);
            } else {
                progress.push((piece, received + take));
            }
        }

        {
            let mut table = self.pieces.lock();
            for (piece, received) in progress {
                table.partial.insert(piece, received);
            }
        }

        for piece in completed {
            self.deliver(&info, piece);
        }

        let spent = budget - remaining;
        self.record_tick(spent);
        spent
    }

    fn record_tick(&self, bytes: u64) {
        let mut transfer = self.transfer.lock();
        let now = Instant::now();
        if let Some(last) = transfer.last_tick {
            let elapsed = now.duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                transfer.download_rate = (bytes as f64 / elapsed) as u64;
            }
        }
        transfer.last_tick = Some(now);
        transfer.last_tick_bytes = bytes;
        transfer.total_download += bytes;
    }

    /// Writes a finished piece and marks it had.
    ///
    /// A piece the storage does not fully accept stays missing.
    fn deliver(&self, info: &TorrentInfo, piece: PieceIndex) {
        let Some(content) = &self.content else {
            return;
        };
        let offset = info.piece_offset(piece);
        let data = match content.read_range(offset, info.piece_size(piece) as usize) {
            Ok(data) => data,
            Err(e) => {
                self.push_alert(Alert::TorrentError {
                    info_hash: self.info_hash,
                    message: format!("Reading seeded content failed: {e}"),
                });
                return;
            }
        };

        let written = match self.storage_type {
            StorageType::Memory => {
                let storage = self.storage.lock().clone();
                match storage {
                    Some(storage) => storage.write(piece, 0, &data) == data.len(),
                    None => false,
                }
            }
            _ => match write_disk(&self.save_path, info, offset, &data) {
                Ok(()) => true,
                Err(e) => {
                    warn!(info_hash = %self.info_hash, piece = %piece, error = %e, "Failed to write piece");
                    false
                }
            },
        };

        let mut table = self.pieces.lock();
        table.partial.remove(&piece);
        if !written {
            debug!(info_hash = %self.info_hash, piece = %piece, "Storage refused piece");
            return;
        }
        if let Some(had) = table.have.get_mut(piece.as_usize()) {
            *had = true;
        }
        table.deadlines.remove(&piece);
        let finished = (0..table.have.len()).all(|index| !table.is_wanted(index));
        drop(table);

        self.push_alert(Alert::PieceFinished {
            info_hash: self.info_hash,
            piece,
        });
        if finished {
            let mut transfer = self.transfer.lock();
            if transfer.finished_at.is_none() {
                transfer.finished_at = Some(Instant::now());
            }
        }
    }

    /// Deletes downloaded files of a file-backed torrent.
    pub(crate) fn delete_files(&self) {
        if self.storage_type != StorageType::File {
            return;
        }
        let Some(info) = self.torrent_info_ref() else {
            return;
        };
        for entry in &info.files {
            let path = self.save_path.join(&entry.path);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to delete file");
                }
            }
        }
    }

    pub fn download_rate(&self) -> u64 {
        if self.paused.load(Ordering::Acquire) {
            return 0;
        }
        self.transfer.lock().download_rate
    }

    pub fn total_download(&self) -> u64 {
        self.transfer.lock().total_download
    }

    fn peers(&self, config: &SimConfig) -> u32 {
        if self.content.is_some() { config.peers } else { 0 }
    }

    pub(crate) fn status_with(&self, config: &SimConfig) -> EngineStatus {
        let mut status = self.status();
        if !status.is_paused {
            status.num_peers = self.peers(config);
            status.num_seeds = status.num_peers;
            status.num_complete = status.num_peers;
        }
        status
    }
}

/// Visits the parts of `[offset, offset + len)` that fall into each file.
fn for_each_span(
    info: &TorrentInfo,
    offset: u64,
    len: usize,
    mut visit: impl FnMut(&str, u64, std::ops::Range<usize>) -> std::io::Result<()>,
) -> std::io::Result<()> {
    let end = offset + len as u64;
    for entry in &info.files {
        let file_end = entry.offset + entry.size;
        if file_end <= offset || entry.offset >= end {
            continue;
        }
        let from = offset.max(entry.offset);
        let to = end.min(file_end);
        let range = (from - offset) as usize..(to - offset) as usize;
        visit(&entry.path, from - entry.offset, range)?;
    }
    Ok(())
}

fn write_disk(save_path: &std::path::Path, info: &TorrentInfo, offset: u64, data: &[u8]) -> std::io::Result<()> {
    for_each_span(info, offset, data.len(), |path, file_offset, range| {
        let path = save_path.join(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).truncate(false).write(true).open(&path)?;
        file.seek(SeekFrom::Start(file_offset))?;
        file.write_all(&data[range])
    })
}

fn read_disk(save_path: &std::path::Path, info: &TorrentInfo, offset: u64, out: &mut [u8]) -> std::io::Result<()> {
    let len = out.len();
    for_each_span(info, offset, len, |path, file_offset, range| {
        let mut file = fs::File::open(save_path.join(path))?;
        file.seek(SeekFrom::Start(file_offset))?;
        file.read_exact(&mut out[range])
    })
}

impl EngineTorrent for SimTorrent {
    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn torrent_info(&self) -> Option<Arc<TorrentInfo>> {
        self.torrent_info_ref()
    }

    fn status(&self) -> EngineStatus {
        let is_paused = self.paused.load(Ordering::Acquire);
        let transfer = self.transfer.lock();
        let mut status = EngineStatus {
            is_paused,
            is_auto_managed: true,
            active_duration: self.added_at.elapsed(),
            download_rate: if is_paused { 0 } else { transfer.download_rate },
            all_time_download: transfer.total_download,
            finished_duration: transfer.finished_at.map(|at| at.elapsed()).unwrap_or_default(),
            ..EngineStatus::default()
        };
        drop(transfer);

        let Some(info) = self.torrent_info_ref() else {
            status.state = EngineState::DownloadingMetadata;
            return status;
        };
        status.has_metadata = true;
        status.total = info.total_size;

        let table = self.pieces.lock();
        let mut wanted_pieces = 0;
        for index in 0..table.have.len() {
            let piece = PieceIndex(index as u32);
            let size = info.piece_size(piece) as u64;
            let wanted = table.priorities[index] > 0;
            if table.have[index] {
                status.total_done += size;
                if wanted {
                    status.total_wanted_done += size;
                }
            }
            if wanted {
                status.total_wanted += size;
                wanted_pieces += 1;
            }
        }
        let all_had = table.have.iter().all(|&had| had);
        let checking = table.checking;
        drop(table);

        status.progress = if status.total == 0 {
            0.0
        } else {
            status.total_done as f64 / status.total as f64
        };
        status.is_seeding = all_had;
        status.is_finished = wanted_pieces > 0 && status.total_wanted_done == status.total_wanted;
        status.state = if checking {
            EngineState::CheckingResumeData
        } else if all_had {
            EngineState::Seeding
        } else if status.is_finished {
            EngineState::Finished
        } else {
            EngineState::Downloading
        };
        status
    }

    fn have_piece(&self, piece: PieceIndex) -> bool {
        self.pieces.lock().have.get(piece.as_usize()).copied().unwrap_or(false)
    }

    fn piece_priority(&self, piece: PieceIndex) -> u8 {
        self.pieces
            .lock()
            .priorities
            .get(piece.as_usize())
            .copied()
            .unwrap_or(priority::DONT_DOWNLOAD)
    }

    fn piece_priorities(&self) -> Vec<u8> {
        self.pieces.lock().priorities.clone()
    }

    fn set_piece_priority(&self, piece: PieceIndex, value: u8) {
        if let Some(slot) = self.pieces.lock().priorities.get_mut(piece.as_usize()) {
            *slot = value.min(priority::TOP);
        }
    }

    fn prioritize_pieces(&self, priorities: &[(PieceIndex, u8)]) {
        let mut table = self.pieces.lock();
        for &(piece, value) in priorities {
            if let Some(slot) = table.priorities.get_mut(piece.as_usize()) {
                *slot = value.min(priority::TOP);
            }
        }
    }

    fn set_piece_deadline(&self, piece: PieceIndex, deadline: Duration) {
        let mut table = self.pieces.lock();
        if piece.as_usize() < table.have.len() {
            table.deadlines.insert(piece, Instant::now() + deadline);
        }
    }

    fn reset_piece_deadline(&self, piece: PieceIndex) {
        self.pieces.lock().deadlines.remove(&piece);
    }

    fn forget_piece(&self, piece: PieceIndex) {
        let mut table = self.pieces.lock();
        if let Some(had) = table.have.get_mut(piece.as_usize()) {
            *had = false;
        }
        table.partial.remove(&piece);
    }

    fn download_queue(&self) -> Vec<PartialPiece> {
        self.pieces
            .lock()
            .partial
            .iter()
            .map(|(&piece, &bytes_downloaded)| PartialPiece {
                piece,
                bytes_downloaded,
            })
            .collect()
    }

    fn file_priority(&self, file: usize) -> u8 {
        self.pieces
            .lock()
            .file_priorities
            .get(file)
            .copied()
            .unwrap_or(priority::DONT_DOWNLOAD)
    }

    fn set_file_priority(&self, file: usize, value: u8) {
        let Some(info) = self.torrent_info_ref() else {
            return;
        };
        let mut table = self.pieces.lock();
        if let Some(slot) = table.file_priorities.get_mut(file) {
            *slot = value.min(priority::TOP);
            table.apply_file_priority(&info, file);
        }
    }

    fn file_progress(&self) -> Vec<u64> {
        let Some(info) = self.torrent_info_ref() else {
            return Vec::new();
        };
        let table = self.pieces.lock();
        let piece_length = info.piece_length as u64;

        info.files
            .iter()
            .map(|file| {
                let end = file.offset + file.size;
                table
                    .have
                    .iter()
                    .enumerate()
                    .filter(|&(_, &had)| had)
                    .map(|(index, _)| {
                        let start = index as u64 * piece_length;
                        let stop = (start + piece_length).min(info.total_size);
                        stop.min(end).saturating_sub(start.max(file.offset))
                    })
                    .sum()
            })
            .collect()
    }

    fn attach_storage(&self, storage: Arc<dyn PieceStorage>) {
        *self.storage.lock() = Some(storage);
    }

    fn read_piece(&self, piece: PieceIndex, offset: u32, out: &mut [u8]) -> Result<usize, EngineError> {
        let info = self.torrent_info_ref().ok_or_else(|| EngineError::ReadFailed {
            piece,
            reason: "metadata not available".to_string(),
        })?;
        let available = info.piece_size(piece).saturating_sub(offset) as usize;
        let len = available.min(out.len());
        if len == 0 {
            return Ok(0);
        }
        read_disk(
            &self.save_path,
            &info,
            info.piece_offset(piece) + offset as u64,
            &mut out[..len],
        )
        .map_err(|e| EngineError::ReadFailed {
            piece,
            reason: e.to_string(),
        })?;
        Ok(len)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    fn set_sequential_download(&self, sequential: bool) {
        self.sequential.store(sequential, Ordering::Release);
    }

    fn save_resume_data(&self) {
        let Some(info) = self.torrent_info_ref() else {
            self.push_alert(Alert::SaveResumeDataFailed {
                info_hash: self.info_hash,
                reason: "metadata not available".to_string(),
            });
            return;
        };
        let table = self.pieces.lock();
        let data = ResumeData {
            info_hash: self.info_hash.to_string(),
            pieces: (0..info.piece_count())
                .filter(|&index| table.have.get(index as usize).copied().unwrap_or(false))
                .collect(),
            file_priorities: table.file_priorities.clone(),
        };
        drop(table);

        self.push_alert(Alert::SaveResumeData {
            info_hash: self.info_hash,
            data: data.encode(),
        });
    }

    fn metainfo(&self) -> Option<Vec<u8>> {
        self.metadata
            .read()
            .as_ref()
            .map(|known| known.torrent_bytes.as_ref().clone())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::swarm::Swarm;

    const PIECE: u32 = 1024;

    fn content(len: usize) -> (Swarm, Arc<SeededContent>, Vec<u8>) {
        let swarm = Swarm::with_piece_length(PIECE);
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let content = swarm.seed_bytes("clip.mp4", data.clone()).unwrap();
        (swarm, content, data)
    }

    fn torrent(content: &Arc<SeededContent>, storage: StorageType, save_path: PathBuf) -> SimTorrent {
        SimTorrent::new(
            SimTorrentParams {
                info_hash: content.info_hash(),
                content: Some(Arc::clone(content)),
                metainfo: Some((content.metainfo.clone(), content.torrent_bytes.clone())),
                storage,
                save_path,
                paused: false,
                sequential: false,
                resume_data: None,
                metadata_delay: Duration::ZERO,
            },
            Arc::new(Mutex::new(Vec::new())),
        )
    }

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(7)
    }

    #[test]
    fn test_files_start_deselected() {
        let (_swarm, content, _) = content(4 * PIECE as usize);
        let dir = tempfile::tempdir().unwrap();
        let torrent = torrent(&content, StorageType::File, dir.path().to_path_buf());

        assert_eq!(torrent.file_priority(0), 0);
        assert!(torrent.piece_priorities().iter().all(|&value| value == 0));
        assert_eq!(torrent.tick(u64::MAX, &SimConfig::default(), &mut rng()), 0);
    }

    #[test]
    fn test_deadline_pieces_come_first() {
        let (_swarm, content, _) = content(8 * PIECE as usize);
        let dir = tempfile::tempdir().unwrap();
        let torrent = torrent(&content, StorageType::File, dir.path().to_path_buf());
        torrent.set_file_priority(0, priority::DEFAULT);
        torrent.set_piece_deadline(PieceIndex(6), Duration::ZERO);

        let config = SimConfig {
            pieces_per_tick: 1,
            ..SimConfig::default()
        };
        torrent.tick(PIECE as u64, &config, &mut rng());

        assert!(torrent.have_piece(PieceIndex(6)));
        assert!((0..6).all(|index| !torrent.have_piece(PieceIndex(index))));
    }

    #[test]
    fn test_partial_pieces_show_in_download_queue() {
        let (_swarm, content, _) = content(4 * PIECE as usize);
        let dir = tempfile::tempdir().unwrap();
        let torrent = torrent(&content, StorageType::File, dir.path().to_path_buf());
        torrent.set_sequential_download(true);
        torrent.set_file_priority(0, priority::DEFAULT);

        torrent.tick(PIECE as u64 / 2, &SimConfig::default(), &mut rng());

        assert_eq!(
            torrent.download_queue(),
            vec![PartialPiece {
                piece: PieceIndex(0),
                bytes_downloaded: PIECE as u64 / 2,
            }]
        );
        torrent.tick(PIECE as u64 / 2, &SimConfig::default(), &mut rng());
        assert!(torrent.have_piece(PieceIndex(0)));
        assert!(torrent.download_queue().is_empty());
    }

    #[test]
    fn test_file_storage_round_trips_through_disk() {
        let (_swarm, content, data) = content(3 * PIECE as usize + 100);
        let dir = tempfile::tempdir().unwrap();
        let torrent = torrent(&content, StorageType::File, dir.path().to_path_buf());
        torrent.set_file_priority(0, priority::DEFAULT);

        torrent.tick(u64::MAX, &SimConfig::instant(), &mut rng());

        let status = torrent.status();
        assert_eq!(status.state, EngineState::Seeding);
        assert_eq!(status.total_wanted_done, data.len() as u64);
        assert_eq!(fs::read(dir.path().join("clip.mp4")).unwrap(), data);

        let mut out = vec![0u8; 200];
        let read = torrent.read_piece(PieceIndex(3), 0, &mut out).unwrap();
        assert_eq!(read, 100);
        assert_eq!(&out[..100], &data[3 * PIECE as usize..]);
    }

    #[test]
    fn test_resume_data_restores_verified_pieces() {
        let (_swarm, content, _) = content(4 * PIECE as usize);
        let dir = tempfile::tempdir().unwrap();
        let first = torrent(&content, StorageType::File, dir.path().to_path_buf());
        first.set_file_priority(0, priority::DEFAULT);
        first.tick(2 * PIECE as u64, &SimConfig { jitter: 0, ..SimConfig::default() }, &mut rng());
        first.save_resume_data();

        let resume = first
            .alerts
            .lock()
            .iter()
            .find_map(|alert| match alert {
                Alert::SaveResumeData { data, .. } => Some(data.clone()),
                _ => None,
            })
            .unwrap();

        // Corrupt piece 1 on disk so only piece 0 survives the check.
        let path = dir.path().join("clip.mp4");
        let mut bytes = fs::read(&path).unwrap();
        bytes[PIECE as usize] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let second = SimTorrent::new(
            SimTorrentParams {
                info_hash: content.info_hash(),
                content: Some(Arc::clone(&content)),
                metainfo: Some((content.metainfo.clone(), content.torrent_bytes.clone())),
                storage: StorageType::File,
                save_path: dir.path().to_path_buf(),
                paused: false,
                sequential: false,
                resume_data: Some(resume),
                metadata_delay: Duration::ZERO,
            },
            Arc::new(Mutex::new(Vec::new())),
        );

        assert!(second.have_piece(PieceIndex(0)));
        assert!(!second.have_piece(PieceIndex(1)));
        assert_eq!(second.file_priority(0), priority::DEFAULT);
    }

    #[test]
    fn test_paused_torrent_does_not_download() {
        let (_swarm, content, _) = content(2 * PIECE as usize);
        let dir = tempfile::tempdir().unwrap();
        let torrent = torrent(&content, StorageType::File, dir.path().to_path_buf());
        torrent.set_file_priority(0, priority::DEFAULT);
        torrent.pause();

        assert_eq!(torrent.tick(u64::MAX, &SimConfig::default(), &mut rng()), 0);
        assert!(torrent.status().is_paused);
    }

    #[test]
    fn test_magnet_waits_for_metadata_delay() {
        let (_swarm, content, _) = content(2 * PIECE as usize);
        let alerts: AlertQueue = Arc::new(Mutex::new(Vec::new()));
        let torrent = SimTorrent::new(
            SimTorrentParams {
                info_hash: content.info_hash(),
                content: Some(Arc::clone(&content)),
                metainfo: None,
                storage: StorageType::Memory,
                save_path: PathBuf::from("unused"),
                paused: false,
                sequential: false,
                resume_data: None,
                metadata_delay: Duration::from_millis(30),
            },
            Arc::clone(&alerts),
        );

        torrent.tick(0, &SimConfig::default(), &mut rng());
        assert!(torrent.torrent_info().is_none());
        assert_eq!(torrent.status().state, EngineState::DownloadingMetadata);

        std::thread::sleep(Duration::from_millis(40));
        torrent.tick(0, &SimConfig::default(), &mut rng());
        assert!(torrent.torrent_info().is_some());
        assert!(alerts.lock().contains(&Alert::MetadataReceived {
            info_hash: content.info_hash(),
        }));
    }

    #[test]
    fn test_boundary_piece_keeps_highest_file_priority() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("pack");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.bin"), vec![1u8; 1500]).unwrap();
        fs::write(root.join("b.bin"), vec![2u8; 1500]).unwrap();
        let swarm = Swarm::with_piece_length(PIECE);
        let content = swarm.seed_directory(&root).unwrap();
        let torrent = torrent(&content, StorageType::File, dir.path().join("out"));

        torrent.set_file_priority(0, priority::DEFAULT);
        assert_eq!(torrent.piece_priorities(), vec![4, 4, 0]);

        torrent.set_file_priority(1, priority::LOW);
        torrent.set_file_priority(0, priority::DONT_DOWNLOAD);
        assert_eq!(torrent.piece_priorities(), vec![0, 1, 1]);
    }

    proptest::proptest! {
        #[test]
        fn test_spans_tile_the_requested_range(
            sizes in proptest::collection::vec(1u64..5000, 1..6),
            start in 0u64..20_000,
            len in 1usize..8000,
        ) {
            let files = sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| (format!("pack/{i}.bin"), size))
                .collect();
            let info = TorrentInfo::new("pack", PIECE, files);
            let offset = start % info.total_size;
            let expected_end = (offset + len as u64).min(info.total_size);

            let mut next = 0usize;
            for_each_span(&info, offset, len, |path, file_offset, range| {
                let entry = info.files.iter().find(|entry| entry.path == path).unwrap();
                assert_eq!(range.start, next);
                assert!(file_offset + (range.len() as u64) <= entry.size);
                assert_eq!(entry.offset + file_offset, offset + range.start as u64);
                next = range.end;
                Ok(())
            })
            .unwrap();
            proptest::prop_assert_eq!(next as u64, expected_end - offset);
        }
    }
}
