//! One file inside a torrent and its initial buffering.
//!
//! Starting a buffer selects the pieces a player needs before playback can
//! begin, the head of the file and its tail, and requests them at top
//! priority. With memory storage the first and last of those pieces are also
//! reserved so they survive while the rest of the torrent streams through.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::StreamingConfig;
use crate::engine::priority;
use crate::storage::PieceSet;
use crate::streaming::pieces::region_pieces;
use crate::streaming::reader::{ReaderCursor, ReaderRegistry};
use crate::torrent::{FileEntry, InfoHash, PieceIndex, Torrent, TorrentError, TorrentInfo};

#[derive(Debug, Default)]
struct BufferingState {
    is_buffering: bool,
    pieces: Vec<PieceIndex>,
    size_bytes: u64,
    progress: f64,
}

/// A file of a torrent with metadata.
#[derive(Debug)]
pub struct File {
    info_hash: InfoHash,
    index: usize,
    path: String,
    name: String,
    size: u64,
    offset: u64,
    piece_length: u32,
    piece_count: u32,
    piece_start: PieceIndex,
    /// Exclusive
    piece_end: PieceIndex,
    head_buffer_bytes: u64,
    tail_buffer_bytes: u64,
    selected: AtomicBool,
    buffering: Mutex<BufferingState>,
    readers: ReaderRegistry,
}

impl File {
    pub fn new(
        info_hash: InfoHash,
        index: usize,
        entry: &FileEntry,
        info: &TorrentInfo,
        streaming: &StreamingConfig,
        selected: bool,
    ) -> Self {
        let (first, last) = region_pieces(
            entry.offset,
            entry.size,
            info.piece_length,
            info.piece_count(),
        );
        let piece_end = if entry.size == 0 {
            first
        } else {
            PieceIndex(last.as_u32() + 1)
        };

        Self {
            info_hash,
            index,
            path: entry.path.clone(),
            name: entry.name.clone(),
            size: entry.size,
            offset: entry.offset,
            piece_length: info.piece_length,
            piece_count: info.piece_count(),
            piece_start: first,
            piece_end,
            head_buffer_bytes: streaming.buffer_size,
            tail_buffer_bytes: streaming.end_buffer_size,
            selected: AtomicBool::new(selected),
            buffering: Mutex::new(BufferingState::default()),
            readers: ReaderRegistry::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset of the file inside the torrent content.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn piece_start(&self) -> PieceIndex {
        self.piece_start
    }

    /// One past the last piece of the file.
    pub fn piece_end(&self) -> PieceIndex {
        self.piece_end
    }

    pub fn last_piece(&self) -> PieceIndex {
        PieceIndex(
            self.piece_end
                .as_u32()
                .saturating_sub(1)
                .max(self.piece_start.as_u32()),
        )
    }

    /// Piece holding byte `position` of the file, clamped to the file's span.
    pub fn piece_at(&self, position: u64) -> PieceIndex {
        if self.piece_length == 0 {
            return self.piece_start;
        }
        let piece = ((self.offset + position) / self.piece_length as u64) as u32;
        PieceIndex(piece.clamp(self.piece_start.as_u32(), self.last_piece().as_u32()))
    }

    pub fn stream_uri(&self) -> String {
        format!(
            "/torrents/{}/files/{}/stream/{}",
            self.info_hash,
            self.index,
            urlencoding::encode(&self.name)
        )
    }

    pub fn is_selected(&self) -> bool {
        self.selected.load(Ordering::Acquire)
    }

    /// Current engine priority of the file.
    pub fn priority(&self, torrent: &Torrent) -> u8 {
        torrent.engine().file_priority(self.index)
    }

    /// Selects or deselects the file.
    ///
    /// Memory-backed torrents only download what readers ask for, so the
    /// engine priority is left alone for them.
    pub fn set_priority(&self, torrent: &Torrent, value: u8) {
        self.selected.store(value > 0, Ordering::Release);
        if !torrent.is_memory_storage() {
            info!(info_hash = %self.info_hash, file = self.index, priority = value, "Setting file priority");
            torrent.engine().set_file_priority(self.index, value);
            torrent.save_resume_data();
        }
    }

    /// Pieces to prefetch before playback: those overlapping the first
    /// `buffer_size` and last `end_buffer_size` bytes of the file, or the
    /// whole file when it is smaller than both.
    pub fn select_buffer_pieces(&self) -> Vec<PieceIndex> {
        let mut pieces: Vec<u32> =
            if self.size >= self.head_buffer_bytes + self.tail_buffer_bytes {
                let (head_start, head_end) = region_pieces(
                    self.offset,
                    self.head_buffer_bytes,
                    self.piece_length,
                    self.piece_count,
                );
                let (tail_start, tail_end) = region_pieces(
                    self.offset + self.size - self.tail_buffer_bytes,
                    self.tail_buffer_bytes,
                    self.piece_length,
                    self.piece_count,
                );
                (head_start.as_u32()..=head_end.as_u32())
                    .chain(tail_start.as_u32()..=tail_end.as_u32())
                    .collect()
            } else {
                (self.piece_start.as_u32()..=self.last_piece().as_u32()).collect()
            };

        let mut seen = HashSet::new();
        pieces.retain(|piece| seen.insert(*piece));
        pieces.into_iter().map(PieceIndex).collect()
    }

    /// Requests the buffer pieces at top priority and starts tracking progress.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - Reserving the buffer pieces would pin every
    ///   memory buffer
    pub fn start_buffer(&self, torrent: &Torrent) -> Result<(), TorrentError> {
        info!(info_hash = %self.info_hash, file = %self.name, "Buffering file");

        let pieces = self.select_buffer_pieces();
        let size_bytes: u64 = pieces
            .iter()
            .map(|&piece| torrent.piece_size(piece) as u64)
            .sum();

        // Reserve first so a refusal leaves the file untouched.
        if let Some(storage) = torrent.memory_storage() {
            if size_bytes > storage.capacity() {
                info!(
                    info_hash = %self.info_hash,
                    size = size_bytes,
                    "Adjusting memory size to fit the buffer"
                );
                torrent.set_memory_size(size_bytes);
            }

            let reserved = pieces.first().into_iter().chain(pieces.last()).copied();
            storage.update_reserved_pieces(PieceSet::from_pieces(storage.piece_count(), reserved))?;
        }

        {
            let mut buffering = self.buffering.lock();
            buffering.is_buffering = true;
            buffering.progress = 0.0;
            buffering.pieces = pieces.clone();
            buffering.size_bytes = size_bytes;
        }

        for &piece in &pieces {
            torrent.request_piece(piece, priority::TOP, Duration::ZERO);
        }

        info!(
            info_hash = %self.info_hash,
            file = %self.name,
            pieces = pieces.len(),
            size = size_bytes,
            "Buffering set"
        );
        Ok(())
    }

    /// Stops buffering without touching piece priorities.
    pub fn stop_buffer(&self) {
        self.buffering.lock().is_buffering = false;
    }

    /// Records buffering progress in percent.
    ///
    /// Progress never goes down; reaching 100 ends buffering.
    pub fn set_buffer_progress(&self, progress: f64) {
        let mut buffering = self.buffering.lock();
        let progress = progress.clamp(0.0, 100.0);
        if progress > buffering.progress {
            debug!(info_hash = %self.info_hash, file = self.index, progress, "Buffer progress");
            buffering.progress = progress;
        }
        if buffering.progress >= 100.0 && buffering.is_buffering {
            info!(info_hash = %self.info_hash, file = %self.name, "Finished buffering");
            buffering.is_buffering = false;
        }
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering.lock().is_buffering
    }

    pub fn buffer_progress(&self) -> f64 {
        self.buffering.lock().progress
    }

    pub fn buffer_pieces(&self) -> Vec<PieceIndex> {
        self.buffering.lock().pieces.clone()
    }

    /// Total bytes of the buffer pieces.
    pub fn buffer_size(&self) -> u64 {
        self.buffering.lock().size_bytes
    }

    pub fn register_reader(&self, cursor: &Arc<ReaderCursor>) {
        self.readers.register(cursor);
    }

    pub fn unregister_reader(&self, id: u64) {
        self.readers.unregister(id);
    }

    pub fn has_readers(&self) -> bool {
        !self.readers.is_empty()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }
}
