//! Blocking range reader over one torrent file.
//!
//! A `Reader` serves one HTTP byte range. Each `read` call works out which
//! pieces the requested bytes live in, nudges the scheduler, blocks until
//! every missing piece has arrived (or the wait fails) and copies the bytes
//! out of storage in order. It never hands out bytes past a missing piece, so
//! concatenating all reads always yields the file content of the range.
//!
//! Torrents and files track their readers through `ReaderCursor`s held weakly
//! in a `ReaderRegistry`; the reader owns the cursor and unregisters it on drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::shutdown::Shutdown;
use crate::storage::StorageBackend;
use crate::streaming::File;
use crate::torrent::priority::ReaderWindow;
use crate::torrent::{PieceIndex, Torrent, TorrentError};

/// Inclusive byte range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Whole file of `size` bytes.
    pub fn full(size: u64) -> Self {
        Self {
            start: 0,
            end: size.saturating_sub(1),
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Created,
    Reading,
    WaitingForPiece,
    Closed,
}

/// Scheduling view of a reader shared with its torrent and file.
#[derive(Debug)]
pub struct ReaderCursor {
    id: u64,
    piece_start: AtomicU32,
    piece_end: AtomicU32,
    piece_end_limit: PieceIndex,
    closing: AtomicBool,
}

impl ReaderCursor {
    pub(crate) fn new(id: u64, piece_start: PieceIndex, piece_end_limit: PieceIndex) -> Self {
        Self {
            id,
            piece_start: AtomicU32::new(piece_start.as_u32()),
            piece_end: AtomicU32::new(piece_start.as_u32()),
            piece_end_limit,
            closing: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn piece_start(&self) -> PieceIndex {
        PieceIndex(self.piece_start.load(Ordering::Acquire))
    }

    pub fn piece_end(&self) -> PieceIndex {
        PieceIndex(self.piece_end.load(Ordering::Acquire))
    }

    /// Last piece the reader can ever ask for.
    pub fn piece_end_limit(&self) -> PieceIndex {
        self.piece_end_limit
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub fn window(&self) -> ReaderWindow {
        ReaderWindow {
            start: self.piece_start(),
            end_limit: self.piece_end_limit,
            closing: self.is_closing(),
        }
    }

    pub(crate) fn set_window(&self, start: PieceIndex, end: PieceIndex) {
        self.piece_start.store(start.as_u32(), Ordering::Release);
        self.piece_end.store(end.as_u32(), Ordering::Release);
    }
}

/// Non-owning set of live readers keyed by reader id.
#[derive(Debug, Default)]
pub struct ReaderRegistry {
    readers: Mutex<HashMap<u64, Weak<ReaderCursor>>>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cursor: &Arc<ReaderCursor>) {
        self.readers.lock().insert(cursor.id(), Arc::downgrade(cursor));
    }

    pub fn unregister(&self, id: u64) {
        self.readers.lock().remove(&id);
    }

    /// Live readers ordered by id.
    pub fn cursors(&self) -> Vec<Arc<ReaderCursor>> {
        let mut readers = self.readers.lock();
        readers.retain(|_, cursor| cursor.strong_count() > 0);

        let mut cursors: Vec<_> = readers.values().filter_map(Weak::upgrade).collect();
        cursors.sort_by_key(|cursor| cursor.id());
        cursors
    }

    pub fn len(&self) -> usize {
        self.cursors().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks every live reader closing.
    pub fn close_all(&self) {
        for cursor in self.cursors() {
            cursor.close();
        }
    }
}

/// Marks its reader closing when dropped, for example with a dropped HTTP body.
pub struct ReaderCloseGuard {
    cursor: Arc<ReaderCursor>,
    torrent: Arc<Torrent>,
}

impl Drop for ReaderCloseGuard {
    fn drop(&mut self) {
        self.cursor.close();
        self.torrent.notify_piece_waiters();
    }
}

/// One open byte-range read over a file.
pub struct Reader {
    cursor: Arc<ReaderCursor>,
    torrent: Arc<Torrent>,
    file: Arc<File>,
    backend: StorageBackend,
    range: ByteRange,
    position: u64,
    state: ReaderState,
    prioritized: bool,
    shutdown: Shutdown,
    timeout: Duration,
    wait_interval: Duration,
}

impl Reader {
    /// Opens `range` of `file` and registers the reader with the file and torrent.
    ///
    /// The range end is clamped to the file size.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MetadataUnavailable` - The torrent has no storage yet
    pub fn open(
        torrent: Arc<Torrent>,
        file: Arc<File>,
        range: ByteRange,
        shutdown: Shutdown,
    ) -> Result<Self, TorrentError> {
        let backend = torrent
            .backend()
            .ok_or(TorrentError::MetadataUnavailable {
                info_hash: torrent.info_hash(),
            })?;
        let config = torrent.streaming_config();

        let range = ByteRange::new(range.start, range.end.min(file.size().saturating_sub(1)));
        let id = rand::rng().random_range(1_000_000..10_000_000);
        let cursor = Arc::new(ReaderCursor::new(
            id,
            file.piece_at(range.start),
            file.piece_at(range.end),
        ));

        file.register_reader(&cursor);
        torrent.register_reader(&cursor);

        debug!(
            info_hash = %torrent.info_hash(),
            file = %file.path(),
            reader = id,
            start = range.start,
            end = range.end,
            "Created reader"
        );

        Ok(Self {
            cursor,
            torrent,
            file,
            backend,
            range,
            position: range.start,
            state: ReaderState::Created,
            prioritized: false,
            shutdown,
            timeout: config.buffer_timeout,
            wait_interval: config.piece_wait_interval,
        })
    }

    pub fn id(&self) -> u64 {
        self.cursor.id()
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Next file offset to be delivered.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn range(&self) -> ByteRange {
        self.range
    }

    pub fn cursor(&self) -> &Arc<ReaderCursor> {
        &self.cursor
    }

    /// Guard that closes this reader from another thread when dropped.
    pub fn close_handle(&self) -> ReaderCloseGuard {
        ReaderCloseGuard {
            cursor: Arc::clone(&self.cursor),
            torrent: Arc::clone(&self.torrent),
        }
    }

    /// Copies the next bytes of the range into `out`, blocking for missing pieces.
    ///
    /// Returns the number of bytes copied; zero means the range is exhausted or
    /// the reader is closed. A short count means a piece wait failed or storage
    /// returned fewer bytes than asked for.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        if self.state == ReaderState::Closed || out.is_empty() {
            return 0;
        }

        let end = (self.range.end + 1).min(self.file.size());
        if self.position >= end {
            return 0;
        }
        let wanted = (out.len() as u64).min(end - self.position) as usize;

        let piece_start = self.file.piece_at(self.position);
        let piece_end = self.file.piece_at(self.position + wanted as u64 - 1);
        self.cursor.set_window(piece_start, piece_end);
        self.state = ReaderState::Reading;

        if !self.prioritized {
            self.prioritized = true;
            self.torrent.prioritize();
        }
        let bump_end = PieceIndex(
            piece_start
                .as_u32()
                .saturating_add(2)
                .min(self.file.last_piece().as_u32()),
        );
        self.torrent.prioritize_pieces(piece_start, bump_end);

        let mut copied = 0;
        for index in piece_start.as_u32()..=piece_end.as_u32() {
            let piece = PieceIndex(index);
            if !self.torrent.have_piece(piece) {
                self.state = ReaderState::WaitingForPiece;
                if !self.wait_for_piece(piece) {
                    self.state = ReaderState::Closed;
                    return copied;
                }
                self.state = ReaderState::Reading;
            }
            self.torrent.clear_piece_deadline(piece);

            let absolute = self.file.offset() + self.position;
            let piece_offset = (absolute % self.torrent.piece_length() as u64) as u32;
            let available = self.torrent.piece_size(piece).saturating_sub(piece_offset) as usize;
            let chunk = available.min(wanted - copied);

            let read = self
                .backend
                .read(piece, piece_offset, &mut out[copied..copied + chunk]);
            copied += read;
            self.position += read as u64;

            if read < chunk {
                debug!(
                    info_hash = %self.torrent.info_hash(),
                    reader = self.id(),
                    piece = %piece,
                    read,
                    expected = chunk,
                    "Short read from storage"
                );
                break;
            }
        }

        trace!(reader = self.id(), copied, position = self.position, "Read chunk");
        copied
    }

    /// Blocks until `piece` is downloaded.
    ///
    /// Returns false when the wait times out or the reader, torrent or
    /// process is shutting down.
    pub fn wait_for_piece(&self, piece: PieceIndex) -> bool {
        let started = Instant::now();
        debug!(info_hash = %self.torrent.info_hash(), reader = self.id(), piece = %piece, "Waiting for piece");

        loop {
            let seen = self.torrent.piece_event_count();
            if self.torrent.have_piece(piece) {
                debug!(
                    reader = self.id(),
                    piece = %piece,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Piece arrived"
                );
                return true;
            }

            if self.shutdown.is_triggered() || self.torrent.is_closing() || self.cursor.is_closing() {
                debug!(reader = self.id(), piece = %piece, "Abort waiting for piece due to closing");
                return false;
            }

            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                warn!(
                    info_hash = %self.torrent.info_hash(),
                    reader = self.id(),
                    piece = %piece,
                    priority = self.torrent.piece_priority(piece),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Timed out waiting for piece"
                );
                return false;
            }

            let slice = self.wait_interval.min(self.timeout - elapsed);
            self.torrent.wait_piece_event(seen, slice);
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.cursor.close();
        self.file.unregister_reader(self.cursor.id());
        self.torrent.unregister_reader(self.cursor.id());
        debug!(
            info_hash = %self.torrent.info_hash(),
            file = %self.file.path(),
            reader = self.cursor.id(),
            "Destroyed reader"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_range_len() {
        assert_eq!(ByteRange::new(0, 99).len(), 100);
        assert_eq!(ByteRange::full(10), ByteRange::new(0, 9));
        assert!(!ByteRange::full(10).is_empty());
    }

    #[test]
    fn test_registry_drops_dead_cursors() {
        let registry = ReaderRegistry::new();
        let live = Arc::new(ReaderCursor::new(2, PieceIndex(0), PieceIndex(5)));
        let dead = Arc::new(ReaderCursor::new(1, PieceIndex(0), PieceIndex(5)));
        registry.register(&live);
        registry.register(&dead);
        drop(dead);

        let ids: Vec<u64> = registry.cursors().iter().map(|cursor| cursor.id()).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_close_all_marks_cursors() {
        let registry = ReaderRegistry::new();
        let cursor = Arc::new(ReaderCursor::new(7, PieceIndex(3), PieceIndex(9)));
        registry.register(&cursor);

        registry.close_all();

        assert!(cursor.is_closing());
        assert!(cursor.window().closing);
        assert_eq!(cursor.window().start, PieceIndex(3));
    }
}
