//! Bounded in-memory piece storage for streaming torrents.
//!
//! Holds at most `buffer_count` pieces at a time. When every slot is taken a
//! new piece evicts one resident piece first, preferring pieces no reader
//! currently wants, and the engine is told to forget the evicted piece so it
//! downloads it again when needed. Reserved pieces (a file's first and last
//! buffered piece) are pinned and never evicted while reserved.
//!
//! Locking: `pool` guards slot allocation and eviction, `interest` guards the
//! reader and reserved sets. When both are needed `pool` is taken first. Piece
//! bytes are copied with neither lock held.

use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::engine::{EngineTorrent, priority};
use crate::storage::buffer_pool::SlotLease;
use crate::storage::{BufferPool, PieceRecord, PieceSet, PieceStorage, StorageError};
use crate::torrent::{InfoHash, PieceIndex, TorrentInfo};

#[derive(Debug)]
struct InterestSets {
    /// Pieces inside the windows of live readers, replaced every scheduling tick
    readers: PieceSet,
    reserved: PieceSet,
}

/// Outcome of finding a slot for a write.
enum WriteSlot {
    Ready {
        lease: SlotLease,
        evicted: Option<PieceIndex>,
    },
    /// Readers-only mode turned the piece down
    Refused,
    Unavailable,
}

/// Ring of piece buffers the engine writes downloaded pieces into.
pub struct MemoryStorage {
    info_hash: InfoHash,
    piece_length: u32,
    piece_count: u32,
    capacity: AtomicU64,
    initialized: AtomicBool,
    readers_only: AtomicBool,
    pool: Mutex<BufferPool>,
    interest: RwLock<InterestSets>,
    engine: Weak<dyn EngineTorrent>,
}

impl MemoryStorage {
    /// Creates storage for `info` sized to `capacity_bytes`.
    ///
    /// Evicted pieces are handed back to `engine` as long as it is alive.
    pub fn new(
        info_hash: InfoHash,
        info: &TorrentInfo,
        capacity_bytes: u64,
        engine: Weak<dyn EngineTorrent>,
    ) -> Self {
        let piece_count = info.piece_count();
        let piece_sizes: Vec<u32> = (0..piece_count)
            .map(|index| info.piece_size(PieceIndex(index)))
            .collect();
        let buffer_count = buffers_for(capacity_bytes, info.piece_length, piece_count);

        debug!(
            info_hash = %info_hash,
            capacity = capacity_bytes,
            buffers = buffer_count,
            pieces = piece_count,
            "Created memory storage"
        );

        Self {
            info_hash,
            piece_length: info.piece_length,
            piece_count,
            capacity: AtomicU64::new(capacity_bytes),
            initialized: AtomicBool::new(false),
            readers_only: AtomicBool::new(false),
            pool: Mutex::new(BufferPool::new(info.piece_length, &piece_sizes, buffer_count)),
            interest: RwLock::new(InterestSets {
                readers: PieceSet::with_capacity(piece_count),
                reserved: PieceSet::with_capacity(piece_count),
            }),
            engine,
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Configured capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn buffer_count(&self) -> usize {
        self.pool.lock().buffer_count()
    }

    /// Slots holding unreserved pieces.
    pub fn used_count(&self) -> usize {
        self.pool.lock().used_count()
    }

    pub fn eviction_count(&self) -> u64 {
        self.pool.lock().eviction_count()
    }

    pub fn is_resident(&self, piece: PieceIndex) -> bool {
        self.pool.lock().slot_of(piece).is_some()
    }

    pub fn resident_pieces(&self) -> Vec<PieceIndex> {
        let mut pieces = self.pool.lock().resident_pieces();
        pieces.sort();
        pieces
    }

    /// Slot currently holding `piece`.
    pub fn buffer_of(&self, piece: PieceIndex) -> Option<usize> {
        self.pool.lock().slot_of(piece)
    }

    pub fn piece_record(&self, piece: PieceIndex) -> Option<PieceRecord> {
        self.pool.lock().record(piece).cloned()
    }

    pub fn reserved_pieces(&self) -> Vec<PieceIndex> {
        self.interest.read().reserved.iter().collect()
    }

    pub fn reader_pieces(&self) -> Vec<PieceIndex> {
        self.interest.read().readers.iter().collect()
    }

    pub fn is_readers_only(&self) -> bool {
        self.readers_only.load(Ordering::Acquire)
    }

    /// Refuses writes of pieces outside the reader and reserved sets when enabled.
    pub fn set_readers_only(&self, enabled: bool) {
        self.readers_only.store(enabled, Ordering::Release);
    }

    /// Raises capacity to `capacity_bytes`, adding empty slots. Never shrinks.
    pub fn set_memory_size(&self, capacity_bytes: u64) {
        let mut pool = self.pool.lock();
        if capacity_bytes <= self.capacity() {
            return;
        }
        self.capacity.store(capacity_bytes, Ordering::Release);

        let buffer_count = buffers_for(capacity_bytes, self.piece_length, self.piece_count);
        if buffer_count > pool.buffer_count() {
            debug!(
                info_hash = %self.info_hash,
                from = pool.buffer_count(),
                to = buffer_count,
                "Growing memory storage"
            );
            pool.grow(buffer_count);
        }
    }

    /// Replaces the set of pieces wanted by live readers.
    pub fn update_reader_pieces(&self, pieces: PieceSet) {
        self.interest.write().readers = pieces;
    }

    /// Replaces the reserved set and re-pins resident slots to match.
    ///
    /// # Errors
    ///
    /// - `StorageError::ReservedExceedsCapacity` - Reserving this many pieces
    ///   would leave no slot to evict
    pub fn update_reserved_pieces(&self, pieces: PieceSet) -> Result<(), StorageError> {
        let mut pool = self.pool.lock();
        let buffers = pool.buffer_count();
        if pieces.len() >= buffers && buffers < self.piece_count as usize {
            return Err(StorageError::ReservedExceedsCapacity {
                reserved: pieces.len(),
                buffers,
            });
        }

        let mut interest = self.interest.write();
        pool.repin(&pieces);
        interest.reserved = pieces;
        Ok(())
    }

    fn acquire_for_write(&self, piece: PieceIndex) -> WriteSlot {
        let mut pool = self.pool.lock();
        if let Some(lease) = pool.lease(piece) {
            return WriteSlot::Ready {
                lease,
                evicted: None,
            };
        }

        let interest = self.interest.read();
        let reserved = interest.reserved.contains(piece);
        if self.is_readers_only() && !reserved && !interest.readers.contains(piece) {
            return WriteSlot::Refused;
        }

        let mut evicted = None;
        if pool.is_full() {
            let Some(victim) = pool.select_victim(piece, &interest.readers, &interest.reserved)
            else {
                warn!(
                    info_hash = %self.info_hash,
                    piece = %piece,
                    buffers = pool.buffer_count(),
                    "No evictable buffer, dropping write"
                );
                return WriteSlot::Unavailable;
            };
            pool.evict(victim);
            trace!(info_hash = %self.info_hash, piece = %victim, "Evicted piece");
            evicted = Some(victim);
        }

        match pool.allocate(piece, reserved) {
            Some(lease) => WriteSlot::Ready { lease, evicted },
            None => WriteSlot::Unavailable,
        }
    }

    /// Drops the engine's claim on a piece that is no longer stored.
    fn restore_piece(&self, piece: PieceIndex) {
        if let Some(engine) = self.engine.upgrade() {
            engine.reset_piece_deadline(piece);
            engine.set_piece_priority(piece, priority::DONT_DOWNLOAD);
            engine.forget_piece(piece);
        }
    }
}

impl PieceStorage for MemoryStorage {
    fn initialize(&self) {
        self.initialized.store(true, Ordering::Release);
        debug!(info_hash = %self.info_hash, "Memory storage initialized");
    }

    fn read(&self, piece: PieceIndex, offset: u32, out: &mut [u8]) -> usize {
        if !self.is_initialized() || out.is_empty() {
            return 0;
        }

        let (lease, len) = {
            let mut pool = self.pool.lock();
            let Some(record) = pool.record(piece) else {
                return 0;
            };
            if record.buffer_slot.is_none() || offset >= record.length {
                return 0;
            }
            let len = (record.length - offset).min(out.len() as u32);
            let Some(lease) = pool.lease(piece) else {
                return 0;
            };
            (lease, len)
        };

        if !lease.read_at(offset as usize, &mut out[..len as usize]) {
            return 0;
        }
        self.pool.lock().commit_read(piece, &lease, offset, len);
        len as usize
    }

    fn write(&self, piece: PieceIndex, offset: u32, data: &[u8]) -> usize {
        if !self.is_initialized() || data.is_empty() {
            return 0;
        }

        let len = match self.pool.lock().record(piece) {
            Some(record) if offset < record.length => (record.length - offset).min(data.len() as u32),
            _ => return 0,
        };

        let lease = match self.acquire_for_write(piece) {
            WriteSlot::Ready { lease, evicted } => {
                if let Some(victim) = evicted {
                    self.restore_piece(victim);
                }
                lease
            }
            WriteSlot::Refused => {
                trace!(info_hash = %self.info_hash, piece = %piece, "Refused piece outside reader windows");
                self.restore_piece(piece);
                return 0;
            }
            WriteSlot::Unavailable => return 0,
        };

        if !lease.write_at(offset as usize, &data[..len as usize]) {
            return 0;
        }
        self.pool.lock().commit_write(piece, &lease, len);
        len as usize
    }
}

fn buffers_for(capacity_bytes: u64, piece_length: u32, piece_count: u32) -> usize {
    if piece_length == 0 {
        return 0;
    }
    capacity_bytes
        .div_ceil(piece_length as u64)
        .min(piece_count as u64) as usize
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::engine::test_mocks::MockTorrent;

    const PIECE: u32 = 1024;

    struct Fixture {
        engine: Arc<MockTorrent>,
        storage: MemoryStorage,
    }

    impl Fixture {
        fn new(pieces: u32, buffers: u64) -> Self {
            let info = TorrentInfo::new(
                "movie.mp4",
                PIECE,
                vec![("movie.mp4".to_string(), pieces as u64 * PIECE as u64)],
            );
            let engine = MockTorrent::new(info.clone());
            let handle: Arc<dyn EngineTorrent> = engine.clone();
            let storage = MemoryStorage::new(
                engine.info_hash(),
                &info,
                buffers * PIECE as u64,
                Arc::downgrade(&handle),
            );
            storage.initialize();
            Self { engine, storage }
        }

        fn write(&self, piece: u32) -> usize {
            self.storage
                .write(PieceIndex(piece), 0, &vec![piece as u8; PIECE as usize])
        }

        fn reserve(&self, pieces: &[u32]) -> Result<(), StorageError> {
            self.storage.update_reserved_pieces(PieceSet::from_pieces(
                self.storage.piece_count(),
                pieces.iter().copied().map(PieceIndex),
            ))
        }

        fn interest(&self, pieces: &[u32]) {
            self.storage.update_reader_pieces(PieceSet::from_pieces(
                self.storage.piece_count(),
                pieces.iter().copied().map(PieceIndex),
            ));
        }
    }

    #[test]
    fn test_uninitialized_storage_rejects_io() {
        let info = TorrentInfo::new("a", PIECE, vec![("a".to_string(), 4 * PIECE as u64)]);
        let engine = MockTorrent::new(info.clone());
        let handle: Arc<dyn EngineTorrent> = engine.clone();
        let storage = MemoryStorage::new(engine.info_hash(), &info, 4 * PIECE as u64, Arc::downgrade(&handle));

        assert_eq!(storage.write(PieceIndex(0), 0, &[1; 16]), 0);
        let mut out = [0u8; 16];
        assert_eq!(storage.read(PieceIndex(0), 0, &mut out), 0);
    }

    #[test]
    fn test_buffer_count_is_bounded_by_piece_count() {
        let fixture = Fixture::new(3, 10);
        assert_eq!(fixture.storage.buffer_count(), 3);

        let fixture = Fixture::new(10, 4);
        assert_eq!(fixture.storage.buffer_count(), 4);
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let fixture = Fixture::new(8, 4);
        assert_eq!(fixture.storage.write(PieceIndex(2), 100, &[7; 50]), 50);

        let mut out = [0u8; 50];
        assert_eq!(fixture.storage.read(PieceIndex(2), 100, &mut out), 50);
        assert_eq!(out, [7; 50]);
        assert!(!fixture.storage.piece_record(PieceIndex(2)).unwrap().is_completed);
    }

    #[test]
    fn test_read_of_missing_piece_returns_zero() {
        let fixture = Fixture::new(8, 4);
        let mut out = [0u8; 64];
        assert_eq!(fixture.storage.read(PieceIndex(5), 0, &mut out), 0);
    }

    #[test]
    fn test_write_is_clamped_to_piece_length() {
        let fixture = Fixture::new(8, 4);
        assert_eq!(fixture.storage.write(PieceIndex(1), PIECE - 10, &[1; 64]), 10);
        assert_eq!(fixture.storage.write(PieceIndex(1), PIECE, &[1; 64]), 0);
        assert_eq!(fixture.storage.write(PieceIndex(99), 0, &[1; 64]), 0);
    }

    #[test]
    fn test_full_read_marks_piece_read() {
        let fixture = Fixture::new(8, 4);
        fixture.write(3);
        let record = fixture.storage.piece_record(PieceIndex(3)).unwrap();
        assert!(record.is_completed);
        assert!(!record.is_read);

        let mut out = vec![0u8; PIECE as usize];
        fixture.storage.read(PieceIndex(3), 0, &mut out);
        assert!(fixture.storage.piece_record(PieceIndex(3)).unwrap().is_read);
    }

    #[test]
    fn test_full_pool_evicts_least_recent_piece() {
        let fixture = Fixture::new(10, 3);
        for piece in 0..3 {
            fixture.write(piece);
        }
        let mut out = [0u8; 8];
        fixture.storage.read(PieceIndex(0), 0, &mut out);

        fixture.write(3);

        assert_eq!(
            fixture.storage.resident_pieces(),
            vec![PieceIndex(0), PieceIndex(2), PieceIndex(3)]
        );
        assert_eq!(fixture.storage.eviction_count(), 1);
        assert!(fixture.engine.forgotten().contains(&PieceIndex(1)));
        assert_eq!(fixture.engine.piece_priority(PieceIndex(1)), priority::DONT_DOWNLOAD);
    }

    #[test]
    fn test_eviction_prefers_pieces_outside_reader_windows() {
        let fixture = Fixture::new(10, 3);
        for piece in 0..3 {
            fixture.write(piece);
        }
        fixture.interest(&[0, 1]);

        fixture.write(5);

        assert!(!fixture.storage.is_resident(PieceIndex(2)));
        assert!(fixture.storage.is_resident(PieceIndex(0)));
    }

    #[test]
    fn test_reserved_pieces_are_never_evicted() {
        let fixture = Fixture::new(20, 4);
        fixture.reserve(&[0, 19]).unwrap();
        fixture.write(0);
        fixture.write(19);

        for piece in 1..15 {
            assert_eq!(fixture.write(piece), PIECE as usize);
        }

        assert!(fixture.storage.is_resident(PieceIndex(0)));
        assert!(fixture.storage.is_resident(PieceIndex(19)));
        assert_eq!(fixture.storage.used_count(), 2);
    }

    #[test]
    fn test_reserving_resident_pieces_pins_them() {
        let fixture = Fixture::new(20, 3);
        fixture.write(0);
        fixture.write(1);
        fixture.reserve(&[0]).unwrap();

        for piece in 2..10 {
            fixture.write(piece);
        }
        assert!(fixture.storage.is_resident(PieceIndex(0)));

        fixture.reserve(&[]).unwrap();
        fixture.write(10);
        fixture.write(11);
        assert!(!fixture.storage.is_resident(PieceIndex(0)));
    }

    #[test]
    fn test_reserving_every_buffer_is_rejected() {
        let fixture = Fixture::new(10, 2);
        let result = fixture.reserve(&[0, 9]);
        assert!(matches!(
            result,
            Err(StorageError::ReservedExceedsCapacity { reserved: 2, buffers: 2 })
        ));
    }

    #[test]
    fn test_readers_only_refuses_unwanted_pieces() {
        let fixture = Fixture::new(10, 4);
        fixture.storage.set_readers_only(true);
        fixture.interest(&[2]);
        fixture.reserve(&[9]).unwrap();
        fixture.engine.set_piece_priority(PieceIndex(5), priority::TOP);

        assert_eq!(fixture.write(5), 0);
        assert_eq!(fixture.engine.piece_priority(PieceIndex(5)), priority::DONT_DOWNLOAD);
        assert_eq!(fixture.write(2), PIECE as usize);
        assert_eq!(fixture.write(9), PIECE as usize);
    }

    #[test]
    fn test_memory_size_only_grows() {
        let fixture = Fixture::new(10, 2);
        fixture.storage.set_memory_size(6 * PIECE as u64);
        assert_eq!(fixture.storage.buffer_count(), 6);

        fixture.storage.set_memory_size(PIECE as u64);
        assert_eq!(fixture.storage.buffer_count(), 6);
        assert_eq!(fixture.storage.capacity(), 6 * PIECE as u64);
    }

    #[test]
    fn test_growing_keeps_assignments() {
        let fixture = Fixture::new(10, 2);
        fixture.write(4);
        let slot = fixture.storage.buffer_of(PieceIndex(4));

        fixture.storage.set_memory_size(5 * PIECE as u64);

        assert_eq!(fixture.storage.buffer_of(PieceIndex(4)), slot);
        for piece in 5..9 {
            fixture.write(piece);
        }
        assert_eq!(fixture.storage.eviction_count(), 0);
    }

    fn assert_pool_consistent(storage: &MemoryStorage) {
        let pool = storage.pool.lock();
        assert!(pool.used_count() <= pool.buffer_count());

        let mut seen = HashSet::new();
        for piece in 0..storage.piece_count() {
            if let Some(slot) = pool.slot_of(PieceIndex(piece)) {
                assert!(seen.insert(slot), "slot {slot} assigned twice");
                assert_eq!(pool.buffers()[slot].assigned_piece, Some(PieceIndex(piece)));
            }
        }
        for buffer in pool.buffers() {
            assert_eq!(buffer.in_use, buffer.assigned_piece.is_some());
        }
    }

    proptest! {
        #[test]
        fn prop_residency_stays_bounded(writes in prop::collection::vec(0u32..40, 1..200)) {
            let fixture = Fixture::new(40, 8);

            for piece in writes {
                let (resident, full, evictions) = {
                    let pool = fixture.storage.pool.lock();
                    (pool.slot_of(PieceIndex(piece)).is_some(), pool.is_full(), pool.eviction_count())
                };

                prop_assert_eq!(fixture.write(piece), PIECE as usize);

                let expected = if !resident && full { evictions + 1 } else { evictions };
                prop_assert_eq!(fixture.storage.eviction_count(), expected);
                assert_pool_consistent(&fixture.storage);
            }
        }

        #[test]
        fn prop_reserved_pieces_survive(
            writes in prop::collection::vec(2u32..40, 1..200),
            reserve_first in any::<bool>(),
        ) {
            let fixture = Fixture::new(40, 6);
            if reserve_first {
                fixture.reserve(&[0, 1]).unwrap();
                fixture.write(0);
                fixture.write(1);
            } else {
                fixture.write(0);
                fixture.write(1);
                fixture.reserve(&[0, 1]).unwrap();
            }

            for piece in writes {
                fixture.write(piece);
                prop_assert!(fixture.storage.is_resident(PieceIndex(0)));
                prop_assert!(fixture.storage.is_resident(PieceIndex(1)));
                assert_pool_consistent(&fixture.storage);
            }
        }
    }
}
