//! Buffer slots and per-piece bookkeeping behind `MemoryStorage`.
//!
//! `BufferPool` is plain state without any locking of its own; the memory
//! storage wraps it in a mutex for allocation and eviction. Slot bytes live in
//! separately locked slabs so piece data can be copied without holding the
//! allocation lock. Every slab carries a generation number that changes on
//! eviction, letting a copy detect that its slot was reassigned meanwhile.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::storage::PieceSet;
use crate::torrent::PieceIndex;

/// Bookkeeping for one torrent piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceRecord {
    pub index: PieceIndex,
    pub length: u32,
    pub bytes_written: u32,
    /// Slot holding the piece bytes, `None` while not resident
    pub buffer_slot: Option<usize>,
    pub is_completed: bool,
    /// Read through to the end by at least one reader since completion
    pub is_read: bool,
}

impl PieceRecord {
    fn reset(&mut self) {
        self.bytes_written = 0;
        self.buffer_slot = None;
        self.is_completed = false;
        self.is_read = false;
    }
}

#[derive(Debug)]
pub(crate) struct Slab {
    generation: u64,
    bytes: Box<[u8]>,
}

/// Metadata of one buffer slot.
#[derive(Debug, Clone)]
pub struct PieceBuffer {
    pub slot: usize,
    pub capacity: u32,
    pub assigned_piece: Option<PieceIndex>,
    pub in_use: bool,
    /// Holds a reserved piece and is counted outside the churn budget
    pub pinned: bool,
    /// Access sequence number, larger is more recent
    pub last_accessed: u64,
    generation: u64,
    data: Arc<RwLock<Slab>>,
}

impl PieceBuffer {
    fn new(slot: usize, capacity: u32) -> Self {
        Self {
            slot,
            capacity,
            assigned_piece: None,
            in_use: false,
            pinned: false,
            last_accessed: 0,
            generation: 0,
            data: Arc::new(RwLock::new(Slab {
                generation: 0,
                bytes: vec![0u8; capacity as usize].into_boxed_slice(),
            })),
        }
    }
}

/// Access to one assigned slot, valid until the slot is evicted.
#[derive(Debug, Clone)]
pub struct SlotLease {
    pub slot: usize,
    pub generation: u64,
    data: Arc<RwLock<Slab>>,
}

impl SlotLease {
    /// Copies `data` into the slot at `offset`; false if the slot was reassigned.
    pub(crate) fn write_at(&self, offset: usize, data: &[u8]) -> bool {
        let mut slab = self.data.write();
        if slab.generation != self.generation {
            return false;
        }
        let Some(target) = slab.bytes.get_mut(offset..offset + data.len()) else {
            return false;
        };
        target.copy_from_slice(data);
        true
    }

    /// Copies slot bytes at `offset` into `out`; false if the slot was reassigned.
    pub(crate) fn read_at(&self, offset: usize, out: &mut [u8]) -> bool {
        let slab = self.data.read();
        if slab.generation != self.generation {
            return false;
        }
        let Some(source) = slab.bytes.get(offset..offset + out.len()) else {
            return false;
        };
        out.copy_from_slice(source);
        true
    }
}

/// Slot table and piece records of one memory-backed torrent.
///
/// `used` counts slots holding unreserved pieces; `limit` is the number of
/// slots left for them once pinned slots are taken out. The pool is full when
/// `used >= limit`.
#[derive(Debug)]
pub struct BufferPool {
    piece_length: u32,
    records: Vec<PieceRecord>,
    buffers: Vec<PieceBuffer>,
    used: usize,
    limit: usize,
    clock: u64,
    evictions: u64,
}

impl BufferPool {
    /// Creates `buffer_count` empty slots of `piece_length` bytes.
    pub fn new(piece_length: u32, piece_sizes: &[u32], buffer_count: usize) -> Self {
        let records = piece_sizes
            .iter()
            .enumerate()
            .map(|(index, &length)| PieceRecord {
                index: PieceIndex(index as u32),
                length,
                bytes_written: 0,
                buffer_slot: None,
                is_completed: false,
                is_read: false,
            })
            .collect();

        let buffers = (0..buffer_count)
            .map(|slot| PieceBuffer::new(slot, piece_length))
            .collect();

        Self {
            piece_length,
            records,
            buffers,
            used: 0,
            limit: buffer_count,
            clock: 0,
            evictions: 0,
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn used_count(&self) -> usize {
        self.used
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn pinned_count(&self) -> usize {
        self.buffers.iter().filter(|buffer| buffer.pinned).count()
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions
    }

    pub fn is_full(&self) -> bool {
        self.used >= self.limit
    }

    pub fn record(&self, piece: PieceIndex) -> Option<&PieceRecord> {
        self.records.get(piece.as_usize())
    }

    pub fn buffers(&self) -> &[PieceBuffer] {
        &self.buffers
    }

    pub fn slot_of(&self, piece: PieceIndex) -> Option<usize> {
        self.record(piece).and_then(|record| record.buffer_slot)
    }

    /// Pieces currently holding a slot, in slot order.
    pub fn resident_pieces(&self) -> Vec<PieceIndex> {
        self.buffers
            .iter()
            .filter_map(|buffer| buffer.assigned_piece)
            .collect()
    }

    /// Lease for a resident piece, stamping its access time.
    pub fn lease(&mut self, piece: PieceIndex) -> Option<SlotLease> {
        let slot = self.slot_of(piece)?;
        self.touch(slot);
        Some(self.lease_slot(slot))
    }

    /// Assigns a free slot to `piece`; `None` when every slot is taken.
    ///
    /// A reserved piece pins its slot and lowers `limit` instead of raising `used`.
    pub fn allocate(&mut self, piece: PieceIndex, reserved: bool) -> Option<SlotLease> {
        if let Some(slot) = self.slot_of(piece) {
            return Some(self.lease_slot(slot));
        }
        self.records.get(piece.as_usize())?;

        let slot = self.buffers.iter().position(|buffer| !buffer.in_use)?;
        {
            let buffer = &mut self.buffers[slot];
            buffer.in_use = true;
            buffer.assigned_piece = Some(piece);
            buffer.pinned = reserved;
        }
        self.records[piece.as_usize()].buffer_slot = Some(slot);

        if reserved {
            self.limit -= 1;
        } else {
            self.used += 1;
        }
        self.touch(slot);

        Some(self.lease_slot(slot))
    }

    /// Picks the piece to evict, never `exclude` and never a reserved piece.
    ///
    /// Pieces outside the reader interest set are preferred; among the
    /// candidates of a pass the least recently accessed wins.
    pub fn select_victim(
        &self,
        exclude: PieceIndex,
        interest: &PieceSet,
        reserved: &PieceSet,
    ) -> Option<PieceIndex> {
        self.least_recent(exclude, reserved, Some(interest))
            .or_else(|| self.least_recent(exclude, reserved, None))
    }

    fn least_recent(
        &self,
        exclude: PieceIndex,
        reserved: &PieceSet,
        skip_interest: Option<&PieceSet>,
    ) -> Option<PieceIndex> {
        self.buffers
            .iter()
            .filter(|buffer| buffer.in_use && !buffer.pinned)
            .filter_map(|buffer| buffer.assigned_piece.map(|piece| (piece, buffer.last_accessed)))
            .filter(|(piece, _)| *piece != exclude && !reserved.contains(*piece))
            .filter(|(piece, _)| skip_interest.is_none_or(|interest| !interest.contains(*piece)))
            .min_by_key(|(_, accessed)| *accessed)
            .map(|(piece, _)| piece)
    }

    /// Releases the slot of `piece`; false if it was not resident.
    pub fn evict(&mut self, piece: PieceIndex) -> bool {
        let Some(slot) = self.slot_of(piece) else {
            return false;
        };

        self.records[piece.as_usize()].reset();

        let buffer = &mut self.buffers[slot];
        buffer.generation += 1;
        buffer.data.write().generation = buffer.generation;
        buffer.in_use = false;
        buffer.assigned_piece = None;
        buffer.last_accessed = 0;

        if buffer.pinned {
            buffer.pinned = false;
            self.limit += 1;
        } else {
            self.used -= 1;
        }
        self.evictions += 1;
        true
    }

    /// Accounts `written` bytes copied through `lease`.
    pub fn commit_write(&mut self, piece: PieceIndex, lease: &SlotLease, written: u32) {
        if !self.lease_is_current(piece, lease) {
            return;
        }
        let record = &mut self.records[piece.as_usize()];
        record.bytes_written = (record.bytes_written + written).min(record.length);
        if record.bytes_written >= record.length {
            record.is_completed = true;
        }
        self.touch(lease.slot);
    }

    /// Accounts a read of `read` bytes at `offset` through `lease`.
    pub fn commit_read(&mut self, piece: PieceIndex, lease: &SlotLease, offset: u32, read: u32) {
        if !self.lease_is_current(piece, lease) {
            return;
        }
        let record = &mut self.records[piece.as_usize()];
        if record.is_completed && offset + read >= record.length {
            record.is_read = true;
        }
        self.touch(lease.slot);
    }

    /// Pins slots of resident pieces in `reserved` and unpins the others.
    pub fn repin(&mut self, reserved: &PieceSet) {
        for buffer in self.buffers.iter_mut().filter(|buffer| buffer.in_use) {
            let should_pin = buffer
                .assigned_piece
                .is_some_and(|piece| reserved.contains(piece));

            if should_pin && !buffer.pinned {
                buffer.pinned = true;
                self.used -= 1;
                self.limit -= 1;
            } else if !should_pin && buffer.pinned {
                buffer.pinned = false;
                self.used += 1;
                self.limit += 1;
            }
        }
    }

    /// Appends empty slots up to `buffer_count`; never shrinks.
    pub fn grow(&mut self, buffer_count: usize) {
        let current = self.buffers.len();
        if buffer_count <= current {
            return;
        }
        self.buffers
            .extend((current..buffer_count).map(|slot| PieceBuffer::new(slot, self.piece_length)));
        self.limit += buffer_count - current;
    }

    fn lease_is_current(&self, piece: PieceIndex, lease: &SlotLease) -> bool {
        self.slot_of(piece) == Some(lease.slot)
            && self.buffers[lease.slot].generation == lease.generation
    }

    fn lease_slot(&self, slot: usize) -> SlotLease {
        let buffer = &self.buffers[slot];
        SlotLease {
            slot,
            generation: buffer.generation,
            data: Arc::clone(&buffer.data),
        }
    }

    fn touch(&mut self, slot: usize) {
        self.clock += 1;
        self.buffers[slot].last_accessed = self.clock;
    }
}
