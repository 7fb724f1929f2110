//! Read-ahead planning across the readers of one torrent.
//!
//! Each scheduling tick walks every reader's window in round-robin order,
//! collecting unique pieces until the read-ahead budget is spent, then assigns
//! them priorities from a geometric decay schedule: the earliest pieces get
//! the highest tier, and each following tier covers a larger group.

use std::collections::HashSet;
use std::time::Duration;

use crate::torrent::PieceIndex;

/// Priority of the first decay group.
pub const PROGRESSION_TOP: u8 = 5;
/// No collected piece is requested below this priority.
pub const PROGRESSION_FLOOR: u8 = 2;
pub const PROGRESSION_START: u32 = 2;
pub const PROGRESSION_RATIO: f64 = 1.7;

/// Deadline added per piece of distance from a reader's cursor.
pub const DEADLINE_STEP: Duration = Duration::from_millis(10);

/// Size of decay group `group` (1-based): `start * ratio^(group - 1)`, truncated.
pub fn progression_result(start: u32, ratio: f64, group: u32) -> i64 {
    (start as f64 * ratio.powi(group as i32 - 1)) as i64
}

/// Endless sequence of priorities following the decay schedule.
#[derive(Debug, Clone)]
pub struct PriorityDecay {
    priority: u8,
    group: u32,
    left: i64,
}

impl PriorityDecay {
    pub fn new() -> Self {
        Self {
            priority: PROGRESSION_TOP,
            group: 1,
            left: progression_result(PROGRESSION_START, PROGRESSION_RATIO, 1),
        }
    }
}

impl Default for PriorityDecay {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for PriorityDecay {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.left <= 0 && self.priority > 1 {
            self.priority -= 1;
            self.group += 1;
            self.left = progression_result(PROGRESSION_START, PROGRESSION_RATIO, self.group);
        }
        self.left -= 1;
        Some(self.priority.max(PROGRESSION_FLOOR))
    }
}

/// Scheduling view of one reader for a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderWindow {
    pub start: PieceIndex,
    /// Last piece the reader will ever need, inclusive
    pub end_limit: PieceIndex,
    pub closing: bool,
}

/// A piece collected for a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedPiece {
    pub piece: PieceIndex,
    /// Distance from the cursor of the reader that contributed the piece
    pub distance: u32,
    pub priority: u8,
}

impl PlannedPiece {
    /// Zero for the piece under a reader's cursor, growing with distance.
    pub fn deadline(&self) -> Duration {
        DEADLINE_STEP * self.distance
    }
}

/// Collects pieces from `windows` round-robin until `budget` is spent.
///
/// Each pass adds at most one piece per reader. A reader is finished once it
/// is closing or its next piece lies past its end limit.
pub fn collect_reader_pieces(windows: &[ReaderWindow], budget: usize) -> Vec<(PieceIndex, u32)> {
    let mut remaining = budget;
    let mut finished = vec![false; windows.len()];
    let mut finished_count = 0;
    let mut seen = HashSet::new();
    let mut pieces = Vec::new();
    let mut distance: u32 = 0;

    while finished_count < windows.len() && remaining > 0 {
        for (slot, window) in windows.iter().enumerate() {
            if finished[slot] {
                continue;
            }
            let index = window.start.as_u32().saturating_add(distance);
            if window.closing || index > window.end_limit.as_u32() {
                finished[slot] = true;
                finished_count += 1;
                continue;
            }
            if !seen.insert(index) {
                continue;
            }

            pieces.push((PieceIndex(index), distance));
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }
        distance += 1;
    }

    pieces
}

/// Collects the tick's pieces and assigns each its decay priority.
pub fn plan_pieces(windows: &[ReaderWindow], budget: usize) -> Vec<PlannedPiece> {
    collect_reader_pieces(windows, budget)
        .into_iter()
        .zip(PriorityDecay::new())
        .map(|((piece, distance), priority)| PlannedPiece {
            piece,
            distance,
            priority,
        })
        .collect()
}
