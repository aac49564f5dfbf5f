//! Shared written/leased view of one file under transfer.
//!
//! Every worker leases its next range through the ledger, so the lease is
//! a single atomic check-and-reserve: a byte offset is needed iff it is
//! neither written nor currently leased, and the written and leased views
//! stay disjoint at all times.

use crate::error::NoRangeToAssign;
use crate::range_set::{ByteRange, RangeSet};
use crate::selection::RangeSelector;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct LedgerState {
    written: RangeSet,
    leased: RangeSet,
}

pub struct ChunkLedger {
    length: u64,
    state: Mutex<LedgerState>,
    selector: Box<dyn RangeSelector>,
}

impl ChunkLedger {
    pub fn new(length: u64, selector: Box<dyn RangeSelector>) -> Self {
        ChunkLedger {
            length,
            state: Mutex::new(LedgerState {
                written: RangeSet::new(),
                leased: RangeSet::new(),
            }),
            selector,
        }
    }

    /// Restores a ledger from previously persisted written ranges, e.g.
    /// when resuming an incomplete file.
    pub fn resume(length: u64, written: RangeSet, selector: Box<dyn RangeSelector>) -> Self {
        ChunkLedger {
            length,
            state: Mutex::new(LedgerState {
                written,
                leased: RangeSet::new(),
            }),
            selector,
        }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Atomically picks and reserves the next range to fetch.
    ///
    /// `available` is the set the source offers (`None` for a full
    /// source); `block_size` is the alignment/size hint passed through to
    /// the selector.
    pub fn lease(
        &self,
        available: Option<&RangeSet>,
        block_size: u64,
    ) -> Result<ByteRange, NoRangeToAssign> {
        let mut state = self.state.lock().unwrap();
        let mut needed = RangeSet::full(self.length);
        needed.subtract(&state.written);
        needed.subtract(&state.leased);
        if needed.is_empty() {
            return Err(NoRangeToAssign);
        }
        let candidate = match available {
            Some(ranges) => ranges.clone(),
            None => RangeSet::full(self.length),
        };
        let picked = self.selector.pick_assignment(&candidate, &needed, block_size)?;
        state.leased.add(picked);
        debug!(range = %picked, "leased range");
        Ok(picked)
    }

    /// Returns a leased range to the needed pool.
    pub fn release(&self, range: ByteRange) {
        let mut state = self.state.lock().unwrap();
        state.leased.remove(&range);
        debug!(range = %range, "released range");
    }

    /// Narrows a lease after the server granted a sub-range of the
    /// request; the clipped-off bytes become needed again.
    pub fn shrink_lease(&self, requested: ByteRange, granted: ByteRange) {
        let mut state = self.state.lock().unwrap();
        if granted.start > requested.start {
            state
                .leased
                .remove(&ByteRange::new(requested.start, granted.start));
        }
        if granted.end < requested.end {
            state
                .leased
                .remove(&ByteRange::new(granted.end, requested.end));
        }
    }

    /// Marks a leased range as written to disk.
    pub fn commit(&self, range: ByteRange) {
        let mut state = self.state.lock().unwrap();
        state.leased.remove(&range);
        debug_assert!(
            !state.written.overlaps(&range),
            "double write of {}",
            range
        );
        state.written.add(range);
    }

    pub fn written_bytes(&self) -> u64 {
        self.state.lock().unwrap().written.total_bytes()
    }

    /// Bytes neither written nor leased.
    pub fn free_bytes(&self) -> u64 {
        let state = self.state.lock().unwrap();
        self.length - state.written.total_bytes() - state.leased.total_bytes()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().unwrap().written.total_bytes() == self.length
    }

    /// Copies of the written and leased views, for progress reporting.
    pub fn snapshot(&self) -> (RangeSet, RangeSet) {
        let state = self.state.lock().unwrap();
        (state.written.clone(), state.leased.clone())
    }

    /// Chunk limit for the next assignment. When less than one block of
    /// free space remains and several workers are active, half the rest is
    /// assigned so late joiners still get a share, bounded below by
    /// `min_split_size`.
    pub fn next_chunk_limit(&self, block_size: u64, active_workers: usize, min_split: u64) -> u64 {
        let free = self.free_bytes();
        if free <= block_size && active_workers > 1 {
            min_split.max(free / 2)
        } else {
            block_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::LinearSelector;

    fn ledger(length: u64) -> ChunkLedger {
        ChunkLedger::new(length, Box::new(LinearSelector))
    }

    #[test]
    fn test_lease_commit_cycle() {
        let ledger = ledger(1000);
        let first = ledger.lease(None, 400).unwrap();
        assert_eq!(first, ByteRange::new(0, 400));
        let second = ledger.lease(None, 400).unwrap();
        assert_eq!(second, ByteRange::new(400, 800));
        ledger.commit(first);
        assert_eq!(ledger.written_bytes(), 400);
        assert_eq!(ledger.free_bytes(), 200);
    }

    #[test]
    fn test_leases_never_overlap() {
        let ledger = ledger(1000);
        let a = ledger.lease(None, 300).unwrap();
        let b = ledger.lease(None, 300).unwrap();
        assert!(a.intersect(&b).is_none());
    }

    #[test]
    fn test_release_makes_range_needed_again() {
        let ledger = ledger(1000);
        let first = ledger.lease(None, 1000).unwrap();
        assert!(ledger.lease(None, 1000).is_err());
        ledger.release(first);
        assert_eq!(ledger.lease(None, 1000).unwrap(), first);
    }

    #[test]
    fn test_shrink_lease_returns_clipped_bytes() {
        let ledger = ledger(1000);
        let requested = ledger.lease(None, 600).unwrap();
        assert_eq!(requested, ByteRange::new(0, 600));
        // Server only granted the middle.
        let granted = ByteRange::new(100, 500);
        ledger.shrink_lease(requested, granted);
        // The clipped head is available to the next lease.
        assert_eq!(ledger.lease(None, 100).unwrap(), ByteRange::new(0, 100));
    }

    #[test]
    fn test_partial_source_limits_leases() {
        let ledger = ledger(1000);
        let mut offered = RangeSet::new();
        offered.add(ByteRange::new(600, 800));
        let picked = ledger.lease(Some(&offered), 1000).unwrap();
        assert_eq!(picked, ByteRange::new(600, 800));
        assert!(ledger.lease(Some(&offered), 1000).is_err());
    }

    #[test]
    fn test_complete_when_all_committed() {
        let ledger = ledger(500);
        let a = ledger.lease(None, 500).unwrap();
        ledger.commit(a);
        assert!(ledger.is_complete());
        assert!(ledger.lease(None, 500).is_err());
    }

    #[test]
    fn test_next_chunk_limit_halves_tail() {
        let ledger = ledger(100_000);
        assert_eq!(ledger.next_chunk_limit(128 * 1024, 3, 16 * 1024), 50_000);
        // A lone worker just takes the block size.
        assert_eq!(ledger.next_chunk_limit(128 * 1024, 1, 16 * 1024), 128 * 1024);
        // Never below the minimum split.
        let small = ledger;
        let lease = small.lease(None, 95_000).unwrap();
        small.commit(lease);
        assert_eq!(small.next_chunk_limit(128 * 1024, 2, 16 * 1024), 16 * 1024);
    }
}
