//! Range selection strategies.
//!
//! Given the bytes a source offers and the bytes the file still needs, a
//! selector picks the next contiguous range to assign to a worker. Results
//! stay inside the offered/needed intersection, never straddle a block
//! boundary, and are at most one block long. A block size of zero disables
//! alignment.
//!
//! Two policies: a linear one that grows the file from the low end (lets
//! previewable media start playing early) and a randomized one that
//! spreads assignments across the file, which keeps rare ranges moving in
//! a swarm of partial sources.

use crate::config::SwarmConfig;
use crate::error::NoRangeToAssign;
use crate::range_set::{ByteRange, RangeSet};
use rand::Rng;

pub trait RangeSelector: Send + Sync {
    /// Picks the next range to assign from `candidate ∩ needed`.
    fn pick_assignment(
        &self,
        candidate: &RangeSet,
        needed: &RangeSet,
        block_size: u64,
    ) -> Result<ByteRange, NoRangeToAssign>;
}

/// First multiple of `block_size` strictly above `start`; the end of the
/// block `start` falls in.
fn block_end(start: u64, block_size: u64) -> u64 {
    (start / block_size + 1) * block_size
}

/// Start of the block that `last` (an inclusive offset) falls in.
fn block_start(last: u64, block_size: u64) -> u64 {
    last - last % block_size
}

/// Prefers extending from the low end of the needed region.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearSelector;

impl RangeSelector for LinearSelector {
    fn pick_assignment(
        &self,
        candidate: &RangeSet,
        needed: &RangeSet,
        block_size: u64,
    ) -> Result<ByteRange, NoRangeToAssign> {
        let usable = candidate.intersection(needed);
        let first = usable.first().ok_or(NoRangeToAssign)?;
        let end = if block_size > 0 {
            first.end.min(block_end(first.start, block_size))
        } else {
            first.end
        };
        Ok(ByteRange::new(first.start, end))
    }
}

/// Picks a uniformly-distributed starting block among needed blocks.
///
/// Once the needed region has fragmented past `max_fragments` pieces, the
/// ideal location snaps to the edge of an existing fragment instead, so
/// contiguous regions grow toward each other and coalesce.
#[derive(Debug, Clone, Copy)]
pub struct RandomSelector {
    max_fragments: usize,
}

impl RandomSelector {
    pub fn new(max_fragments: usize) -> Self {
        RandomSelector { max_fragments }
    }

    fn ideal_location(&self, needed: &RangeSet, block_size: u64) -> u64 {
        let mut rng = rand::thread_rng();
        let fragments = needed.fragment_count();
        if fragments >= self.max_fragments {
            let pick = rng.gen_range(0..=fragments);
            if pick == fragments {
                needed.last().expect("non-empty").end
            } else {
                needed.iter().nth(pick).expect("in range").start
            }
        } else {
            let low = needed.first().expect("non-empty").start;
            let high = needed.last().expect("non-empty").end - 1;
            random_block_location(&mut rng, low, high, block_size)
        }
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        RandomSelector::new(16)
    }
}

/// A block-aligned offset chosen uniformly from the blocks covering
/// `[low, high]`. Falls back to `low` when only one block is in play.
fn random_block_location(rng: &mut impl Rng, low: u64, high: u64, block_size: u64) -> u64 {
    if block_size == 0 {
        return rng.gen_range(low..=high);
    }
    let low_block = low / block_size;
    let high_block = high / block_size;
    if low_block >= high_block {
        // A single (possibly partial) block; no alignment needed.
        low
    } else {
        block_size * rng.gen_range(low_block..=high_block)
    }
}

impl RangeSelector for RandomSelector {
    fn pick_assignment(
        &self,
        candidate: &RangeSet,
        needed: &RangeSet,
        block_size: u64,
    ) -> Result<ByteRange, NoRangeToAssign> {
        let usable = candidate.intersection(needed);
        if usable.is_empty() || needed.is_empty() {
            return Err(NoRangeToAssign);
        }

        let ideal = self.ideal_location(needed, block_size);

        // The assignment is the last usable chunk ending at or before the
        // ideal location, or the first one starting at or after it.
        let mut below: Option<ByteRange> = None;
        let mut above: Option<ByteRange> = None;
        for run in usable.iter() {
            if run.start < ideal {
                below = Some(clip_below(run, ideal, block_size));
            }
            if run.end > ideal {
                above = Some(clip_above(run, ideal, block_size));
                break;
            }
        }

        match (below, above) {
            (Some(range), None) | (None, Some(range)) => Ok(range),
            (Some(lo), Some(hi)) => {
                // Both directions are possible; take either with equal
                // probability.
                if rand::thread_rng().gen::<bool>() {
                    Ok(hi)
                } else {
                    Ok(lo)
                }
            }
            (None, None) => Err(NoRangeToAssign),
        }
    }
}

/// Largest block-bounded sub-range of `run` that starts at or after
/// `ideal`. Precondition: `run.end > ideal`.
fn clip_above(run: ByteRange, ideal: u64, block_size: u64) -> ByteRange {
    let start = run.start.max(ideal);
    let end = if block_size > 0 {
        run.end.min(block_end(start, block_size))
    } else {
        run.end
    };
    ByteRange::new(start, end)
}

/// Largest block-bounded sub-range of `run` that ends at or before
/// `ideal`. Precondition: `run.start < ideal`.
fn clip_below(run: ByteRange, ideal: u64, block_size: u64) -> ByteRange {
    let end = run.end.min(ideal);
    let start = if block_size > 0 {
        run.start.max(block_start(end - 1, block_size))
    } else {
        run.start
    };
    ByteRange::new(start, end)
}

/// Chooses the selection policy for a file by extension classification.
pub fn selector_for(file_name: &str, config: &SwarmConfig) -> Box<dyn RangeSelector> {
    if config.is_previewable(file_name) {
        Box::new(LinearSelector)
    } else {
        Box::new(RandomSelector::new(config.max_fragments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ranges: &[(u64, u64)]) -> RangeSet {
        ranges
            .iter()
            .map(|&(s, e)| ByteRange::new(s, e))
            .collect()
    }

    #[test]
    fn test_linear_takes_lowest_needed_block() {
        let candidate = set(&[(0, 1000)]);
        let needed = set(&[(500, 2000)]);
        let pick = LinearSelector.pick_assignment(&candidate, &needed, 300).unwrap();
        assert_eq!(pick, ByteRange::new(500, 600));
    }

    #[test]
    fn test_linear_without_alignment() {
        let candidate = set(&[(0, 1000)]);
        let needed = set(&[(500, 2000)]);
        let pick = LinearSelector.pick_assignment(&candidate, &needed, 0).unwrap();
        assert_eq!(pick, ByteRange::new(500, 1000));
    }

    #[test]
    fn test_disjoint_inputs_fail_with_empty_condition() {
        let candidate = set(&[(0, 100)]);
        let needed = set(&[(200, 300)]);
        assert_eq!(
            LinearSelector.pick_assignment(&candidate, &needed, 0),
            Err(NoRangeToAssign)
        );
        assert_eq!(
            RandomSelector::default().pick_assignment(&candidate, &needed, 0),
            Err(NoRangeToAssign)
        );
    }

    #[test]
    fn test_random_pick_respects_bounds_and_alignment() {
        let candidate = set(&[(0, 1000)]);
        let needed = set(&[(500, 2000)]);
        let selector = RandomSelector::default();
        for _ in 0..200 {
            let pick = selector.pick_assignment(&candidate, &needed, 300).unwrap();
            assert!(pick.start >= 500 && pick.end <= 1000, "out of bounds: {}", pick);
            assert!(pick.len() <= 300, "too long: {}", pick);
            // Must not straddle a multiple-of-300 boundary.
            assert_eq!(
                pick.start / 300,
                (pick.end - 1) / 300,
                "straddles boundary: {}",
                pick
            );
        }
    }

    #[test]
    fn test_random_pick_on_fragmented_file_stays_usable() {
        // More fragments than the coalescing threshold.
        let runs: Vec<(u64, u64)> = (0..20).map(|i| (i * 1000, i * 1000 + 400)).collect();
        let needed = set(&runs);
        let candidate = set(&[(0, 20_000)]);
        let selector = RandomSelector::new(16);
        for _ in 0..100 {
            let pick = selector.pick_assignment(&candidate, &needed, 512).unwrap();
            assert!(needed.covers(&pick), "picked unneeded bytes: {}", pick);
        }
    }

    #[test]
    fn test_random_pick_entire_small_file() {
        let candidate = set(&[(0, 100)]);
        let needed = set(&[(0, 100)]);
        let pick = RandomSelector::default()
            .pick_assignment(&candidate, &needed, 1 << 17)
            .unwrap();
        assert_eq!(pick, ByteRange::new(0, 100));
    }

    #[test]
    fn test_selector_for_picks_by_extension() {
        let config = SwarmConfig::default();
        let candidate = set(&[(0, 10_000)]);
        let needed = set(&[(0, 10_000)]);
        // Previewable media always starts from the front.
        let pick = selector_for("song.mp3", &config)
            .pick_assignment(&candidate, &needed, 4096)
            .unwrap();
        assert_eq!(pick.start, 0);
    }
}
