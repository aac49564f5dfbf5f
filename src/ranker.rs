//! Source ranking: which candidate to try next.
//!
//! Two strategies plus a composite. The legacy ranker keeps an unordered
//! pool and scans it with a fixed preference order; the capability ranker
//! orders candidates with a five-key comparator fed by head-ping results.
//! The composite partitions candidates by reachability and consults the
//! legacy side first. A `RankerPolicy` chooses the implementation from
//! local connectivity and transplants the pool when switching.
//!
//! Pool invariants: candidates are unique by source identity; a candidate
//! handed out by `get_best` leaves the pool (at-most-once dispatch) and
//! must be re-added or dropped by the caller.

use crate::range_set::RangeSet;
use crate::source::{SourceCandidate, SourceDescriptor, SourceId};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Externally supplied pool filter, re-evaluated on every `get_best`
/// call; a candidate it rejects is never returned.
pub type ValidityFilter = Arc<dyn Fn(&SourceCandidate) -> bool + Send + Sync>;

/// Callback into the download mesh so a ranker can report sources it
/// learned are good or dead.
pub trait MeshHandler: Send + Sync {
    fn report_source(&self, descriptor: &SourceDescriptor, good: bool);
}

/// Head-pong payload distilled to what ranking needs.
#[derive(Debug, Clone)]
pub struct PongUpdate {
    pub has_file: bool,
    pub busy: bool,
    pub queue_status: i32,
    pub available_ranges: Option<RangeSet>,
    pub received_at: Instant,
}

/// Busy backoff applied when a pong reports the host busy; pings are
/// cheap, so retry soon.
const PONG_BUSY_RETRY_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankerKind {
    Legacy,
    CapabilityOrdered,
    Composite,
}

pub trait SourceRanker: Send {
    fn kind(&self) -> RankerKind;

    /// Adds one candidate; false when the source identity is already
    /// known.
    fn add_to_pool(&mut self, candidate: Arc<SourceCandidate>) -> bool;

    /// Bulk add; true iff any candidate was new.
    fn add_all_to_pool(&mut self, candidates: Vec<Arc<SourceCandidate>>) -> bool {
        let mut any = false;
        for candidate in candidates {
            any |= self.add_to_pool(candidate);
        }
        any
    }

    /// Removes and returns the best candidate, or `None` when the pool is
    /// empty or the validity filter rejects everything in it.
    fn get_best(&mut self) -> Option<Arc<SourceCandidate>>;

    /// True iff the pool is non-empty, busy or not.
    fn has_more(&self) -> bool;

    /// True iff some candidate is filter-valid and not busy right now.
    fn has_usable_hosts(&self) -> bool;

    /// Milliseconds until the soonest filter-valid busy candidate becomes
    /// usable; 0 when the pool is empty or something is usable now.
    fn calculate_wait_time(&self) -> u64;

    /// Releases candidates, filter and mesh handler. Idempotent.
    fn stop(&mut self);

    fn set_validity_filter(&mut self, filter: Option<ValidityFilter>);
    fn validity_filter(&self) -> Option<ValidityFilter>;

    fn set_mesh_handler(&mut self, mesh: Option<Arc<dyn MeshHandler>>);
    fn mesh_handler(&self) -> Option<Arc<dyn MeshHandler>>;

    /// Snapshot of every pooled candidate, for alternate-location gossip.
    fn shareable_sources(&self) -> Vec<Arc<SourceCandidate>>;

    /// Empties the pool, returning the candidates (used when the policy
    /// swaps implementations).
    fn drain(&mut self) -> Vec<Arc<SourceCandidate>>;

    /// Feeds a head-pong back into ranking. Default: ignored.
    fn pong_received(&mut self, _id: &SourceId, _update: PongUpdate) {}
}

fn accepts(filter: &Option<ValidityFilter>, candidate: &SourceCandidate) -> bool {
    match filter {
        Some(f) => f(candidate),
        None => true,
    }
}

/// Shared across strategies: is any filter-valid candidate non-busy?
fn usable_hosts_exist<'a>(
    candidates: impl Iterator<Item = &'a Arc<SourceCandidate>>,
    filter: &Option<ValidityFilter>,
    now: Instant,
) -> bool {
    let mut iter = candidates.filter(|c| accepts(filter, c));
    iter.any(|c| !c.is_busy_at(now))
}

/// Shared across strategies: minimum remaining busy time over
/// filter-valid busy candidates, rounded up to whole seconds, in
/// milliseconds. Zero when nothing is busy.
fn wait_time_ms<'a>(
    candidates: impl Iterator<Item = &'a Arc<SourceCandidate>>,
    filter: &Option<ValidityFilter>,
    now: Instant,
) -> u64 {
    let mut min_wait: Option<u128> = None;
    for candidate in candidates.filter(|c| accepts(filter, c)) {
        let wait = candidate.wait_time_at(now).as_millis();
        if wait == 0 {
            return 0;
        }
        min_wait = Some(match min_wait {
            Some(existing) => existing.min(wait),
            None => wait,
        });
    }
    match min_wait {
        Some(ms) => (((ms + 999) / 1000) * 1000) as u64,
        None => 0,
    }
}

/// Total preference of the legacy strategy. `Less` means `a` is tried
/// first: non-busy beats busy, then a verifiable content hash, then
/// quality, then declared speed. The final tie (everything equal) falls
/// to the candidate encountered first in the scan, which makes the
/// outcome deterministic for a given insertion order.
fn legacy_order(a: &SourceCandidate, b: &SourceCandidate, now: Instant) -> Ordering {
    a.is_busy_at(now)
        .cmp(&b.is_busy_at(now))
        .then_with(|| {
            b.descriptor()
                .has_verifiable_identity()
                .cmp(&a.descriptor().has_verifiable_identity())
        })
        .then_with(|| b.descriptor().quality.cmp(&a.descriptor().quality))
        .then_with(|| b.descriptor().speed.cmp(&a.descriptor().speed))
}

/// The five-key capability comparator, strict priority order:
/// multicast replies, queue position, push-only reachability, partial
/// content, round-trip time. Ties past that fall to the source identity
/// so any pair orders deterministically.
pub fn capability_order(a: &SourceCandidate, b: &SourceCandidate) -> Ordering {
    // 1. Candidates that answered a multicast query come first.
    b.descriptor()
        .replied_to_multicast
        .cmp(&a.descriptor().replied_to_multicast)
        // 2. Lower queue position; negative (free slot) beats any queue.
        .then_with(|| a.queue_status().cmp(&b.queue_status()))
        // 3. Push-only sources are preferred: direct slots are scarce,
        //    spend them on hosts that cannot push.
        .then_with(|| {
            b.descriptor()
                .address
                .is_push()
                .cmp(&a.descriptor().address.is_push())
        })
        // 4. Partial sources before full ones, same load-balancing logic.
        .then_with(|| b.is_partial_source().cmp(&a.is_partial_source()))
        // 5. Lower measured round-trip; unmeasured sorts last.
        .then_with(|| match (a.round_trip_time(), b.round_trip_time()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id().cmp(b.id()))
}

/// Unordered pool scanned with `legacy_order`.
pub struct LegacyRanker {
    pool: Vec<Arc<SourceCandidate>>,
    filter: Option<ValidityFilter>,
    mesh: Option<Arc<dyn MeshHandler>>,
}

impl LegacyRanker {
    pub fn new() -> Self {
        LegacyRanker {
            pool: Vec::new(),
            filter: None,
            mesh: None,
        }
    }

    fn knows(&self, id: &SourceId) -> bool {
        self.pool.iter().any(|c| c.id() == id)
    }
}

impl Default for LegacyRanker {
    fn default() -> Self {
        LegacyRanker::new()
    }
}

impl SourceRanker for LegacyRanker {
    fn kind(&self) -> RankerKind {
        RankerKind::Legacy
    }

    fn add_to_pool(&mut self, candidate: Arc<SourceCandidate>) -> bool {
        if self.knows(candidate.id()) {
            return false;
        }
        debug!(source = %candidate, "legacy ranker: new candidate");
        self.pool.push(candidate);
        true
    }

    fn get_best(&mut self) -> Option<Arc<SourceCandidate>> {
        let now = Instant::now();
        let mut best: Option<usize> = None;
        for (i, candidate) in self.pool.iter().enumerate() {
            if !accepts(&self.filter, candidate) {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(j) => {
                    // Strict comparison, so the earlier candidate keeps
                    // exact ties.
                    if legacy_order(candidate, &self.pool[j], now) == Ordering::Less {
                        best = Some(i);
                    }
                }
            }
        }
        best.map(|i| self.pool.remove(i))
    }

    fn has_more(&self) -> bool {
        !self.pool.is_empty()
    }

    fn has_usable_hosts(&self) -> bool {
        usable_hosts_exist(self.pool.iter(), &self.filter, Instant::now())
    }

    fn calculate_wait_time(&self) -> u64 {
        if !self.has_more() {
            return 0;
        }
        wait_time_ms(self.pool.iter(), &self.filter, Instant::now())
    }

    fn stop(&mut self) {
        self.pool.clear();
        self.filter = None;
        self.mesh = None;
    }

    fn set_validity_filter(&mut self, filter: Option<ValidityFilter>) {
        self.filter = filter;
    }

    fn validity_filter(&self) -> Option<ValidityFilter> {
        self.filter.clone()
    }

    fn set_mesh_handler(&mut self, mesh: Option<Arc<dyn MeshHandler>>) {
        self.mesh = mesh;
    }

    fn mesh_handler(&self) -> Option<Arc<dyn MeshHandler>> {
        self.mesh.clone()
    }

    fn shareable_sources(&self) -> Vec<Arc<SourceCandidate>> {
        self.pool.clone()
    }

    fn drain(&mut self) -> Vec<Arc<SourceCandidate>> {
        std::mem::take(&mut self.pool)
    }
}

/// Pool kept in capability order; head-pongs move candidates between
/// ranked and verified standing and feed the comparator's queue and
/// round-trip keys.
pub struct CapabilityRanker {
    pool: Vec<Arc<SourceCandidate>>,
    filter: Option<ValidityFilter>,
    mesh: Option<Arc<dyn MeshHandler>>,
}

impl CapabilityRanker {
    pub fn new() -> Self {
        CapabilityRanker {
            pool: Vec::new(),
            filter: None,
            mesh: None,
        }
    }

    fn knows(&self, id: &SourceId) -> bool {
        self.pool.iter().any(|c| c.id() == id)
    }
}

impl Default for CapabilityRanker {
    fn default() -> Self {
        CapabilityRanker::new()
    }
}

impl SourceRanker for CapabilityRanker {
    fn kind(&self) -> RankerKind {
        RankerKind::CapabilityOrdered
    }

    fn add_to_pool(&mut self, candidate: Arc<SourceCandidate>) -> bool {
        if self.knows(candidate.id()) {
            return false;
        }
        debug!(source = %candidate, "capability ranker: new candidate");
        self.pool.push(candidate);
        true
    }

    /// Bulk adds rank gossip-learned locations after direct query
    /// replies, so the hosts that actually answered get tried first.
    fn add_all_to_pool(&mut self, mut candidates: Vec<Arc<SourceCandidate>>) -> bool {
        candidates.sort_by_key(|c| c.descriptor().from_alternate_location);
        let mut any = false;
        for candidate in candidates {
            any |= self.add_to_pool(candidate);
        }
        any
    }

    fn get_best(&mut self) -> Option<Arc<SourceCandidate>> {
        let now = Instant::now();
        let mut best: Option<usize> = None;
        for (i, candidate) in self.pool.iter().enumerate() {
            if !accepts(&self.filter, candidate) {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(j) => {
                    let current = &self.pool[j];
                    // Busy candidates lose to usable ones outright; the
                    // five-key order only decides among equals.
                    let preferred = match (
                        candidate.is_busy_at(now),
                        current.is_busy_at(now),
                    ) {
                        (false, true) => true,
                        (true, false) => false,
                        _ => capability_order(candidate, current) == Ordering::Less,
                    };
                    if preferred {
                        best = Some(i);
                    }
                }
            }
        }
        best.map(|i| self.pool.remove(i))
    }

    fn has_more(&self) -> bool {
        !self.pool.is_empty()
    }

    fn has_usable_hosts(&self) -> bool {
        usable_hosts_exist(self.pool.iter(), &self.filter, Instant::now())
    }

    fn calculate_wait_time(&self) -> u64 {
        if !self.has_more() {
            return 0;
        }
        wait_time_ms(self.pool.iter(), &self.filter, Instant::now())
    }

    fn stop(&mut self) {
        self.pool.clear();
        self.filter = None;
        self.mesh = None;
    }

    fn set_validity_filter(&mut self, filter: Option<ValidityFilter>) {
        self.filter = filter;
    }

    fn validity_filter(&self) -> Option<ValidityFilter> {
        self.filter.clone()
    }

    fn set_mesh_handler(&mut self, mesh: Option<Arc<dyn MeshHandler>>) {
        self.mesh = mesh;
    }

    fn mesh_handler(&self) -> Option<Arc<dyn MeshHandler>> {
        self.mesh.clone()
    }

    fn shareable_sources(&self) -> Vec<Arc<SourceCandidate>> {
        self.pool.clone()
    }

    fn drain(&mut self) -> Vec<Arc<SourceCandidate>> {
        std::mem::take(&mut self.pool)
    }

    fn pong_received(&mut self, id: &SourceId, update: PongUpdate) {
        let Some(index) = self.pool.iter().position(|c| c.id() == id) else {
            return;
        };
        if !update.has_file {
            // The host no longer has the file; tell the mesh and drop it.
            let gone = self.pool.remove(index);
            debug!(source = %gone, "pong reports file gone");
            if let Some(mesh) = &self.mesh {
                mesh.report_source(gone.descriptor(), false);
            }
            return;
        }
        let candidate = &self.pool[index];
        candidate.record_pong(update.received_at);
        candidate.set_queue_status(update.queue_status);
        candidate.set_available_ranges(update.available_ranges);
        if update.busy {
            candidate.set_retry_after(PONG_BUSY_RETRY_SECS);
        }
    }
}

/// Partitions candidates by reachability: anything we could connect or
/// push to goes to the capability side, the rest to the legacy side.
/// `get_best` prefers the legacy side's pick when it has one.
pub struct CompositeRanker {
    legacy: LegacyRanker,
    capability: CapabilityRanker,
}

impl CompositeRanker {
    pub fn new() -> Self {
        CompositeRanker {
            legacy: LegacyRanker::new(),
            capability: CapabilityRanker::new(),
        }
    }

    fn routes_to_capability(candidate: &SourceCandidate) -> bool {
        match &candidate.descriptor().address {
            crate::source::SourceAddress::Direct { .. } => true,
            crate::source::SourceAddress::Push { proxies, .. } => !proxies.is_empty(),
        }
    }
}

impl Default for CompositeRanker {
    fn default() -> Self {
        CompositeRanker::new()
    }
}

impl SourceRanker for CompositeRanker {
    fn kind(&self) -> RankerKind {
        RankerKind::Composite
    }

    fn add_to_pool(&mut self, candidate: Arc<SourceCandidate>) -> bool {
        if Self::routes_to_capability(&candidate) {
            self.capability.add_to_pool(candidate)
        } else {
            self.legacy.add_to_pool(candidate)
        }
    }

    fn get_best(&mut self) -> Option<Arc<SourceCandidate>> {
        self.legacy.get_best().or_else(|| self.capability.get_best())
    }

    fn has_more(&self) -> bool {
        self.legacy.has_more() || self.capability.has_more()
    }

    fn has_usable_hosts(&self) -> bool {
        self.legacy.has_usable_hosts() || self.capability.has_usable_hosts()
    }

    fn calculate_wait_time(&self) -> u64 {
        if !self.has_more() {
            return 0;
        }
        let a = self.legacy.calculate_wait_time();
        let b = self.capability.calculate_wait_time();
        match (a, b) {
            (0, other) if !self.legacy.has_more() => other,
            (other, 0) if !self.capability.has_more() => other,
            (0, _) | (_, 0) => 0,
            (x, y) => x.min(y),
        }
    }

    fn stop(&mut self) {
        self.legacy.stop();
        self.capability.stop();
    }

    fn set_validity_filter(&mut self, filter: Option<ValidityFilter>) {
        self.legacy.set_validity_filter(filter.clone());
        self.capability.set_validity_filter(filter);
    }

    fn validity_filter(&self) -> Option<ValidityFilter> {
        self.capability
            .validity_filter()
            .or_else(|| self.legacy.validity_filter())
    }

    fn set_mesh_handler(&mut self, mesh: Option<Arc<dyn MeshHandler>>) {
        self.legacy.set_mesh_handler(mesh.clone());
        self.capability.set_mesh_handler(mesh);
    }

    fn mesh_handler(&self) -> Option<Arc<dyn MeshHandler>> {
        self.capability
            .mesh_handler()
            .or_else(|| self.legacy.mesh_handler())
    }

    fn shareable_sources(&self) -> Vec<Arc<SourceCandidate>> {
        let mut all = self.legacy.shareable_sources();
        all.extend(self.capability.shareable_sources());
        all
    }

    fn drain(&mut self) -> Vec<Arc<SourceCandidate>> {
        let mut all = self.legacy.drain();
        all.extend(self.capability.drain());
        all
    }

    fn pong_received(&mut self, id: &SourceId, update: PongUpdate) {
        self.capability.pong_received(id, update);
    }
}

/// Chooses the ranker implementation from local connectivity, carrying
/// the pool, filter and mesh handler over when the implementation
/// changes.
#[derive(Debug, Clone, Copy)]
pub struct RankerPolicy {
    /// Whether capability ranking is enabled at all.
    pub capability_ranking: bool,
    /// Whether the local peer can receive unsolicited connections.
    pub can_receive_unsolicited: bool,
}

impl RankerPolicy {
    fn desired_kind(&self) -> RankerKind {
        if !self.capability_ranking {
            RankerKind::Legacy
        } else if self.can_receive_unsolicited {
            RankerKind::Composite
        } else {
            RankerKind::CapabilityOrdered
        }
    }

    fn build(kind: RankerKind) -> Box<dyn SourceRanker> {
        match kind {
            RankerKind::Legacy => Box::new(LegacyRanker::new()),
            RankerKind::CapabilityOrdered => Box::new(CapabilityRanker::new()),
            RankerKind::Composite => Box::new(CompositeRanker::new()),
        }
    }

    /// Returns the ranker to use, reusing `current` when it already has
    /// the right shape and otherwise transplanting its state into a fresh
    /// one and stopping it.
    pub fn select(&self, current: Option<Box<dyn SourceRanker>>) -> Box<dyn SourceRanker> {
        let desired = self.desired_kind();
        match current {
            Some(ranker) if ranker.kind() == desired => ranker,
            Some(mut old) => {
                let mut fresh = Self::build(desired);
                fresh.set_validity_filter(old.validity_filter());
                fresh.set_mesh_handler(old.mesh_handler());
                fresh.add_all_to_pool(old.drain());
                old.stop();
                fresh
            }
            None => Self::build(desired),
        }
    }
}
