//! Worker-pool coordination.
//!
//! `DownloadHost` is the contract a worker calls back into. The provided
//! `SwarmCoordinator` implements it on top of a `WorkerPool` (active and
//! queued bookkeeping with queued-slot replacement), the source ranker
//! and the push rendezvous, and exposes the aggregate outcome: the only
//! user-visible failure is "busy, retry later" or "all sources
//! exhausted" once no worker is active and the ranker has nothing usable.

use crate::config::SwarmConfig;
use crate::events::{EventBus, SwarmEvent, WorkerId};
use crate::ledger::ChunkLedger;
use crate::pieces::{self, PiecesInfo};
use crate::push::{PushRendezvous, PushSignal};
use crate::range_set::{ByteRange, RangeSet};
use crate::ranker::{RankerPolicy, SourceRanker};
use crate::source::{PeerGuid, SourceCandidate, SourceDescriptor, SourceId};
use crate::transport::{ChunkSink, SourceTransport};
use crate::worker::DownloadWorker;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Callbacks the core requires from its host at worker lifecycle points.
pub trait DownloadHost: Send + Sync + 'static {
    fn worker_started(&self, id: WorkerId);
    fn worker_failed(&self, id: WorkerId);
    fn worker_finished(&self, id: WorkerId);

    /// Returns a candidate to the ranking pool for a later retry.
    fn add_to_ranker(&self, candidate: Arc<SourceCandidate>);

    /// Routes source health to mesh-sharing and alternate-location
    /// gossip: `good` sources are advertised, bad ones retired.
    fn report_source(&self, descriptor: &SourceDescriptor, good: bool);

    /// Disk-verified bytes, for gossip and progress.
    fn report_range_verified(&self, range: ByteRange);

    /// Bytes that failed verification.
    fn report_range_invalid(&self, range: ByteRange);

    /// Decides whether a worker that was told it is queued (or has just
    /// connected) may stay, possibly interrupting a worse-placed queued
    /// worker to make room. False means the worker should bow out.
    fn kill_queued_if_necessary(&self, id: WorkerId, queue_pos: i32) -> bool;

    /// Drops the worker from the queued set after a non-queued response.
    fn remove_queued(&self, id: WorkerId);

    fn active_worker_count(&self) -> usize;

    /// Forces every active worker to stop; the download is beyond repair.
    fn cancel_corrupt_download(&self);

    fn is_stopped(&self) -> bool;
}

/// Active/queued worker bookkeeping plus the queued-slot replacement
/// rule.
pub struct WorkerPool {
    swarm_capacity: usize,
    interrupt_flags: HashMap<WorkerId, Arc<AtomicBool>>,
    active: HashSet<WorkerId>,
    queued: HashMap<WorkerId, i32>,
}

impl WorkerPool {
    pub fn new(swarm_capacity: usize) -> Self {
        WorkerPool {
            swarm_capacity,
            interrupt_flags: HashMap::new(),
            active: HashSet::new(),
            queued: HashMap::new(),
        }
    }

    pub fn register(&mut self, id: WorkerId, interrupt: Arc<AtomicBool>) {
        self.interrupt_flags.insert(id, interrupt);
    }

    pub fn remove(&mut self, id: WorkerId) {
        self.interrupt_flags.remove(&id);
        self.active.remove(&id);
        self.queued.remove(&id);
    }

    pub fn mark_active(&mut self, id: WorkerId) {
        self.active.insert(id);
    }

    pub fn remove_queued(&mut self, id: WorkerId) {
        self.queued.remove(&id);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Workers that exist in any state.
    pub fn total_count(&self) -> usize {
        self.interrupt_flags.len()
    }

    pub fn queue_position(&self, id: WorkerId) -> Option<i32> {
        self.queued.get(&id).copied()
    }

    pub fn active_workers(&self) -> Vec<WorkerId> {
        self.active.iter().copied().collect()
    }

    pub fn queued_workers(&self) -> Vec<(WorkerId, i32)> {
        self.queued.iter().map(|(&id, &pos)| (id, pos)).collect()
    }

    pub fn interrupt_all(&mut self) {
        for flag in self.interrupt_flags.values() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// The queued-replacement decision: keep a connected worker when a
    /// slot is free; update a worker already queued; otherwise interrupt
    /// the queued worker with the strictly worst position, and refuse the
    /// newcomer if nobody is worse.
    pub fn kill_queued_if_necessary(&mut self, id: WorkerId, queue_pos: i32) -> bool {
        let downloaders = self.active.len() + self.queued.len();

        if downloaders <= self.swarm_capacity && queue_pos == -1 {
            return true;
        }

        if self.queued.contains_key(&id) && queue_pos > -1 {
            self.queued.insert(id, queue_pos);
            return true;
        }

        if downloaders >= self.swarm_capacity {
            let mut doomed: Option<(WorkerId, i32)> = None;
            for (&other, &pos) in &self.queued {
                if other == id {
                    continue;
                }
                if pos > queue_pos && doomed.map_or(true, |(_, worst)| pos > worst) {
                    doomed = Some((other, pos));
                }
            }
            match doomed {
                Some((victim, pos)) => {
                    debug!(victim, position = pos, "replacing queued worker");
                    if let Some(flag) = self.interrupt_flags.get(&victim) {
                        flag.store(true, Ordering::SeqCst);
                    }
                    self.queued.remove(&victim);
                }
                None => return false,
            }
        }

        if queue_pos > -1 {
            self.active.remove(&id);
            self.queued.insert(id, queue_pos);
        }
        true
    }
}

/// Aggregate download standing, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmStatus {
    Complete,
    Downloading,
    /// Every known source is backing off; retry after the wait.
    Busy { wait_ms: u64 },
    /// No usable source remains and nothing is running.
    Exhausted,
    Stopped,
}

/// Outcome of asking the coordinator to start one more worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnDecision {
    Started(WorkerId),
    AtCapacity,
    Busy { wait_ms: u64 },
    Exhausted,
    Complete,
    Stopped,
}

pub struct SwarmCoordinator<T: SourceTransport> {
    config: Arc<SwarmConfig>,
    transport: Arc<T>,
    sink: Arc<dyn ChunkSink>,
    ledger: Arc<ChunkLedger>,
    rendezvous: Arc<PushRendezvous<T::Conn>>,
    ranker: Mutex<Box<dyn SourceRanker>>,
    pool: Mutex<WorkerPool>,
    /// Sources currently held by a worker; the ranker's validity filter
    /// rejects them so one source is never dispatched twice at once.
    dispatched: Arc<Mutex<HashSet<SourceId>>>,
    events: EventBus,
    stopped: AtomicBool,
    next_worker_id: AtomicU64,
    /// Handle back to ourselves so spawned workers can hold the host.
    self_ref: Weak<SwarmCoordinator<T>>,
}

impl<T: SourceTransport> SwarmCoordinator<T> {
    pub fn new(
        config: SwarmConfig,
        transport: Arc<T>,
        sink: Arc<dyn ChunkSink>,
        ledger: Arc<ChunkLedger>,
        can_receive_unsolicited: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SwarmEvent>) {
        let policy = RankerPolicy {
            capability_ranking: config.capability_ranking,
            can_receive_unsolicited,
        };
        let mut ranker = policy.select(None);
        let dispatched = Arc::new(Mutex::new(HashSet::new()));
        let filter_view = Arc::clone(&dispatched);
        ranker.set_validity_filter(Some(Arc::new(move |candidate: &SourceCandidate| {
            !filter_view.lock().unwrap().contains(candidate.id())
        })));
        let (events, event_rx) = EventBus::new();
        let coordinator = Arc::new_cyclic(|weak| SwarmCoordinator {
            pool: Mutex::new(WorkerPool::new(config.swarm_capacity)),
            config: Arc::new(config),
            transport,
            sink,
            ledger,
            rendezvous: Arc::new(PushRendezvous::new()),
            ranker: Mutex::new(ranker),
            dispatched,
            events,
            stopped: AtomicBool::new(false),
            next_worker_id: AtomicU64::new(1),
            self_ref: weak.clone(),
        });
        (coordinator, event_rx)
    }

    pub fn ledger(&self) -> &Arc<ChunkLedger> {
        &self.ledger
    }

    pub fn rendezvous(&self) -> &Arc<PushRendezvous<T::Conn>> {
        &self.rendezvous
    }

    /// Snapshot of the active worker ids.
    pub fn active_workers(&self) -> Vec<WorkerId> {
        self.pool.lock().unwrap().active_workers()
    }

    /// Snapshot of the queued workers and their remote queue positions.
    pub fn queued_workers(&self) -> Vec<(WorkerId, i32)> {
        self.pool.lock().unwrap().queued_workers()
    }

    /// Adds a newly learned source. False when it was already known.
    pub fn add_source(&self, descriptor: SourceDescriptor) -> bool {
        let candidate = Arc::new(SourceCandidate::new(descriptor));
        let id = candidate.id().clone();
        let added = self.ranker.lock().unwrap().add_to_pool(candidate);
        if added {
            self.events.emit(SwarmEvent::SourceAdded {
                source_id: id.0.clone(),
            });
        }
        added
    }

    /// Bulk add; true iff any source was new.
    pub fn add_sources(&self, descriptors: Vec<SourceDescriptor>) -> bool {
        let candidates: Vec<_> = descriptors
            .into_iter()
            .map(|d| Arc::new(SourceCandidate::new(d)))
            .collect();
        self.ranker.lock().unwrap().add_all_to_pool(candidates)
    }

    /// Spawns a worker for the best ranked candidate, or reports why it
    /// cannot.
    pub fn spawn_next_worker(&self) -> SpawnDecision {
        if self.stopped.load(Ordering::SeqCst) {
            return SpawnDecision::Stopped;
        }
        let Some(host) = self.self_ref.upgrade() else {
            return SpawnDecision::Stopped;
        };
        if self.ledger.is_complete() {
            self.events.emit(SwarmEvent::DownloadComplete);
            return SpawnDecision::Complete;
        }

        let mut ranker = self.ranker.lock().unwrap();
        {
            let pool = self.pool.lock().unwrap();
            let non_queued = pool.total_count() - pool.queued_count();
            if self.ledger.free_bytes() == 0 || non_queued >= self.config.swarm_capacity {
                return SpawnDecision::AtCapacity;
            }
        }

        match ranker.get_best() {
            Some(candidate) if candidate.is_busy() => {
                // Best of the pool is still backing off, so everything is.
                ranker.add_to_pool(candidate);
                SpawnDecision::Busy {
                    wait_ms: ranker.calculate_wait_time(),
                }
            }
            Some(candidate) => {
                let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
                self.dispatched
                    .lock()
                    .unwrap()
                    .insert(candidate.id().clone());
                let interrupt = Arc::new(AtomicBool::new(false));
                self.pool
                    .lock()
                    .unwrap()
                    .register(id, Arc::clone(&interrupt));
                info!(worker = id, source = %candidate, "starting worker");
                let worker = DownloadWorker::new(
                    id,
                    candidate,
                    Arc::clone(&self.transport),
                    host,
                    Arc::clone(&self.sink),
                    Arc::clone(&self.ledger),
                    Arc::clone(&self.rendezvous),
                    Arc::clone(&self.config),
                    interrupt,
                );
                tokio::spawn(worker.run());
                SpawnDecision::Started(id)
            }
            None => {
                let pool = self.pool.lock().unwrap();
                if pool.total_count() > 0 {
                    return SpawnDecision::AtCapacity;
                }
                if !ranker.has_more() {
                    self.events
                        .emit(SwarmEvent::SourcesExhausted { busy_wait_ms: 0 });
                    return SpawnDecision::Exhausted;
                }
                let wait_ms = ranker.calculate_wait_time();
                if wait_ms > 0 {
                    SpawnDecision::Busy { wait_ms }
                } else {
                    self.events
                        .emit(SwarmEvent::SourcesExhausted { busy_wait_ms: 0 });
                    SpawnDecision::Exhausted
                }
            }
        }
    }

    /// Routes an inbound pushed connection to the waiter that asked for
    /// it. False when nobody was waiting (the caller closes the socket).
    pub fn accept_push(&self, guid: &PeerGuid, inbound_addr: &str, conn: T::Conn) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        match self.rendezvous.match_best(guid, inbound_addr) {
            Some(observer) => observer.send(PushSignal::Connected(conn)).is_ok(),
            None => false,
        }
    }

    /// Feeds a head-pong into the ranker (see `SourceRanker::pong_received`).
    pub fn pong_received(&self, id: &SourceId, update: crate::ranker::PongUpdate) {
        self.ranker.lock().unwrap().pong_received(id, update);
    }

    pub fn status(&self) -> SwarmStatus {
        if self.stopped.load(Ordering::SeqCst) {
            return SwarmStatus::Stopped;
        }
        if self.ledger.is_complete() {
            return SwarmStatus::Complete;
        }
        let workers = self.pool.lock().unwrap().total_count();
        if workers > 0 {
            return SwarmStatus::Downloading;
        }
        let ranker = self.ranker.lock().unwrap();
        if ranker.has_usable_hosts() {
            return SwarmStatus::Downloading;
        }
        let wait_ms = ranker.calculate_wait_time();
        if wait_ms > 0 {
            SwarmStatus::Busy { wait_ms }
        } else {
            SwarmStatus::Exhausted
        }
    }

    /// Piece classification across the written, leased and known
    /// available views.
    pub fn pieces_info(&self, piece_size: u64) -> PiecesInfo {
        let (written, leased) = self.ledger.snapshot();
        let mut available = RangeSet::new();
        for candidate in self.ranker.lock().unwrap().shareable_sources() {
            match candidate.available_ranges() {
                Some(ranges) => {
                    for run in ranges.iter() {
                        available.add(run);
                    }
                }
                None => {
                    available = RangeSet::full(self.ledger.length());
                    break;
                }
            }
        }
        pieces::classify(&written, &leased, &available, piece_size, self.ledger.length())
    }

    /// Stops everything: workers are interrupted, push waiters released,
    /// the ranker cleared. Safe to call more than once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping swarm coordinator");
        self.pool.lock().unwrap().interrupt_all();
        for observer in self.rendezvous.drain_all() {
            let _ = observer.send(PushSignal::Shutdown);
        }
        self.ranker.lock().unwrap().stop();
    }
}

impl<T: SourceTransport> DownloadHost for SwarmCoordinator<T> {
    fn worker_started(&self, id: WorkerId) {
        self.pool.lock().unwrap().mark_active(id);
        self.events.emit(SwarmEvent::WorkerStarted { worker_id: id });
    }

    fn worker_failed(&self, id: WorkerId) {
        self.events.emit(SwarmEvent::WorkerFailed { worker_id: id });
    }

    fn worker_finished(&self, id: WorkerId) {
        self.pool.lock().unwrap().remove(id);
        self.events.emit(SwarmEvent::WorkerFinished { worker_id: id });
        if self.ledger.is_complete() {
            self.events.emit(SwarmEvent::DownloadComplete);
        }
    }

    fn add_to_ranker(&self, candidate: Arc<SourceCandidate>) {
        self.dispatched.lock().unwrap().remove(candidate.id());
        self.ranker.lock().unwrap().add_to_pool(candidate);
    }

    fn report_source(&self, descriptor: &SourceDescriptor, good: bool) {
        debug!(source = %descriptor.id, good, "mesh report");
        if let Some(mesh) = self.ranker.lock().unwrap().mesh_handler() {
            mesh.report_source(descriptor, good);
        }
    }

    fn report_range_verified(&self, range: ByteRange) {
        self.events.emit(SwarmEvent::RangeCommitted { range });
    }

    fn report_range_invalid(&self, range: ByteRange) {
        self.events.emit(SwarmEvent::RangeInvalid { range });
    }

    fn kill_queued_if_necessary(&self, id: WorkerId, queue_pos: i32) -> bool {
        let kept = self
            .pool
            .lock()
            .unwrap()
            .kill_queued_if_necessary(id, queue_pos);
        if kept && queue_pos > -1 {
            self.events.emit(SwarmEvent::WorkerQueued {
                worker_id: id,
                position: queue_pos,
            });
        }
        kept
    }

    fn remove_queued(&self, id: WorkerId) {
        self.pool.lock().unwrap().remove_queued(id);
    }

    fn active_worker_count(&self) -> usize {
        self.pool.lock().unwrap().active_count()
    }

    fn cancel_corrupt_download(&self) {
        info!("cancelling corrupt download");
        self.events.emit(SwarmEvent::Cancelled);
        self.stop();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(capacity: usize) -> WorkerPool {
        WorkerPool::new(capacity)
    }

    fn flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn test_connected_worker_kept_when_capacity_free() {
        let mut pool = pool_with(2);
        pool.register(1, flag());
        assert!(pool.kill_queued_if_necessary(1, -1));
        assert_eq!(pool.queued_count(), 0);
    }

    #[test]
    fn test_queued_worker_updates_position() {
        let mut pool = pool_with(2);
        pool.register(1, flag());
        assert!(pool.kill_queued_if_necessary(1, 9));
        assert_eq!(pool.queue_position(1), Some(9));
        assert!(pool.kill_queued_if_necessary(1, 4));
        assert_eq!(pool.queue_position(1), Some(4));
    }

    #[test]
    fn test_worse_queued_worker_is_replaced() {
        let mut pool = pool_with(2);
        let victim_flag = flag();
        pool.register(1, flag());
        pool.register(2, Arc::clone(&victim_flag));
        pool.register(3, flag());
        pool.mark_active(1);
        assert!(pool.kill_queued_if_necessary(2, 12));
        // Pool is at capacity: one active, one queued.
        assert!(pool.kill_queued_if_necessary(3, 5));
        assert!(victim_flag.load(Ordering::SeqCst), "worst queued worker interrupted");
        assert_eq!(pool.queue_position(3), Some(5));
        assert_eq!(pool.queue_position(2), None);
    }

    #[test]
    fn test_newcomer_rejected_when_nobody_is_worse() {
        let mut pool = pool_with(2);
        pool.register(1, flag());
        pool.register(2, flag());
        pool.register(3, flag());
        pool.mark_active(1);
        assert!(pool.kill_queued_if_necessary(2, 3));
        // Position 8 is worse than the existing queued 3: refused.
        assert!(!pool.kill_queued_if_necessary(3, 8));
        assert_eq!(pool.queue_position(2), Some(3));
    }

    #[test]
    fn test_connected_worker_replaces_queued_when_over_capacity() {
        let mut pool = pool_with(2);
        let victim_flag = flag();
        pool.register(1, flag());
        pool.register(2, Arc::clone(&victim_flag));
        pool.register(3, flag());
        pool.register(4, flag());
        // Two workers queue up while nothing is active yet.
        assert!(pool.kill_queued_if_necessary(1, 6));
        assert!(pool.kill_queued_if_necessary(2, 9));
        // Two fresh workers then fill the active slots.
        pool.mark_active(3);
        pool.mark_active(4);
        // Worker 1's poll succeeded and it connected (-1): the
        // worst-placed queued worker is doomed.
        assert!(pool.kill_queued_if_necessary(1, -1));
        assert!(victim_flag.load(Ordering::SeqCst));
        assert_eq!(pool.queue_position(2), None);
    }

    #[test]
    fn test_interrupt_all_sets_every_flag() {
        let mut pool = pool_with(4);
        let flags: Vec<_> = (0..3).map(|_| flag()).collect();
        for (i, f) in flags.iter().enumerate() {
            pool.register(i as WorkerId, Arc::clone(f));
        }
        pool.interrupt_all();
        assert!(flags.iter().all(|f| f.load(Ordering::SeqCst)));
    }
}
