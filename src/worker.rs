//! One worker per connection attempt.
//!
//! A worker takes a ranked candidate, establishes a connection (directly,
//! or by soliciting a push and parking at the rendezvous), then walks the
//! request phases: optional metadata fetch, repeated range assignment,
//! body transfer. Every per-connection error is translated into candidate
//! mutations plus host callbacks here; nothing propagates to sibling
//! workers or the coordinator.

use crate::config::SwarmConfig;
use crate::coordinator::DownloadHost;
use crate::error::DownloadError;
use crate::events::WorkerId;
use crate::ledger::ChunkLedger;
use crate::phase::{PhaseTracker, RequestPhase};
use crate::push::{PushRendezvous, PushSignal};
use crate::range_set::ByteRange;
use crate::source::SourceCandidate;
use crate::transport::{ChunkSink, Connection, SourceTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct DownloadWorker<T: SourceTransport, H: DownloadHost> {
    id: WorkerId,
    candidate: Arc<SourceCandidate>,
    transport: Arc<T>,
    host: Arc<H>,
    sink: Arc<dyn ChunkSink>,
    ledger: Arc<ChunkLedger>,
    rendezvous: Arc<PushRendezvous<T::Conn>>,
    config: Arc<SwarmConfig>,
    interrupted: Arc<AtomicBool>,
}

/// How the connection attempt should proceed for a given address kind.
struct ConnectPlan {
    push_first: bool,
    direct_fallback: bool,
    push_fallback: bool,
}

impl<T: SourceTransport, H: DownloadHost> DownloadWorker<T, H> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: WorkerId,
        candidate: Arc<SourceCandidate>,
        transport: Arc<T>,
        host: Arc<H>,
        sink: Arc<dyn ChunkSink>,
        ledger: Arc<ChunkLedger>,
        rendezvous: Arc<PushRendezvous<T::Conn>>,
        config: Arc<SwarmConfig>,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        DownloadWorker {
            id,
            candidate,
            transport,
            host,
            sink,
            ledger,
            rendezvous,
            config,
            interrupted,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst) || self.host.is_stopped()
    }

    /// Runs the worker to completion. Always ends with `worker_finished`.
    pub async fn run(self) {
        if self.is_interrupted() {
            // The candidate may still be useful later.
            self.host.add_to_ranker(self.candidate.clone());
        } else {
            match self.establish().await {
                Some(conn) => self.transfer(conn).await,
                None => {
                    // Could not connect at all; the mesh should stop
                    // handing this source around.
                    self.host.report_source(self.candidate.descriptor(), false);
                }
            }
        }
        self.host.worker_finished(self.id);
    }

    // ---- connection establishment ----

    fn connect_plan(&self) -> ConnectPlan {
        let descriptor = self.candidate.descriptor();
        if descriptor.replied_to_multicast {
            // A multicast reply is on the local network; push first so
            // scarce direct slots stay free, but a direct attempt is
            // still worth it if the push never lands.
            ConnectPlan {
                push_first: true,
                direct_fallback: true,
                push_fallback: false,
            }
        } else if descriptor.address.is_push() {
            ConnectPlan {
                push_first: true,
                direct_fallback: false,
                push_fallback: false,
            }
        } else {
            ConnectPlan {
                push_first: false,
                direct_fallback: false,
                push_fallback: true,
            }
        }
    }

    async fn establish(&self) -> Option<T::Conn> {
        let plan = self.connect_plan();
        if plan.push_first {
            match self.connect_push().await {
                Some(conn) => Some(conn),
                None if plan.direct_fallback => self.connect_direct().await,
                None => None,
            }
        } else {
            match self.connect_direct().await {
                Some(conn) => Some(conn),
                None if plan.push_fallback => self.connect_push().await,
                None => None,
            }
        }
    }

    async fn connect_direct(&self) -> Option<T::Conn> {
        let descriptor = self.candidate.descriptor();
        let deadline = Duration::from_millis(self.config.connect_timeout_ms);
        match tokio::time::timeout(deadline, self.transport.connect_direct(descriptor)).await {
            Ok(Ok(conn)) => Some(conn),
            Ok(Err(err)) => {
                debug!(source = %self.candidate, error = %err, "direct connect failed");
                None
            }
            Err(_) => {
                debug!(source = %self.candidate, "direct connect timed out");
                None
            }
        }
    }

    /// Registers at the rendezvous, asks the source to connect back, and
    /// waits a bounded time for the pushed connection.
    async fn connect_push(&self) -> Option<T::Conn> {
        let descriptor = self.candidate.descriptor();
        let (ticket, rx) = self
            .rendezvous
            .register(descriptor.guid, descriptor.address.addr());

        if let Err(err) = self.transport.solicit_push(descriptor).await {
            debug!(source = %self.candidate, error = %err, "push solicit failed");
            if let Some(observer) = self.rendezvous.match_exact(&ticket) {
                let _ = observer.send(PushSignal::Shutdown);
            }
            return None;
        }

        // Sources learned through gossip only got a UDP push request;
        // give those a shorter wait.
        let wait = if descriptor.from_alternate_location {
            self.config.alt_push_connect_timeout_ms
        } else {
            self.config.push_connect_timeout_ms
        };
        match tokio::time::timeout(Duration::from_millis(wait), rx).await {
            Ok(Ok(PushSignal::Connected(conn))) => Some(conn),
            Ok(Ok(PushSignal::Shutdown)) | Ok(Err(_)) => None,
            Err(_) => {
                // Timed out: withdraw the registration ourselves; whoever
                // is slower loses the observer.
                if let Some(observer) = self.rendezvous.match_exact(&ticket) {
                    let _ = observer.send(PushSignal::Shutdown);
                }
                debug!(source = %self.candidate, "push wait timed out");
                None
            }
        }
    }

    // ---- transfer ----

    async fn transfer(&self, mut conn: T::Conn) {
        let mut tracker = PhaseTracker::new(conn.is_http11());
        let mut reported_started = false;

        if conn.offers_metadata() && !self.candidate.thex_failed() {
            if let Err(err) = self.fetch_metadata(&mut conn, &mut tracker).await {
                // Sticky per source: never ask this host for a tree again.
                self.candidate.set_thex_failed();
                debug!(source = %self.candidate, error = %err, "metadata fetch failed");
            }
        }

        loop {
            if self.is_interrupted() {
                self.host.add_to_ranker(self.candidate.clone());
                break;
            }
            if let Err(err) = advance_to_request(&mut tracker) {
                warn!(worker = self.id, error = %err, "phase tracking out of step");
                break;
            }

            let available = self.candidate.available_ranges();
            let limit = self.ledger.next_chunk_limit(
                self.config.block_size,
                self.host.active_worker_count(),
                self.config.min_split_size,
            );
            let requested = match self.ledger.lease(available.as_ref(), limit) {
                Ok(range) => range,
                Err(_) => {
                    if self.candidate.is_partial_source() {
                        // The source has none of what we still need.
                        self.handle_no_ranges();
                    } else {
                        // Everything is written or leased elsewhere; the
                        // candidate stays useful.
                        self.host.add_to_ranker(self.candidate.clone());
                    }
                    break;
                }
            };

            match conn.request_range(requested).await {
                Ok(granted) => {
                    self.ledger.shrink_lease(requested, granted);
                    self.candidate.reset_failed_count();
                    self.host.remove_queued(self.id);
                    if !reported_started {
                        reported_started = true;
                        self.host.worker_started(self.id);
                    }
                    if let Err(err) = tracker.advance_to(RequestPhase::Downloading) {
                        warn!(worker = self.id, error = %err, "phase tracking out of step");
                        self.ledger.release(granted);
                        break;
                    }
                    match conn.download(granted, self.sink.as_ref()).await {
                        Ok(_) => {
                            self.ledger.commit(granted);
                            self.candidate.reset_failed_count();
                            self.host.report_range_verified(granted);
                            self.host.report_source(self.candidate.descriptor(), true);
                            if self.sink.is_hopeless() {
                                self.host.cancel_corrupt_download();
                                break;
                            }
                            if tracker.begin_next_request().is_ok() {
                                continue;
                            }
                            // HTTP/1.0: one range per connection, the
                            // source goes back in the pool.
                            self.host.add_to_ranker(self.candidate.clone());
                            break;
                        }
                        Err(err) => {
                            self.release_unwritten(granted);
                            debug!(source = %self.candidate, error = %err, "body transfer failed");
                            self.handle_source_failure();
                            self.host.worker_failed(self.id);
                            break;
                        }
                    }
                }
                Err(DownloadError::Queued(directive)) => {
                    self.ledger.release(requested);
                    self.candidate.set_queue_status(directive.position);
                    self.candidate.reset_failed_count();
                    if !self
                        .host
                        .kill_queued_if_necessary(self.id, directive.position)
                    {
                        debug!(worker = self.id, "told not to queue");
                        break;
                    }
                    if tracker.advance_to(RequestPhase::Queued).is_err() {
                        break;
                    }
                    debug!(
                        worker = self.id,
                        position = directive.position,
                        "queued remotely"
                    );
                    tokio::time::sleep(directive.poll_delay()).await;
                    if self.is_interrupted() {
                        self.host.add_to_ranker(self.candidate.clone());
                        break;
                    }
                }
                Err(DownloadError::TryAgainLater { retry_after_secs }) => {
                    self.ledger.release(requested);
                    self.handle_busy(retry_after_secs);
                    break;
                }
                Err(DownloadError::RangeUnavailable { available }) => {
                    self.ledger.release(requested);
                    self.candidate.reset_failed_count();
                    // Not a source failure; it just lacks these bytes.
                    self.host.report_source(self.candidate.descriptor(), true);
                    match available {
                        Some(ranges) => {
                            self.candidate.set_available_ranges(Some(ranges));
                            // Try a different range on the same connection.
                        }
                        None => {
                            self.handle_no_ranges();
                            break;
                        }
                    }
                }
                Err(err @ DownloadError::ContentMismatch { .. }) => {
                    self.ledger.release(requested);
                    warn!(source = %self.candidate, error = %err, "content identity mismatch");
                    // Never retry, never count its bytes.
                    self.host
                        .report_source(self.candidate.descriptor(), false);
                    self.host.worker_failed(self.id);
                    break;
                }
                Err(err) => {
                    self.ledger.release(requested);
                    debug!(source = %self.candidate, error = %err, "request failed");
                    if let DownloadError::UnknownStatus(code) = err {
                        self.candidate.set_last_status(code);
                    }
                    self.handle_source_failure();
                    self.host.worker_failed(self.id);
                    break;
                }
            }
        }
        self.host.remove_queued(self.id);
    }

    async fn fetch_metadata(
        &self,
        conn: &mut T::Conn,
        tracker: &mut PhaseTracker,
    ) -> Result<(), DownloadError> {
        tracker
            .advance_to(RequestPhase::RequestingMetadata)
            .map_err(|e| DownloadError::Malformed(e.to_string()))?;
        conn.fetch_metadata().await?;
        tracker
            .advance_to(RequestPhase::DownloadingMetadata)
            .map_err(|e| DownloadError::Malformed(e.to_string()))?;
        Ok(())
    }

    // ---- failure handlers ----

    /// A failed transfer: back off and retry a limited number of times,
    /// then tell the mesh the source is bad.
    fn handle_source_failure(&self) {
        self.candidate.increment_failed_count();
        if self.candidate.failed_count() < self.config.max_source_failures {
            self.candidate.set_retry_after(self.config.failed_retry_secs);
            self.host.add_to_ranker(self.candidate.clone());
        } else {
            self.host
                .report_source(self.candidate.descriptor(), false);
        }
    }

    /// Try-again-later: mark busy and keep the source pooled. While other
    /// workers are active the backoff is raised, since we are in no hurry.
    fn handle_busy(&self, retry_after_secs: Option<u64>) {
        if let Some(secs) = retry_after_secs {
            self.candidate.set_retry_after(secs);
        } else if !self.candidate.is_busy() {
            self.candidate.set_retry_after(self.config.busy_retry_secs);
        }
        if self.host.active_worker_count() > 0 {
            self.candidate
                .set_retry_after(self.config.busy_retry_active_secs);
        }
        self.candidate.reset_failed_count();
        self.host.add_to_ranker(self.candidate.clone());
    }

    /// The source offers nothing we still need: clear its claimed ranges
    /// (they may be stale) and check back later.
    fn handle_no_ranges(&self) {
        self.candidate.set_available_ranges(None);
        if !self.candidate.is_busy() {
            self.candidate
                .set_retry_after(self.config.no_ranges_retry_secs);
        }
        self.candidate.reset_failed_count();
        self.host.add_to_ranker(self.candidate.clone());
    }

    fn release_unwritten(&self, granted: ByteRange) {
        // Bytes already handed to the sink for this range are not
        // tracked separately; the whole lease goes back and a later
        // worker re-fetches it.
        self.ledger.release(granted);
    }
}

/// Walks the tracker to `RequestingBody` from wherever the previous
/// request left it.
fn advance_to_request(tracker: &mut PhaseTracker) -> Result<(), crate::phase::PhaseError> {
    loop {
        match tracker.phase() {
            RequestPhase::RequestingBody => return Ok(()),
            RequestPhase::Begin | RequestPhase::ConsumingBody | RequestPhase::Queued => {
                tracker.advance_to(RequestPhase::RequestingBody)?;
            }
            RequestPhase::RequestingMetadata | RequestPhase::DownloadingMetadata => {
                tracker.advance_to(RequestPhase::ConsumingBody)?;
            }
            RequestPhase::Downloading => {
                tracker.begin_next_request()?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_to_request_from_begin() {
        let mut tracker = PhaseTracker::new(true);
        advance_to_request(&mut tracker).unwrap();
        assert_eq!(tracker.phase(), RequestPhase::RequestingBody);
    }

    #[test]
    fn test_advance_to_request_after_metadata() {
        let mut tracker = PhaseTracker::new(true);
        tracker.advance_to(RequestPhase::RequestingMetadata).unwrap();
        tracker.advance_to(RequestPhase::DownloadingMetadata).unwrap();
        advance_to_request(&mut tracker).unwrap();
        assert_eq!(tracker.phase(), RequestPhase::RequestingBody);
    }

    #[test]
    fn test_advance_to_request_after_queue_cycle() {
        let mut tracker = PhaseTracker::new(true);
        advance_to_request(&mut tracker).unwrap();
        tracker.advance_to(RequestPhase::Queued).unwrap();
        advance_to_request(&mut tracker).unwrap();
        assert_eq!(tracker.phase(), RequestPhase::RequestingBody);
    }
}
