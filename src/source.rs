//! Remote source descriptors and per-source runtime state.
//!
//! A `SourceDescriptor` is the immutable picture of a remote peer offering
//! the file. A `SourceCandidate` wraps it with the mutable bookkeeping a
//! download mutates on every connection attempt: failure count, retry
//! deadline, queue position, round-trip measurement and the ranges the
//! source claims to have.

use crate::range_set::RangeSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// 16-byte peer GUID used to route push connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerGuid(pub [u8; 16]);

impl PeerGuid {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerGuid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for PeerGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// How a source can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceAddress {
    /// Directly connectable host:port.
    Direct { addr: String },
    /// Firewalled source, reachable only through a push handshake via its
    /// proxies. `addr` is the address the source believes it has; it may
    /// be private and unverifiable against an inbound socket.
    Push { addr: String, proxies: Vec<String> },
}

impl SourceAddress {
    pub fn is_push(&self) -> bool {
        matches!(self, SourceAddress::Push { .. })
    }

    pub fn addr(&self) -> &str {
        match self {
            SourceAddress::Direct { addr } => addr,
            SourceAddress::Push { addr, .. } => addr,
        }
    }
}

/// Stable identity of a source; pool uniqueness and all tie-breaking of
/// last resort go through this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub String);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable description of a remote source for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    pub id: SourceId,
    pub guid: PeerGuid,
    pub address: SourceAddress,
    pub file_name: String,
    pub file_size: u64,
    /// Verifiable content identity (e.g. a urn), when the source declared one.
    pub content_id: Option<String>,
    pub vendor: Option<String>,
    /// Declared upstream speed hint, in kilobits.
    pub speed: u32,
    /// Result quality score from the search layer.
    pub quality: i32,
    /// Whether this result answered a multicast-originated query.
    pub replied_to_multicast: bool,
    /// Whether we learned of this source through alternate-location gossip
    /// rather than a direct query reply.
    pub from_alternate_location: bool,
    /// Whether the source speaks HTTP/1.1 and can serve several ranges on
    /// one connection.
    pub http11: bool,
}

impl SourceDescriptor {
    /// True when the source declared a hash we can verify content against.
    pub fn has_verifiable_identity(&self) -> bool {
        self.content_id.is_some()
    }
}

#[derive(Debug)]
struct CandidateState {
    failed_count: u32,
    last_status: Option<u16>,
    /// Ranges the source claims to have. `None` means a full source.
    available_ranges: Option<RangeSet>,
    /// Negative = free slot, positive = queue position.
    queue_status: i32,
    /// The candidate is busy while `now < earliest_retry`.
    earliest_retry: Option<Instant>,
    ping_sent_at: Option<Instant>,
    pong_received_at: Option<Instant>,
    /// Sticky: once a metadata fetch failed, never retry it on this source.
    thex_failed: bool,
}

/// A source plus everything a worker learns about it at runtime.
///
/// Shared between the ranking pool, the coordinator and whichever worker
/// currently holds it; all mutable fields sit behind one candidate-local
/// lock, independent from the pool lock.
#[derive(Debug)]
pub struct SourceCandidate {
    descriptor: SourceDescriptor,
    state: Mutex<CandidateState>,
}

impl SourceCandidate {
    pub fn new(descriptor: SourceDescriptor) -> Self {
        SourceCandidate {
            descriptor,
            state: Mutex::new(CandidateState {
                failed_count: 0,
                last_status: None,
                available_ranges: None,
                queue_status: -1,
                earliest_retry: None,
                ping_sent_at: None,
                pong_received_at: None,
                thex_failed: false,
            }),
        }
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> &SourceId {
        &self.descriptor.id
    }

    pub fn failed_count(&self) -> u32 {
        self.state.lock().unwrap().failed_count
    }

    pub fn increment_failed_count(&self) {
        self.state.lock().unwrap().failed_count += 1;
    }

    pub fn reset_failed_count(&self) {
        self.state.lock().unwrap().failed_count = 0;
    }

    pub fn last_status(&self) -> Option<u16> {
        self.state.lock().unwrap().last_status
    }

    pub fn set_last_status(&self, status: u16) {
        self.state.lock().unwrap().last_status = Some(status);
    }

    /// Snapshot of the ranges the source claims to offer; `None` for a
    /// full source. A copy is handed out, never a reference into the lock.
    pub fn available_ranges(&self) -> Option<RangeSet> {
        self.state.lock().unwrap().available_ranges.clone()
    }

    pub fn set_available_ranges(&self, ranges: Option<RangeSet>) {
        self.state.lock().unwrap().available_ranges = ranges;
    }

    /// A partial source offers only part of the file.
    pub fn is_partial_source(&self) -> bool {
        self.state.lock().unwrap().available_ranges.is_some()
    }

    pub fn queue_status(&self) -> i32 {
        self.state.lock().unwrap().queue_status
    }

    pub fn set_queue_status(&self, status: i32) {
        self.state.lock().unwrap().queue_status = status;
    }

    /// Marks the candidate busy for `secs` seconds from now. The deadline
    /// only ever moves forward.
    pub fn set_retry_after(&self, secs: u64) {
        self.set_retry_after_at(Instant::now(), secs);
    }

    pub(crate) fn set_retry_after_at(&self, now: Instant, secs: u64) {
        let deadline = now + Duration::from_secs(secs);
        let mut state = self.state.lock().unwrap();
        match state.earliest_retry {
            Some(existing) if existing >= deadline => {}
            _ => state.earliest_retry = Some(deadline),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.is_busy_at(Instant::now())
    }

    pub fn is_busy_at(&self, now: Instant) -> bool {
        match self.state.lock().unwrap().earliest_retry {
            Some(deadline) => now < deadline,
            None => false,
        }
    }

    /// Remaining busy time, zero when the candidate is usable.
    pub fn wait_time_at(&self, now: Instant) -> Duration {
        match self.state.lock().unwrap().earliest_retry {
            Some(deadline) if deadline > now => deadline - now,
            _ => Duration::ZERO,
        }
    }

    pub fn record_ping(&self, now: Instant) {
        self.state.lock().unwrap().ping_sent_at = Some(now);
    }

    pub fn record_pong(&self, now: Instant) {
        self.state.lock().unwrap().pong_received_at = Some(now);
    }

    /// Ping/pong round-trip, `None` until a pong has been recorded.
    pub fn round_trip_time(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        match (state.ping_sent_at, state.pong_received_at) {
            (Some(ping), Some(pong)) if pong >= ping => Some(pong - ping),
            _ => None,
        }
    }

    pub fn thex_failed(&self) -> bool {
        self.state.lock().unwrap().thex_failed
    }

    /// Sticky; there is no way to clear it.
    pub fn set_thex_failed(&self) {
        self.state.lock().unwrap().thex_failed = true;
    }
}

impl fmt::Display for SourceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.descriptor.id, self.descriptor.address.addr())
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Descriptor builder for tests across the crate.
    pub fn descriptor(id: &str) -> SourceDescriptor {
        SourceDescriptor {
            id: SourceId(id.to_string()),
            guid: PeerGuid([0xab; 16]),
            address: SourceAddress::Direct {
                addr: format!("203.0.113.{}:6346", id.len()),
            },
            file_name: "shared.bin".to_string(),
            file_size: 1 << 20,
            content_id: Some("urn:sha1:PLSTHIPQGSSZTS5FJUPAKUZWUGYQYPFB".to_string()),
            vendor: Some("LIME".to_string()),
            speed: 350,
            quality: 3,
            replied_to_multicast: false,
            from_alternate_location: false,
            http11: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::descriptor;
    use super::*;

    #[test]
    fn test_retry_deadline_only_moves_forward() {
        let candidate = SourceCandidate::new(descriptor("a"));
        let now = Instant::now();
        candidate.set_retry_after_at(now, 600);
        candidate.set_retry_after_at(now, 60);
        // The later deadline wins.
        assert!(candidate.wait_time_at(now) > Duration::from_secs(500));
    }

    #[test]
    fn test_busy_expires() {
        let candidate = SourceCandidate::new(descriptor("a"));
        let now = Instant::now();
        candidate.set_retry_after_at(now, 60);
        assert!(candidate.is_busy_at(now));
        assert!(!candidate.is_busy_at(now + Duration::from_secs(61)));
    }

    #[test]
    fn test_round_trip_requires_pong() {
        let candidate = SourceCandidate::new(descriptor("a"));
        let now = Instant::now();
        candidate.record_ping(now);
        assert_eq!(candidate.round_trip_time(), None);
        candidate.record_pong(now + Duration::from_millis(80));
        assert_eq!(
            candidate.round_trip_time(),
            Some(Duration::from_millis(80))
        );
    }

    #[test]
    fn test_thex_failed_is_sticky() {
        let candidate = SourceCandidate::new(descriptor("a"));
        assert!(!candidate.thex_failed());
        candidate.set_thex_failed();
        assert!(candidate.thex_failed());
    }

    #[test]
    fn test_partial_source_tracks_ranges() {
        let candidate = SourceCandidate::new(descriptor("a"));
        assert!(!candidate.is_partial_source());
        let mut ranges = RangeSet::new();
        ranges.add(crate::range_set::ByteRange::new(0, 4096));
        candidate.set_available_ranges(Some(ranges));
        assert!(candidate.is_partial_source());
        candidate.set_available_ranges(None);
        assert!(!candidate.is_partial_source());
    }
}
