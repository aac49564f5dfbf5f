//! Per-connection request phase tracking.
//!
//! A connection moves through a metadata fetch, an optional remote queue,
//! and the main body transfer. The phase machine is monotonic except that
//! `Queued` may bounce back to `RequestingBody` an unbounded number of
//! times while the server keeps reporting a queue position.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default minimum interval between queue polls, per protocol convention.
pub const DEFAULT_MIN_POLL_MS: u64 = 45_000;
/// Default maximum interval before a queued connection must re-request.
pub const DEFAULT_MAX_POLL_MS: u64 = 120_000;

/// Protocol phase of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestPhase {
    Begin,
    RequestingMetadata,
    DownloadingMetadata,
    ConsumingBody,
    RequestingBody,
    Queued,
    Downloading,
}

impl RequestPhase {
    /// Legal next phases. Metadata phases are skippable entirely when no
    /// hash-tree fetch is needed or once it failed for this source.
    fn allowed_next(self) -> &'static [RequestPhase] {
        use RequestPhase::*;
        match self {
            Begin => &[RequestingMetadata, ConsumingBody, RequestingBody],
            RequestingMetadata => &[DownloadingMetadata, ConsumingBody, RequestingBody],
            DownloadingMetadata => &[ConsumingBody, RequestingBody],
            ConsumingBody => &[RequestingBody],
            RequestingBody => &[Queued, Downloading],
            Queued => &[RequestingBody],
            // Terminal: the connection may still be reading bytes, but no
            // further phase transition happens until it ends.
            Downloading => &[],
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal phase transition {from:?} -> {to:?}")]
pub struct PhaseError {
    pub from: RequestPhase,
    pub to: RequestPhase,
}

/// Phase plus the protocol negotiation flag that decides whether the
/// connection may be reused across multiple range requests.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    phase: RequestPhase,
    http11: bool,
}

impl PhaseTracker {
    pub fn new(http11: bool) -> Self {
        PhaseTracker {
            phase: RequestPhase::Begin,
            http11,
        }
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    pub fn is_http11(&self) -> bool {
        self.http11
    }

    pub fn advance_to(&mut self, next: RequestPhase) -> Result<(), PhaseError> {
        if self.phase.allowed_next().contains(&next) {
            self.phase = next;
            Ok(())
        } else {
            Err(PhaseError {
                from: self.phase,
                to: next,
            })
        }
    }

    /// Rewinds to `Begin` for the next range request on a kept-alive
    /// (HTTP/1.1) connection. Only legal once the body transfer phase has
    /// been reached.
    pub fn begin_next_request(&mut self) -> Result<(), PhaseError> {
        if self.http11 && self.phase == RequestPhase::Downloading {
            self.phase = RequestPhase::Begin;
            Ok(())
        } else {
            Err(PhaseError {
                from: self.phase,
                to: RequestPhase::Begin,
            })
        }
    }
}

/// Server-declared queue schedule carried by a queued response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDirective {
    /// Position in the remote upload queue.
    pub position: i32,
    /// Do not re-request body transfer before this many milliseconds.
    pub min_poll_ms: u64,
    /// Do not wait past this many milliseconds without retrying.
    pub max_poll_ms: u64,
}

impl Default for QueueDirective {
    fn default() -> Self {
        QueueDirective {
            position: 0,
            min_poll_ms: DEFAULT_MIN_POLL_MS,
            max_poll_ms: DEFAULT_MAX_POLL_MS,
        }
    }
}

impl QueueDirective {
    /// How long to sleep before polling again: the declared minimum,
    /// clamped so a bogus server cannot push us past its own maximum.
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.min_poll_ms.min(self.max_poll_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RequestPhase::*;

    #[test]
    fn test_full_phase_chain() {
        let mut tracker = PhaseTracker::new(true);
        for next in [
            RequestingMetadata,
            DownloadingMetadata,
            ConsumingBody,
            RequestingBody,
            Downloading,
        ] {
            tracker.advance_to(next).unwrap();
        }
        assert_eq!(tracker.phase(), Downloading);
    }

    #[test]
    fn test_metadata_phases_are_skippable() {
        let mut tracker = PhaseTracker::new(false);
        tracker.advance_to(RequestingBody).unwrap();
        assert_eq!(tracker.phase(), RequestingBody);

        let mut tracker = PhaseTracker::new(false);
        tracker.advance_to(ConsumingBody).unwrap();
        tracker.advance_to(RequestingBody).unwrap();
    }

    #[test]
    fn test_queue_cycle_repeats() {
        let mut tracker = PhaseTracker::new(true);
        tracker.advance_to(RequestingBody).unwrap();
        for _ in 0..3 {
            tracker.advance_to(Queued).unwrap();
            tracker.advance_to(RequestingBody).unwrap();
        }
        tracker.advance_to(Downloading).unwrap();
    }

    #[test]
    fn test_downloading_is_terminal() {
        let mut tracker = PhaseTracker::new(false);
        tracker.advance_to(RequestingBody).unwrap();
        tracker.advance_to(Downloading).unwrap();
        assert!(tracker.advance_to(RequestingBody).is_err());
        // HTTP/1.0 connections are not reused either.
        assert!(tracker.begin_next_request().is_err());
    }

    #[test]
    fn test_http11_connection_reuse() {
        let mut tracker = PhaseTracker::new(true);
        tracker.advance_to(RequestingBody).unwrap();
        tracker.advance_to(Downloading).unwrap();
        tracker.begin_next_request().unwrap();
        assert_eq!(tracker.phase(), Begin);
    }

    #[test]
    fn test_illegal_transition_reports_both_ends() {
        let mut tracker = PhaseTracker::new(true);
        let err = tracker.advance_to(Downloading).unwrap_err();
        assert_eq!(err.from, Begin);
        assert_eq!(err.to, Downloading);
    }

    #[test]
    fn test_poll_delay_clamps_to_max() {
        let directive = QueueDirective {
            position: 3,
            min_poll_ms: 200_000,
            max_poll_ms: 120_000,
        };
        assert_eq!(directive.poll_delay(), Duration::from_millis(120_000));
        assert_eq!(
            QueueDirective::default().poll_delay(),
            Duration::from_millis(DEFAULT_MIN_POLL_MS)
        );
    }
}
