use crate::phase::QueueDirective;
use thiserror::Error;

/// Errors raised across the connection boundary.
///
/// Every variant is caught at the worker and translated into source-state
/// mutations plus a lifecycle callback; none propagates to sibling workers
/// or the coordinator. The kind decides retry vs. abandonment.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// On-disk partial state cannot be resumed.
    #[error("resume rejected: {0}")]
    ResumeFailed(String),

    /// The remote peer's declared content hash does not match what was
    /// expected. Bytes from this source must never be counted.
    #[error("content identity mismatch, expected {expected}")]
    ContentMismatch { expected: String },

    /// Peer does not have the file.
    #[error("file not found on source")]
    NotFound,

    /// Peer refuses to share.
    #[error("source is not sharing")]
    NotSharing,

    /// Peer answered with a status code we do not understand.
    #[error("unknown status code {0}")]
    UnknownStatus(u16),

    /// The requested bytes are not offered by this source right now.
    /// Carries the ranges the source says it does have, when it told us.
    #[error("requested range not available")]
    RangeUnavailable {
        available: Option<crate::range_set::RangeSet>,
    },

    /// The server deferred us with a poll schedule. Not a failure.
    #[error("queued at position {}", .0.position)]
    Queued(QueueDirective),

    /// Transient capacity problem; the source stays in the pool.
    #[error("source busy")]
    TryAgainLater { retry_after_secs: Option<u64> },

    /// Response could not be parsed.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Transport-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// True for kinds that count against the source's failure threshold.
    pub fn is_source_failure(&self) -> bool {
        matches!(
            self,
            DownloadError::NotFound
                | DownloadError::NotSharing
                | DownloadError::UnknownStatus(_)
                | DownloadError::Malformed(_)
                | DownloadError::Io(_)
        )
    }

    /// True for kinds after which the source must be dropped permanently.
    pub fn is_fatal_for_source(&self) -> bool {
        matches!(self, DownloadError::ContentMismatch { .. })
    }
}

/// Raised by a range selector when no byte is both offered and needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no bytes available to assign")]
pub struct NoRangeToAssign;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_failure_classification() {
        assert!(DownloadError::NotFound.is_source_failure());
        assert!(DownloadError::Malformed("garbage".into()).is_source_failure());
        assert!(!DownloadError::TryAgainLater {
            retry_after_secs: None
        }
        .is_source_failure());
        assert!(!DownloadError::Queued(QueueDirective::default()).is_source_failure());
        assert!(!DownloadError::RangeUnavailable { available: None }.is_source_failure());
    }

    #[test]
    fn test_fatal_classification() {
        let err = DownloadError::ContentMismatch {
            expected: "sha1:deadbeef".into(),
        };
        assert!(err.is_fatal_for_source());
        assert!(!err.is_source_failure());
        assert!(!DownloadError::NotFound.is_fatal_for_source());
    }
}
