//! Lifecycle events emitted toward the hosting application.

use crate::range_set::ByteRange;
use serde::Serialize;
use tokio::sync::mpsc;

pub type WorkerId = u64;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SwarmEvent {
    SourceAdded {
        source_id: String,
    },
    WorkerStarted {
        worker_id: WorkerId,
    },
    WorkerQueued {
        worker_id: WorkerId,
        position: i32,
    },
    WorkerFailed {
        worker_id: WorkerId,
    },
    WorkerFinished {
        worker_id: WorkerId,
    },
    RangeCommitted {
        range: ByteRange,
    },
    RangeInvalid {
        range: ByteRange,
    },
    SourcesExhausted {
        busy_wait_ms: u64,
    },
    DownloadComplete,
    Cancelled,
}

/// Fire-and-forget sender; a host that stopped listening is not an error.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<SwarmEvent>,
}

impl EventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SwarmEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventBus { tx }, rx)
    }

    pub fn emit(&self, event: SwarmEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_tagged() {
        let event = SwarmEvent::WorkerQueued {
            worker_id: 3,
            position: 5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "workerQueued");
        assert_eq!(json["position"], 5);
    }

    #[test]
    fn test_emit_without_listener_is_fine() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        bus.emit(SwarmEvent::DownloadComplete);
    }
}
