//! Swarming download core: manages the candidate sources of one logical
//! file, decides which source to contact next, assigns each connection a
//! non-overlapping byte range, routes inbound push connections to the
//! request that solicited them, and tracks each connection's protocol
//! phase.
//!
//! Wire I/O, disk writing/verification, persistence and re-query live
//! outside this crate, behind the contracts in [`transport`] and
//! [`coordinator`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod ledger;
pub mod phase;
pub mod pieces;
pub mod push;
pub mod range_set;
pub mod ranker;
pub mod selection;
pub mod source;
pub mod transport;
pub mod worker;

pub use config::SwarmConfig;
pub use coordinator::{DownloadHost, SpawnDecision, SwarmCoordinator, SwarmStatus, WorkerPool};
pub use error::{DownloadError, NoRangeToAssign};
pub use events::{EventBus, SwarmEvent, WorkerId};
pub use ledger::ChunkLedger;
pub use phase::{PhaseTracker, QueueDirective, RequestPhase};
pub use pieces::{PieceState, PiecesInfo};
pub use push::{PushRendezvous, PushSignal, PushTicket};
pub use range_set::{ByteRange, RangeSet};
pub use ranker::{
    CapabilityRanker, CompositeRanker, LegacyRanker, MeshHandler, RankerKind, RankerPolicy,
    SourceRanker, ValidityFilter,
};
pub use selection::{selector_for, LinearSelector, RandomSelector, RangeSelector};
pub use source::{PeerGuid, SourceAddress, SourceCandidate, SourceDescriptor, SourceId};
pub use transport::{ChunkSink, Connection, SourceTransport};
pub use worker::DownloadWorker;
