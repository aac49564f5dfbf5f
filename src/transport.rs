//! Contracts for the collaborators this crate consumes but does not own:
//! the wire transport that produces connections and the chunk sink that
//! persists and verifies downloaded bytes.

use crate::error::DownloadError;
use crate::range_set::ByteRange;
use crate::source::SourceDescriptor;
use async_trait::async_trait;

/// Disk-side consumer of downloaded bytes. Verification and write
/// buffering happen behind this boundary.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Accepts bytes at an absolute file offset.
    async fn write(&self, offset: u64, data: &[u8]) -> Result<(), DownloadError>;

    /// True once accumulated corruption makes the download hopeless; the
    /// coordinator reacts by cancelling every worker.
    fn is_hopeless(&self) -> bool {
        false
    }
}

/// One established connection to a source, direct or pushed.
#[async_trait]
pub trait Connection: Send {
    /// Whether the source advertises hash-tree metadata worth fetching.
    fn offers_metadata(&self) -> bool;

    /// Fetches hash-tree metadata. Failure is sticky for the source.
    async fn fetch_metadata(&mut self) -> Result<(), DownloadError>;

    /// Asks the source for a byte range. The server may grant a
    /// sub-range; the granted range is returned. Refusals surface as the
    /// corresponding `DownloadError` kind (queued, busy, range
    /// unavailable, ...).
    async fn request_range(&mut self, range: ByteRange) -> Result<ByteRange, DownloadError>;

    /// Streams the granted body into the sink. Returns bytes transferred.
    async fn download(
        &mut self,
        granted: ByteRange,
        sink: &dyn ChunkSink,
    ) -> Result<u64, DownloadError>;

    /// Whether the connection may be reused for further range requests.
    fn is_http11(&self) -> bool;
}

/// Factory for connections; owns sockets, timeouts and protocol framing.
#[async_trait]
pub trait SourceTransport: Send + Sync + 'static {
    type Conn: Connection + 'static;

    /// Opens a direct connection to the source's address.
    async fn connect_direct(
        &self,
        descriptor: &SourceDescriptor,
    ) -> Result<Self::Conn, DownloadError>;

    /// Asks a firewalled source, via its push proxies, to connect back.
    /// The resulting connection arrives out-of-band through the push
    /// rendezvous.
    async fn solicit_push(&self, descriptor: &SourceDescriptor) -> Result<(), DownloadError>;
}
