//! Crate-wide error taxonomy
//!
//! Every error variant here maps directly to one of the error kinds named
//! in the broker client contract: invalid arguments are raised synchronously
//! to the caller, transport/protocol errors surface from connection I/O, and
//! publish-path errors surface from the [`crate::publisher::Publisher`].

use std::io;

use thiserror::Error;

/// A malformed argument was passed to a publisher or subscriber call
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvalidArgument {
    /// The topic name failed validation
    #[error("invalid topic name {0:?}")]
    Topic(String),
    /// The channel name failed validation
    #[error("invalid channel name {0:?}")]
    Channel(String),
    /// A batch publish was attempted with an empty payload list
    #[error("batch publish requires at least one payload")]
    EmptyBatch,
}

/// The underlying TCP connection to a broker node failed
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The connection could not be opened
    #[error("failed to connect to {0}")]
    Connect(String, #[source] io::Error),
    /// A read or write on an established connection failed
    #[error("I/O error on connection to {0}")]
    Io(String, #[source] io::Error),
    /// The connection was closed by the peer
    #[error("connection to {0} closed")]
    Closed(String),
}

/// The broker sent a frame or reply that did not match the expected protocol
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The handshake reply was not the expected `OK`
    #[error("unexpected handshake reply: {0}")]
    Handshake(String),
    /// A reply frame could not be decoded
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The broker replied with an unexpected frame type for the command sent
    #[error("unexpected reply frame for {command}: {reply}")]
    UnexpectedReply {
        /// The command that was sent
        command: &'static str,
        /// The reply actually received
        reply: String,
    },
}

/// The broker rejected a `PUB`/`MPUB` command
#[derive(Debug, Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// An atomic (all-or-nothing) batch publish failed
///
/// Carries the underlying cause and the size of the batch that was rejected.
/// Per-message fallback is never attempted when this error is raised.
#[derive(Debug, Error)]
#[error("Atomic batch publishing failed for {batch_size} message(s): {cause}")]
pub struct AtomicBatchPublishFailed {
    /// Number of payloads in the batch that failed
    pub batch_size: usize,
    /// The underlying transport/protocol/publish error
    #[source]
    pub cause: Box<PublishFailed>,
}

/// A single-message publish failed, after the retry on a different node
#[derive(Debug, Error)]
#[error("publish failed: {0}")]
pub struct PublishFailed(#[from] pub PublishCause);

/// The underlying cause of a failed publish attempt
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PublishCause {
    /// Error at the transport layer
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Error at the protocol layer
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The broker rejected the command
    #[error(transparent)]
    Rejected(#[from] PublishError),
}

/// A discovery HTTP lookup failed
///
/// Never surfaced to a caller: only used to drive the per-URL failure
/// counter and log-level escalation in [`crate::subscriber`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub(crate) enum LookupFailure {
    /// The HTTP request itself failed (connect/read timeout, DNS, etc.)
    #[error("lookup request to {0} failed")]
    Request(String, #[source] reqwest::Error),
    /// The response body was not valid JSON in either envelope shape
    #[error("lookup response from {0} was not valid JSON")]
    Decode(String, #[source] serde_json::Error),
}

/// The balance strategy has no configured broker nodes
#[derive(Debug, Error)]
#[error("no broker nodes are configured")]
pub struct NoNodesAvailable;

/// Top-level error returned by [`crate::publisher::Publisher`] publish calls
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PublisherError {
    /// Synchronous argument validation failed
    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),
    /// No nodes are configured for this topic
    #[error(transparent)]
    NoNodesAvailable(#[from] NoNodesAvailable),
    /// A single-message publish failed on every attempted node
    #[error(transparent)]
    PublishFailed(#[from] PublishFailed),
    /// An atomic batch publish failed
    #[error(transparent)]
    AtomicBatchPublishFailed(#[from] AtomicBatchPublishFailed),
}
