//! Error taxonomy for the invocation engine.
//!
//! Retry decisions never match on concrete error variants; every error maps
//! to a [FailureKind] tag and the retry policy consumes only the tag.

use crate::proto::Identity;
use std::fmt;

/// Identity/facet/operation triple reported by the peer for the
/// `*NotExist` reply statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotExist {
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
}

impl fmt::Display for NotExist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "identity={}, facet={:?}, operation={:?}",
            self.identity, self.facet, self.operation
        )
    }
}

/// Every failure an invocation can terminate with, or recover from.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    /// Could not establish a connection to the target.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// An established connection failed mid-request.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The peer closed the connection gracefully before dispatching the
    /// request. Safe to retry even for non-idempotent operations.
    #[error("connection closed by peer")]
    ClosedByPeer,

    /// No delivery channel could be resolved for the target.
    #[error("no usable route to target: {0}")]
    NoRoute(String),

    /// A cached channel went stale between resolution and send. The send
    /// loop re-resolves immediately without consuming a retry slot.
    #[error("cached channel is no longer valid")]
    StaleChannel,

    /// The engine was destroyed while the invocation was in flight.
    #[error("invocation engine shut down")]
    Shutdown,

    /// The caller canceled the invocation.
    #[error("invocation canceled")]
    Canceled,

    /// The invocation timeout elapsed before a terminal outcome.
    #[error("invocation timed out")]
    TimedOut,

    /// Malformed data encountered while decoding a reply.
    #[error("marshal error: {0}")]
    Marshal(String),

    /// The peer violated the reply protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The target descriptor names a protocol major version this engine
    /// cannot speak.
    #[error("cannot send request using protocol version {major}.{minor}")]
    UnsupportedProtocol { major: u8, minor: u8 },

    /// The peer has no object with the requested identity.
    #[error("object does not exist: {0}")]
    ObjectNotExist(NotExist),

    /// The peer has the object but not the requested facet.
    #[error("facet does not exist: {0}")]
    FacetNotExist(NotExist),

    /// The peer has the object but not the requested operation.
    #[error("operation does not exist: {0}")]
    OperationNotExist(NotExist),

    /// The peer's dispatch failed with an exception it could not classify.
    #[error("unknown exception: {0}")]
    Unknown(String),

    /// The peer's dispatch failed with a local exception on its side.
    #[error("unknown local exception: {0}")]
    UnknownLocal(String),

    /// The peer's dispatch raised a user exception the operation does not
    /// declare.
    #[error("unknown user exception: {0}")]
    UnknownUser(String),
}

/// Closed classification consumed by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient transport or routing failure, retryable by policy.
    Transient,
    /// Graceful close before dispatch, retryable even after a send.
    CloseRetryable,
    /// Stale cached channel, re-resolve and retry immediately, uncounted.
    Stale,
    /// Permanent local condition, never retried.
    Local,
    /// Malformed or protocol-violating reply, never retried.
    Decode,
    /// Definitive answer from the peer, never retried.
    Remote,
}

impl InvokeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            InvokeError::ConnectFailed(_)
            | InvokeError::ConnectionLost(_)
            | InvokeError::NoRoute(_) => FailureKind::Transient,
            InvokeError::ClosedByPeer => FailureKind::CloseRetryable,
            InvokeError::StaleChannel => FailureKind::Stale,
            InvokeError::Shutdown | InvokeError::Canceled | InvokeError::TimedOut => {
                FailureKind::Local
            }
            InvokeError::Marshal(_)
            | InvokeError::Protocol(_)
            | InvokeError::UnsupportedProtocol { .. } => FailureKind::Decode,
            InvokeError::ObjectNotExist(_)
            | InvokeError::FacetNotExist(_)
            | InvokeError::OperationNotExist(_)
            | InvokeError::Unknown(_)
            | InvokeError::UnknownLocal(_)
            | InvokeError::UnknownUser(_) => FailureKind::Remote,
        }
    }

    /// Stable name recorded by telemetry observers.
    pub fn id(&self) -> &'static str {
        match self {
            InvokeError::ConnectFailed(_) => "ConnectFailed",
            InvokeError::ConnectionLost(_) => "ConnectionLost",
            InvokeError::ClosedByPeer => "ClosedByPeer",
            InvokeError::NoRoute(_) => "NoRoute",
            InvokeError::StaleChannel => "StaleChannel",
            InvokeError::Shutdown => "Shutdown",
            InvokeError::Canceled => "Canceled",
            InvokeError::TimedOut => "TimedOut",
            InvokeError::Marshal(_) => "Marshal",
            InvokeError::Protocol(_) => "Protocol",
            InvokeError::UnsupportedProtocol { .. } => "UnsupportedProtocol",
            InvokeError::ObjectNotExist(_) => "ObjectNotExist",
            InvokeError::FacetNotExist(_) => "FacetNotExist",
            InvokeError::OperationNotExist(_) => "OperationNotExist",
            InvokeError::Unknown(_) => "Unknown",
            InvokeError::UnknownLocal(_) => "UnknownLocal",
            InvokeError::UnknownUser(_) => "UnknownUser",
        }
    }
}

pub type Result<T> = std::result::Result<T, InvokeError>;
