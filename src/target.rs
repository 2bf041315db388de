//! Immutable target descriptors an invocation is bound to.

use crate::proto::Identity;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

pub const CURRENT_PROTOCOL: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

pub const CURRENT_ENCODING: EncodingVersion = EncodingVersion { major: 1, minor: 0 };

/// How an operation interacts with remote state, which gates retry after a
/// request already went on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationMode {
    Normal = 0,
    Idempotent = 1,
}

/// How requests to the target are delivered and completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// Request and reply; done when the reply arrives.
    Twoway,
    /// No reply expected; done at the moment of send.
    Oneway,
    /// Accumulated into a shared buffer, flushed later in one batch.
    Batch,
}

impl InvocationMode {
    #[inline]
    pub fn is_twoway(self) -> bool {
        self == InvocationMode::Twoway
    }

    #[inline]
    pub fn is_batch(self) -> bool {
        self == InvocationMode::Batch
    }
}

/// Reference descriptor for the remote (or collocated) target of an
/// invocation. Immutable once built; a retried attempt re-resolves the
/// delivery channel but never the descriptor.
#[derive(Debug, Clone)]
pub struct TargetRef {
    pub identity: Identity,
    pub facet: String,
    pub mode: InvocationMode,
    pub protocol: ProtocolVersion,
    pub encoding: EncodingVersion,
    /// Overrides [ClientConfig::invocation_timeout](crate::ClientConfig) when set.
    pub invocation_timeout: Option<Duration>,
    pub context: HashMap<String, String>,
}

impl TargetRef {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            facet: String::new(),
            mode: InvocationMode::Twoway,
            protocol: CURRENT_PROTOCOL,
            encoding: CURRENT_ENCODING,
            invocation_timeout: None,
            context: HashMap::new(),
        }
    }
}
