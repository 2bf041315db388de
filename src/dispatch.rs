//! The seam between the invocation engine and request transports.
//!
//! A [RequestChannel] is anything able to carry one encoded request to a
//! servant: a connection, a batch accumulator, or the in-process
//! [CollocatedChannel]. The engine resolves a channel per attempt through
//! a [ChannelResolver], so routing policy stays outside the send loop.

use crate::engine::Engine;
use crate::error::InvokeError;
use crate::invocation::Invocation;
use log::trace;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Outcome of handing a request to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncStatus {
    /// The request reached the wire before the call returned.
    pub sent: bool,
    /// The caller still owes the sent callback for this attempt. A channel
    /// that schedules the callback itself leaves this false.
    pub invoke_sent_callback: bool,
}

impl AsyncStatus {
    pub const QUEUED: AsyncStatus = AsyncStatus { sent: false, invoke_sent_callback: false };
    pub const SENT: AsyncStatus = AsyncStatus { sent: true, invoke_sent_callback: false };

    pub fn sent_with_callback() -> AsyncStatus {
        AsyncStatus { sent: true, invoke_sent_callback: true }
    }
}

/// A component able to abort an in-flight attempt.
pub trait CancellationHandler: Send + Sync {
    /// Stop tracking `out` and complete it with `ex` unless a terminal
    /// outcome already won. Must tolerate racing with that outcome.
    fn request_canceled(&self, out: &Arc<Invocation>, ex: InvokeError);
}

/// One hop capable of carrying requests.
///
/// Implementations must register themselves for cancellation via
/// [Invocation::cancelable] before queueing the request, mark delivery
/// with [Invocation::sent] exactly once per physical send, and route
/// replies of two-way requests through [Invocation::response].
pub trait RequestChannel: Send + Sync {
    fn send_async_request(&self, out: &Arc<Invocation>) -> Result<AsyncStatus, InvokeError>;
}

/// Per-attempt channel selection.
pub trait ChannelResolver: Send + Sync {
    fn resolve(&self) -> Result<Arc<dyn RequestChannel>, InvokeError>;

    /// Forget a channel that failed as stale, so the next resolution does
    /// not hand it out again.
    fn clear_cached(&self, _channel: &Arc<dyn RequestChannel>) {}
}

/// Resolver pinned to one channel. Useful for tests and for proxies bound
/// to an explicit connection.
pub struct FixedResolver {
    channel: Arc<dyn RequestChannel>,
}

impl FixedResolver {
    pub fn new(channel: Arc<dyn RequestChannel>) -> Arc<Self> {
        Arc::new(Self { channel })
    }
}

impl ChannelResolver for FixedResolver {
    fn resolve(&self) -> Result<Arc<dyn RequestChannel>, InvokeError> {
        Ok(Arc::clone(&self.channel))
    }
}

/// Servant entry point of a collocated channel.
pub type DispatchFn = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// In-process channel: requests bypass the wire and are dispatched to a
/// servant closure on the engine's runtime. The caller's thread never
/// runs the servant, so collocated calls keep asynchronous semantics.
pub struct CollocatedChannel {
    engine: Arc<Engine>,
    dispatch: DispatchFn,
    /// Invocations handed off but not yet dispatched. Cancellation and the
    /// dispatch task race on removal; the remover wins the invocation.
    pending: Mutex<HashSet<u64>>,
    weak_self: Weak<CollocatedChannel>,
}

impl CollocatedChannel {
    pub fn new(engine: Arc<Engine>, dispatch: DispatchFn) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            engine,
            dispatch,
            pending: Mutex::new(HashSet::new()),
            weak_self: weak_self.clone(),
        })
    }

    fn dispatch_task(self: Arc<Self>, out: Arc<Invocation>) {
        if !self.pending.lock().remove(&out.id()) {
            // canceled before dispatch
            return;
        }
        if out.sent() {
            out.invoke_sent_async();
        }
        let request = out.request_bytes();
        let reply = panic::catch_unwind(AssertUnwindSafe(|| (self.dispatch)(&request)));
        if !out.is_twoway() {
            return;
        }
        match reply {
            Ok(reply) => {
                if out.response(&reply) {
                    out.invoke_response_async();
                }
            }
            Err(_) => {
                if out.exception(InvokeError::Unknown("dispatch panicked".into())) {
                    out.invoke_exception_async();
                }
            }
        }
    }
}

impl RequestChannel for CollocatedChannel {
    fn send_async_request(&self, out: &Arc<Invocation>) -> Result<AsyncStatus, InvokeError> {
        let this = self.weak_self.upgrade().ok_or(InvokeError::Shutdown)?;
        let handler: Arc<dyn CancellationHandler> = Arc::clone(&this) as _;
        // The entry must exist before the handler is live, or a cancel
        // arriving in between has nothing to remove.
        self.pending.lock().insert(out.id());
        if let Err(ex) = out.cancelable(&handler) {
            self.pending.lock().remove(&out.id());
            return Err(ex);
        }
        out.attach_collocated_observer();
        trace!("collocated dispatch queued for invocation {}", out.id());
        let out = Arc::clone(out);
        self.engine.spawn(async move {
            this.dispatch_task(out);
        });
        Ok(AsyncStatus::QUEUED)
    }
}

impl CancellationHandler for CollocatedChannel {
    fn request_canceled(&self, out: &Arc<Invocation>, ex: InvokeError) {
        if !self.pending.lock().remove(&out.id()) {
            // the dispatch task won the race; the outcome stands
            return;
        }
        if out.exception(ex) {
            out.invoke_exception_async();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RequestBuffer;
    use crate::config::ClientConfig;
    use crate::delivery::WaitDelivery;
    use crate::proto::{self, Identity, ReplyStatus};
    use crate::target::{OperationMode, TargetRef};

    fn echo_dispatch() -> DispatchFn {
        Arc::new(|request: &[u8]| {
            let mut reply = RequestBuffer::new();
            proto::encode_payload_reply(&mut reply, ReplyStatus::Ok, request);
            reply.into_vec()
        })
    }

    #[test]
    fn test_collocated_twoway_reply() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let engine = Engine::new(ClientConfig::default(), rt.handle().clone());
        let channel = CollocatedChannel::new(Arc::clone(&engine), echo_dispatch());
        let delivery = WaitDelivery::new();
        let out = Invocation::new(
            Arc::clone(&engine),
            TargetRef::new(Identity::new("obj", "")),
            "echo",
            OperationMode::Normal,
            delivery.clone(),
            FixedResolver::new(channel),
            None,
            None,
        );
        out.request().lock().write_bytes(b"payload");

        out.invoke().unwrap();
        let reply = delivery.wait().unwrap();
        assert!(reply.ok);
        assert_eq!(reply.payload, b"payload");
        assert!(out.is_done());
    }

    #[test]
    fn test_cancel_before_dispatch_wins() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let engine = Engine::new(ClientConfig::default(), rt.handle().clone());
        // servant never consulted when cancellation removes the entry first
        let dispatch: DispatchFn = Arc::new(|_| panic!("dispatched after cancel"));
        let channel = CollocatedChannel::new(Arc::clone(&engine), dispatch);
        let delivery = WaitDelivery::new();
        let out = Invocation::new(
            Arc::clone(&engine),
            TargetRef::new(Identity::new("obj", "")),
            "slow",
            OperationMode::Normal,
            delivery.clone(),
            FixedResolver::new(Arc::clone(&channel) as Arc<dyn RequestChannel>),
            None,
            None,
        );

        // bypass the spawn so the race is deterministic
        let handler: Arc<dyn CancellationHandler> = Arc::clone(&channel) as _;
        out.cancelable(&handler).unwrap();
        channel.pending.lock().insert(out.id());

        channel.request_canceled(&out, InvokeError::Canceled);
        assert_eq!(delivery.wait(), Err(InvokeError::Canceled));

        // losing side of the race is inert
        Arc::clone(&channel).dispatch_task(Arc::clone(&out));
        assert_eq!(out.exception_value(), Some(InvokeError::Canceled));
    }

    #[test]
    fn test_pending_cancellation_refuses_the_send_without_leaking() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let engine = Engine::new(ClientConfig::default(), rt.handle().clone());
        let dispatch: DispatchFn = Arc::new(|_| panic!("dispatched after cancel"));
        let channel = CollocatedChannel::new(Arc::clone(&engine), dispatch);
        let delivery = WaitDelivery::new();
        let out = Invocation::new(
            Arc::clone(&engine),
            TargetRef::new(Identity::new("obj", "")),
            "slow",
            OperationMode::Normal,
            delivery.clone(),
            FixedResolver::new(Arc::clone(&channel) as Arc<dyn RequestChannel>),
            None,
            None,
        );

        out.cancel();
        out.invoke().unwrap();

        assert_eq!(delivery.wait(), Err(InvokeError::Canceled));
        // the refused send left nothing behind for a dispatch task to claim
        assert!(channel.pending.lock().is_empty());
    }
}
