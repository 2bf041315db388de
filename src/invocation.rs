//! The in-flight invocation state machine.
//!
//! One [Invocation] persists across every physical send attempt of a
//! logical call. Completion can arrive concurrently from the channel's
//! reply path, the cancellation timer, the retry queue and the calling
//! thread; the state bits are guarded by one lock held only for the
//! test-and-set critical sections, and exactly one completion source wins.
//!
//! Lock discipline: the invocation lock is never held while calling into
//! a channel, a resolver, the retry queue, the timer, or user code. The
//! delivery strategy's `handle_*` hooks run under it; its `invoke_*`
//! hooks never do. The request buffer has its own leaf lock.

use crate::batch::BatchQueue;
use crate::buffer::RequestBuffer;
use crate::delivery::ResultDelivery;
use crate::dispatch::{CancellationHandler, ChannelResolver, RequestChannel};
use crate::engine::Engine;
use crate::error::{FailureKind, InvokeError};
use crate::exec::{CallbackKind, CallbackTask};
use crate::observer::{AttemptObserver, InvocationObserver, RootObserver};
use crate::proto;
use crate::retry::check_retry;
use crate::target::{OperationMode, TargetRef};
use crate::timer::TimerToken;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const STATE_OK: u8 = 0x1;
const STATE_SENT: u8 = 0x2;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    state: u8,
    /// Terminal at the moment of send (one-way, batch).
    done_in_sent: bool,
    /// Terminal response or exception recorded.
    completed: bool,
    sent_synchronously: bool,
    /// Current attempt reached the wire; gates retry of non-idempotent ops.
    sent: bool,
    /// Failure count across attempts.
    cnt: u32,
    ex: Option<InvokeError>,
    cancellation_handler: Option<Arc<dyn CancellationHandler>>,
    /// Cancellation requested while no handler was attached; aborts the
    /// next attempt before it is sent.
    cancellation_ex: Option<InvokeError>,
    cached_channel: Option<Arc<dyn RequestChannel>>,
    timer: Option<TimerToken>,
    observer: RootObserver,
    child_observer: AttemptObserver,
    reply_ok: bool,
    reply_payload: Option<Vec<u8>>,
}

pub struct Invocation {
    id: u64,
    engine: Arc<Engine>,
    target: TargetRef,
    operation: String,
    mode: OperationMode,
    delivery: Arc<dyn ResultDelivery>,
    resolver: Arc<dyn ChannelResolver>,
    batch: Option<Arc<BatchQueue>>,
    request: Mutex<RequestBuffer>,
    inner: Mutex<Inner>,
}

impl Invocation {
    pub(crate) fn new(
        engine: Arc<Engine>,
        target: TargetRef,
        operation: &str,
        mode: OperationMode,
        delivery: Arc<dyn ResultDelivery>,
        resolver: Arc<dyn ChannelResolver>,
        batch: Option<Arc<BatchQueue>>,
        observer: Option<Arc<dyn InvocationObserver>>,
    ) -> Arc<Self> {
        let mut root = RootObserver::default();
        root.attach(observer);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            engine,
            target,
            operation: operation.to_string(),
            mode,
            delivery,
            resolver,
            batch,
            request: Mutex::new(RequestBuffer::new()),
            inner: Mutex::new(Inner {
                state: 0,
                done_in_sent: false,
                completed: false,
                sent_synchronously: false,
                sent: false,
                cnt: 0,
                ex: None,
                cancellation_handler: None,
                cancellation_ex: None,
                cached_channel: None,
                timer: None,
                observer: root,
                child_observer: AttemptObserver::default(),
                reply_ok: false,
                reply_payload: None,
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    #[inline]
    pub fn is_twoway(&self) -> bool {
        self.target.mode.is_twoway()
    }

    /// Whether the request of the current attempt reached the wire.
    pub fn is_sent(&self) -> bool {
        self.inner.lock().state & STATE_SENT != 0
    }

    /// Whether a terminal outcome was recorded.
    pub fn is_done(&self) -> bool {
        let inner = self.inner.lock();
        inner.completed || inner.done_in_sent
    }

    /// The terminal exception, if the invocation failed.
    pub fn exception_value(&self) -> Option<InvokeError> {
        self.inner.lock().ex.clone()
    }

    /// The encoded request; channels snapshot it per attempt.
    pub fn request_bytes(&self) -> Vec<u8> {
        self.request.lock().as_slice().to_vec()
    }

    pub(crate) fn request(&self) -> &Mutex<RequestBuffer> {
        &self.request
    }

    fn timeout(&self) -> Option<Duration> {
        self.target.invocation_timeout.or(self.engine.config().invocation_timeout)
    }

    fn disarm_timer(&self) {
        let token = self.inner.lock().timer.take();
        if let Some(token) = token {
            self.engine.timer().cancel(token);
        }
    }

    /// Attach a remote child observer for the current attempt. Called by
    /// connection-backed channels before transmitting.
    pub fn attach_remote_observer(&self) {
        let size = self.request.lock().len();
        let mut inner = self.inner.lock();
        let observer = inner.observer.remote_observer(size);
        inner.child_observer.attach(observer);
    }

    /// Collocated counterpart of [attach_remote_observer](Self::attach_remote_observer).
    pub fn attach_collocated_observer(&self) {
        let size = self.request.lock().len();
        let mut inner = self.inner.lock();
        let observer = inner.observer.collocated_observer(size);
        inner.child_observer.attach(observer);
    }

    /// Mark the current attempt sent. Called exactly once per physical
    /// send by the channel that transmitted the request; a one-way or
    /// batched invocation becomes terminal here. Returns whether the sent
    /// callback must still be delivered.
    pub fn sent(self: &Arc<Self>) -> bool {
        self.sent_impl(!self.is_twoway())
    }

    pub(crate) fn sent_impl(&self, done: bool) -> bool {
        if done {
            self.disarm_timer();
        }
        let mut inner = self.inner.lock();
        inner.sent = true;
        let already_sent = inner.state & STATE_SENT != 0;
        inner.state |= STATE_SENT;
        if done {
            inner.done_in_sent = true;
            inner.child_observer.detach();
            inner.cancellation_handler = None;
        }
        let invoke = self.delivery.handle_sent(done, already_sent);
        if !invoke && inner.done_in_sent {
            inner.observer.detach();
        }
        invoke
    }

    /// Report an attempt failure, consulting the retry policy. Safe to
    /// call with the channel's lock held: a retry is never run inline,
    /// even for a zero interval. Returns whether the caller must deliver
    /// the exception callback.
    pub fn exception(self: &Arc<Self>, ex: InvokeError) -> bool {
        {
            let mut inner = self.inner.lock();
            inner.child_observer.failed(ex.id());
            inner.child_observer.detach();
            inner.cached_channel = None;
        }
        match self.consult_retry(&ex) {
            Ok(interval) => match self.engine.retry_queue().add(Arc::clone(self), interval) {
                Ok(()) => false,
                Err(shutdown) => self.exception_impl(shutdown),
            },
            Err(fatal) => self.exception_impl(fatal),
        }
    }

    fn consult_retry(&self, ex: &InvokeError) -> Result<Duration, InvokeError> {
        let (sent, cnt) = {
            let mut inner = self.inner.lock();
            inner.cnt += 1;
            (inner.sent, inner.cnt)
        };
        check_retry(ex.clone(), self.mode, sent, cnt, &self.engine.config().retry_intervals)
    }

    /// Record the terminal exception. Returns whether the exception
    /// callback must be delivered.
    pub(crate) fn exception_impl(&self, ex: InvokeError) -> bool {
        self.disarm_timer();
        debug!("invocation {} ({}) failed: {}", self.id, self.operation, ex);
        let mut inner = self.inner.lock();
        debug_assert!(!inner.completed, "exception after a terminal outcome");
        inner.child_observer.failed(ex.id());
        inner.child_observer.detach();
        inner.observer.failed(ex.id());
        inner.cancellation_handler = None;
        inner.completed = true;
        let invoke = self.delivery.handle_exception(&ex);
        inner.ex = Some(ex);
        if !invoke {
            inner.observer.detach();
        }
        invoke
    }

    /// Record the terminal response. A delivery-strategy decode failure
    /// converts into the exception path. Returns whether the response (or
    /// converted exception) callback must be delivered.
    pub(crate) fn response_impl(&self, ok: bool, invoke: bool) -> bool {
        self.disarm_timer();
        let mut inner = self.inner.lock();
        debug_assert!(!inner.completed, "response after a terminal outcome");
        if ok {
            inner.state |= STATE_OK;
        }
        inner.cancellation_handler = None;
        inner.completed = true;
        let invoke = match self.delivery.handle_response(ok) {
            Ok(wants) => invoke && wants,
            Err(ex) => {
                let wants = self.delivery.handle_exception(&ex);
                inner.ex = Some(ex);
                wants
            }
        };
        if !invoke {
            inner.observer.detach();
        }
        invoke
    }

    /// Interpret raw reply bytes for the current attempt. Called by the
    /// channel from its reply-parsing path, possibly with the channel's
    /// own lock held; never blocks and never runs user code. Returns
    /// whether the caller must schedule the response callback.
    pub fn response(self: &Arc<Self>, reply: &[u8]) -> bool {
        debug_assert!(self.is_twoway());
        {
            let mut inner = self.inner.lock();
            inner.child_observer.reply(reply.len());
            inner.child_observer.detach();
        }
        match proto::parse_reply(reply) {
            Ok(parsed) => {
                trace!("invocation {} ({}) reply ok={}", self.id, self.operation, parsed.ok);
                {
                    let mut inner = self.inner.lock();
                    if !parsed.ok {
                        inner.observer.user_exception();
                    }
                    inner.reply_ok = parsed.ok;
                    inner.reply_payload = Some(parsed.payload);
                }
                self.response_impl(parsed.ok, true)
            }
            // Remote and decode failures classify as non-retryable, so
            // this reaches exception_impl; routing through the retry
            // consultation keeps one code path for every attempt failure.
            Err(ex) => self.exception(ex),
        }
    }

    /// Cancel the invocation on behalf of the caller.
    pub fn cancel(self: &Arc<Self>) {
        self.cancel_with(InvokeError::Canceled);
    }

    /// Cancellation with a caller-chosen exception; the timeout path uses
    /// [InvokeError::TimedOut]. Routed through the component currently
    /// able to abort the in-flight attempt, or stored for replay when no
    /// attempt is in flight yet.
    pub fn cancel_with(self: &Arc<Self>, ex: InvokeError) {
        let handler = {
            let mut inner = self.inner.lock();
            match inner.cancellation_handler.clone() {
                Some(handler) => handler,
                None => {
                    inner.cancellation_ex = Some(ex);
                    return;
                }
            }
        };
        handler.request_canceled(self, ex);
    }

    /// Attach the component able to cancel the upcoming attempt. Fails
    /// with the pending cancellation, clearing it, when `cancel` was
    /// called while no handler was attached.
    pub fn cancelable(&self, handler: &Arc<dyn CancellationHandler>) -> Result<(), InvokeError> {
        let mut inner = self.inner.lock();
        if let Some(ex) = inner.cancellation_ex.take() {
            return Err(ex);
        }
        inner.cancellation_handler = Some(Arc::clone(handler));
        Ok(())
    }

    /// Issue the call from the caller's thread. A batched invocation
    /// finishes into its queue and is terminal immediately; anything else
    /// runs the send loop. Synchronous failures are delivered through the
    /// registered exception callback when there is one.
    pub fn invoke(self: &Arc<Self>) -> Result<(), InvokeError> {
        if self.engine.is_destroyed() {
            return self.abort(InvokeError::Shutdown);
        }
        if let Some(batch) = &self.batch {
            self.inner.lock().sent_synchronously = true;
            {
                let mut request = self.request.lock();
                batch.finish_request(&mut request, &self.operation);
            }
            // no sent/response callbacks for batched requests
            self.response_impl(true, false);
            return Ok(());
        }
        match self.invoke_impl(true) {
            Ok(()) => Ok(()),
            Err(ex) => self.abort(ex),
        }
    }

    /// Rerun the send algorithm; the retry queue's entry point.
    pub(crate) fn retry(self: &Arc<Self>) {
        let _ = self.invoke_impl(false);
    }

    /// The timeout fired.
    pub(crate) fn run_timer_task(self: &Arc<Self>) {
        self.cancel_with(InvokeError::TimedOut);
    }

    /// Force-terminate without another send attempt. A batched invocation
    /// notifies its queue that the ownership transfer is aborted. Unless
    /// the exception callback takes the failure, a shutdown is returned to
    /// the caller rather than swallowed.
    pub fn abort(self: &Arc<Self>, ex: InvokeError) -> Result<(), InvokeError> {
        {
            let inner = self.inner.lock();
            if inner.completed || inner.done_in_sent {
                debug_assert!(false, "abort of an already-completed invocation");
                return Ok(());
            }
        }
        if let Some(batch) = &self.batch {
            let mut request = self.request.lock();
            batch.abort_request(&mut request);
        }
        if self.exception_impl(ex.clone()) {
            self.invoke_exception_async();
            Ok(())
        } else if ex == InvokeError::Shutdown {
            Err(ex)
        } else {
            Ok(())
        }
    }

    fn invoke_impl(self: &Arc<Self>, user_thread: bool) -> Result<(), InvokeError> {
        match self.invoke_loop(user_thread) {
            Ok(()) => Ok(()),
            Err(ex) => {
                if user_thread {
                    // the caller converts this into abort(ex)
                    Err(ex)
                } else {
                    if self.exception_impl(ex) {
                        self.invoke_exception_async();
                    }
                    Ok(())
                }
            }
        }
    }

    /// The send algorithm: resolve a channel, deliver, classify failures.
    fn invoke_loop(self: &Arc<Self>, user_thread: bool) -> Result<(), InvokeError> {
        if user_thread {
            if let Some(timeout) = self.timeout() {
                let token = self.engine.timer().schedule(Arc::clone(self), timeout)?;
                self.inner.lock().timer = Some(token);
            }
        } else {
            self.inner.lock().observer.retried();
        }
        loop {
            self.inner.lock().sent = false;
            let attempt = self.resolver.resolve().and_then(|channel| {
                self.inner.lock().cached_channel = Some(Arc::clone(&channel));
                channel.send_async_request(self)
            });
            match attempt {
                Ok(status) => {
                    if status.sent {
                        if user_thread {
                            self.inner.lock().sent_synchronously = true;
                            if status.invoke_sent_callback {
                                // safe on the caller's own thread
                                self.invoke_sent();
                            }
                        } else if status.invoke_sent_callback {
                            self.invoke_sent_async();
                        }
                    }
                    return Ok(());
                }
                Err(ex) if ex.kind() == FailureKind::Stale => {
                    // the route went bad between resolution and send;
                    // re-resolve without consuming a retry slot
                    trace!("invocation {}: stale channel, re-resolving: {}", self.id, ex);
                    let cached = self.inner.lock().cached_channel.take();
                    if let Some(channel) = cached {
                        self.resolver.clear_cached(&channel);
                    }
                    continue;
                }
                Err(ex) => {
                    {
                        let mut inner = self.inner.lock();
                        inner.child_observer.failed(ex.id());
                        inner.child_observer.detach();
                    }
                    let interval = self.consult_retry(&ex)?;
                    if !interval.is_zero() {
                        self.engine.retry_queue().add(Arc::clone(self), interval)?;
                        return Ok(());
                    }
                    self.inner.lock().observer.retried();
                    // zero interval: rerun the loop on this thread
                }
            }
        }
    }

    pub(crate) fn invoke_sent(self: &Arc<Self>) {
        let sent_synchronously = self.inner.lock().sent_synchronously;
        let delivery = &self.delivery;
        if panic::catch_unwind(AssertUnwindSafe(|| delivery.invoke_sent(sent_synchronously)))
            .is_err()
        {
            self.warn_callback("sent");
        }
        let mut inner = self.inner.lock();
        if inner.done_in_sent {
            inner.observer.detach();
        }
    }

    pub(crate) fn invoke_exception(self: &Arc<Self>) {
        let ex = self.inner.lock().ex.clone();
        let Some(ex) = ex else { return };
        let delivery = &self.delivery;
        if panic::catch_unwind(AssertUnwindSafe(|| delivery.invoke_exception(ex))).is_err() {
            self.warn_callback("exception");
        }
        self.inner.lock().observer.detach();
    }

    pub(crate) fn invoke_response(self: &Arc<Self>) {
        // a decode failure recorded during completion wins over the reply
        if self.inner.lock().ex.is_some() {
            self.invoke_exception();
            return;
        }
        let (ok, payload) = {
            let mut inner = self.inner.lock();
            (inner.reply_ok, inner.reply_payload.take().unwrap_or_default())
        };
        let delivery = &self.delivery;
        if panic::catch_unwind(AssertUnwindSafe(|| delivery.invoke_response(ok, &payload)))
            .is_err()
        {
            self.warn_callback("response");
        }
        self.inner.lock().observer.detach();
    }

    /// Deliver the sent callback from the executor. Best effort: a failure
    /// to report sent is never escalated over the primary outcome.
    pub fn invoke_sent_async(self: &Arc<Self>) {
        if self
            .engine
            .executor()
            .submit(CallbackTask { invocation: Arc::clone(self), kind: CallbackKind::Sent })
            .is_err()
        {
            debug!("invocation {}: sent callback dropped, executor gone", self.id);
        }
    }

    /// Deliver the exception callback from the executor. Falls back to the
    /// current thread when the executor is already shut down, so the
    /// terminal outcome always reaches the delivery strategy.
    pub fn invoke_exception_async(self: &Arc<Self>) {
        if self
            .engine
            .executor()
            .submit(CallbackTask { invocation: Arc::clone(self), kind: CallbackKind::Exception })
            .is_err()
        {
            warn!("invocation {}: executor gone, exception callback runs inline", self.id);
            self.invoke_exception();
        }
    }

    /// Deliver the response callback from the executor, with the same
    /// inline fallback as [invoke_exception_async](Self::invoke_exception_async).
    pub fn invoke_response_async(self: &Arc<Self>) {
        if self
            .engine
            .executor()
            .submit(CallbackTask { invocation: Arc::clone(self), kind: CallbackKind::Response })
            .is_err()
        {
            warn!("invocation {}: executor gone, response callback runs inline", self.id);
            self.invoke_response();
        }
    }

    fn warn_callback(&self, which: &str) {
        if self.engine.config().warn_callbacks {
            warn!(
                "panic in {} callback of invocation {} (operation {:?})",
                which, self.id, self.operation
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::delivery::CallbackDelivery;
    use crate::proto::Identity;
    use crate::target::InvocationMode;
    use std::sync::atomic::AtomicU32;

    struct NoResolver;

    impl ChannelResolver for NoResolver {
        fn resolve(&self) -> Result<Arc<dyn RequestChannel>, InvokeError> {
            Err(InvokeError::NoRoute("unresolvable".into()))
        }
    }

    fn oneway_invocation(
        engine: Arc<Engine>,
        delivery: Arc<dyn ResultDelivery>,
    ) -> Arc<Invocation> {
        let mut target = TargetRef::new(Identity::new("obj", ""));
        target.mode = InvocationMode::Oneway;
        Invocation::new(
            engine,
            target,
            "ping",
            OperationMode::Normal,
            delivery,
            Arc::new(NoResolver),
            None,
            None,
        )
    }

    #[test]
    fn test_mark_sent_twice_reports_once() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let engine = Engine::new(ClientConfig::default(), rt.handle().clone());
        let sent_count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&sent_count);
        let delivery = CallbackDelivery::builder()
            .on_sent(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        let out = oneway_invocation(engine, delivery);

        // first physical send reports, a duplicate mark must not
        assert!(out.sent_impl(true));
        assert!(!out.sent_impl(true));

        out.invoke_sent();
        assert_eq!(sent_count.load(Ordering::SeqCst), 1);
        assert!(out.is_done());
        assert!(out.exception_value().is_none());
    }

    #[test]
    fn test_cancel_before_invoke_aborts_first_attempt() {
        use crate::delivery::WaitDelivery;
        use crate::dispatch::{AsyncStatus, FixedResolver, RequestChannel};

        struct RefusingChannel;

        impl RequestChannel for RefusingChannel {
            fn send_async_request(
                &self,
                out: &Arc<Invocation>,
            ) -> Result<AsyncStatus, InvokeError> {
                struct Inert;
                impl CancellationHandler for Inert {
                    fn request_canceled(&self, _out: &Arc<Invocation>, _ex: InvokeError) {}
                }
                let handler: Arc<dyn CancellationHandler> = Arc::new(Inert);
                out.cancelable(&handler)?;
                panic!("request queued after cancellation");
            }
        }

        let rt = tokio::runtime::Runtime::new().unwrap();
        let engine = Engine::new(ClientConfig::default(), rt.handle().clone());
        let delivery = WaitDelivery::new();
        let out = Invocation::new(
            engine,
            TargetRef::new(Identity::new("obj", "")),
            "ping",
            OperationMode::Normal,
            delivery.clone(),
            FixedResolver::new(Arc::new(RefusingChannel)),
            None,
            None,
        );

        out.cancel();
        out.invoke().unwrap();
        assert_eq!(delivery.wait(), Err(InvokeError::Canceled));
        assert!(out.is_done());
        assert!(!out.is_sent());
    }

    #[test]
    fn test_cancel_before_handler_is_replayed() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let engine = Engine::new(ClientConfig::default(), rt.handle().clone());
        let out = oneway_invocation(engine, CallbackDelivery::builder().build());

        out.cancel();

        struct Panicking;
        impl CancellationHandler for Panicking {
            fn request_canceled(&self, _out: &Arc<Invocation>, _ex: InvokeError) {
                panic!("must not be consulted for a replayed cancellation");
            }
        }
        let handler: Arc<dyn CancellationHandler> = Arc::new(Panicking);
        assert_eq!(out.cancelable(&handler), Err(InvokeError::Canceled));
        // the pending cancellation is consumed by the failed attach
        assert_eq!(out.cancelable(&handler), Ok(()));
    }
}
