//! Caller-facing completion strategies.
//!
//! The engine completes an invocation the same way regardless of how the
//! caller consumes the outcome; a [ResultDelivery] decouples the two. The
//! `handle_*` hooks run under the invocation's lock and only decide
//! whether anything must be delivered; the `invoke_*` hooks run strictly
//! outside any engine lock and are the only places user code executes.

use crate::error::InvokeError;
use crate::proto::Reply;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

pub trait ResultDelivery: Send + Sync {
    /// Called under the invocation lock when an attempt is marked sent.
    /// Returning true requests an `invoke_sent` delivery.
    fn handle_sent(&self, done: bool, already_sent: bool) -> bool;

    /// Called under the invocation lock on the terminal exception path.
    fn handle_exception(&self, ex: &InvokeError) -> bool;

    /// Called under the invocation lock on the terminal response path. An
    /// error converts the completion into the exception path.
    fn handle_response(&self, ok: bool) -> Result<bool, InvokeError>;

    fn invoke_sent(&self, sent_synchronously: bool);

    fn invoke_exception(&self, ex: InvokeError);

    fn invoke_response(&self, ok: bool, payload: &[u8]);
}

type SentFn = Box<dyn FnOnce(bool) + Send>;
type ExceptionFn = Box<dyn FnOnce(InvokeError) + Send>;
type ResponseFn = Box<dyn FnOnce(bool, &[u8]) + Send>;

/// Continuation-style delivery: three independent optional slots, each
/// invoked at most once, exception and response mutually exclusive.
#[derive(Default)]
pub struct CallbackDelivery {
    sent: Mutex<Option<SentFn>>,
    exception: Mutex<Option<ExceptionFn>>,
    response: Mutex<Option<ResponseFn>>,
}

impl CallbackDelivery {
    pub fn builder() -> CallbackDeliveryBuilder {
        CallbackDeliveryBuilder::default()
    }
}

#[derive(Default)]
pub struct CallbackDeliveryBuilder {
    sent: Option<SentFn>,
    exception: Option<ExceptionFn>,
    response: Option<ResponseFn>,
}

impl CallbackDeliveryBuilder {
    /// Register the sent continuation; the argument reports whether the
    /// send completed synchronously on the calling thread.
    pub fn on_sent(mut self, f: impl FnOnce(bool) + Send + 'static) -> Self {
        self.sent = Some(Box::new(f));
        self
    }

    pub fn on_exception(mut self, f: impl FnOnce(InvokeError) + Send + 'static) -> Self {
        self.exception = Some(Box::new(f));
        self
    }

    /// Register the response continuation: the reply's ok flag and the
    /// encoded payload (return values, or the user exception when not ok).
    pub fn on_response(mut self, f: impl FnOnce(bool, &[u8]) + Send + 'static) -> Self {
        self.response = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Arc<CallbackDelivery> {
        Arc::new(CallbackDelivery {
            sent: Mutex::new(self.sent),
            exception: Mutex::new(self.exception),
            response: Mutex::new(self.response),
        })
    }
}

impl ResultDelivery for CallbackDelivery {
    fn handle_sent(&self, _done: bool, already_sent: bool) -> bool {
        // only if not already reported and a listener is registered
        !already_sent && self.sent.lock().is_some()
    }

    fn handle_exception(&self, _ex: &InvokeError) -> bool {
        self.exception.lock().is_some()
    }

    fn handle_response(&self, _ok: bool) -> Result<bool, InvokeError> {
        Ok(self.response.lock().is_some())
    }

    fn invoke_sent(&self, sent_synchronously: bool) {
        if let Some(f) = self.sent.lock().take() {
            f(sent_synchronously);
        }
    }

    fn invoke_exception(&self, ex: InvokeError) {
        if let Some(f) = self.exception.lock().take() {
            f(ex);
        }
    }

    fn invoke_response(&self, ok: bool, payload: &[u8]) {
        if let Some(f) = self.response.lock().take() {
            f(ok, payload);
        }
    }
}

/// Blocking-wait delivery layered on the non-blocking engine. A one-way
/// invocation completes at the moment of send with an empty payload.
#[derive(Default)]
pub struct WaitDelivery {
    outcome: Mutex<Option<Result<Reply, InvokeError>>>,
    cond: Condvar,
}

impl WaitDelivery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn complete(&self, outcome: Result<Reply, InvokeError>) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.cond.notify_all();
        }
    }

    /// Park until the terminal outcome. Must not be called from an engine
    /// worker thread.
    pub fn wait(&self) -> Result<Reply, InvokeError> {
        let mut slot = self.outcome.lock();
        while slot.is_none() {
            self.cond.wait(&mut slot);
        }
        slot.clone().unwrap()
    }

    /// The outcome, if the invocation already completed.
    pub fn poll(&self) -> Option<Result<Reply, InvokeError>> {
        self.outcome.lock().clone()
    }
}

impl ResultDelivery for WaitDelivery {
    fn handle_sent(&self, done: bool, already_sent: bool) -> bool {
        done && !already_sent
    }

    fn handle_exception(&self, _ex: &InvokeError) -> bool {
        true
    }

    fn handle_response(&self, _ok: bool) -> Result<bool, InvokeError> {
        Ok(true)
    }

    fn invoke_sent(&self, _sent_synchronously: bool) {
        self.complete(Ok(Reply { ok: true, payload: Vec::new() }));
    }

    fn invoke_exception(&self, ex: InvokeError) {
        self.complete(Err(ex));
    }

    fn invoke_response(&self, ok: bool, payload: &[u8]) {
        self.complete(Ok(Reply { ok, payload: payload.to_vec() }));
    }
}
