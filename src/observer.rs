//! Telemetry hooks around the invocation lifecycle.
//!
//! Observers are capability sets with no-op defaults, so an engine without
//! instrumentation pays only an `Option` check. The slots below guarantee
//! detach-exactly-once on every terminal path.

use std::sync::Arc;

/// Per-invocation telemetry, attached when the call is issued and detached
/// once, on whichever path produces the terminal outcome.
pub trait InvocationObserver: Send + Sync {
    fn attach(&self) {}
    fn detach(&self) {}
    /// An attempt failed and the invocation will be sent again.
    fn retried(&self) {}
    fn failed(&self, _exception_id: &str) {}
    /// The reply carried a user exception.
    fn user_exception(&self) {}
    /// Child observer for one attempt over a remote connection.
    fn remote_observer(&self, _request_size: usize) -> Option<Arc<dyn ChildObserver>> {
        None
    }
    /// Child observer for one collocated attempt.
    fn collocated_observer(&self, _request_size: usize) -> Option<Arc<dyn ChildObserver>> {
        None
    }
}

/// Telemetry for one physical attempt; detached as soon as nothing more
/// can happen to the attempt on its channel.
pub trait ChildObserver: Send + Sync {
    fn attach(&self) {}
    fn detach(&self) {}
    fn failed(&self, _exception_id: &str) {}
    fn reply(&self, _size: usize) {}
}

/// Root observer slot owned by the invocation.
#[derive(Default)]
pub(crate) struct RootObserver {
    inner: Option<Arc<dyn InvocationObserver>>,
}

impl RootObserver {
    pub(crate) fn attach(&mut self, observer: Option<Arc<dyn InvocationObserver>>) {
        if let Some(o) = &observer {
            o.attach();
        }
        self.inner = observer;
    }

    pub(crate) fn detach(&mut self) {
        if let Some(o) = self.inner.take() {
            o.detach();
        }
    }

    pub(crate) fn retried(&self) {
        if let Some(o) = &self.inner {
            o.retried();
        }
    }

    pub(crate) fn failed(&self, exception_id: &str) {
        if let Some(o) = &self.inner {
            o.failed(exception_id);
        }
    }

    pub(crate) fn user_exception(&self) {
        if let Some(o) = &self.inner {
            o.user_exception();
        }
    }

    pub(crate) fn remote_observer(&self, request_size: usize) -> Option<Arc<dyn ChildObserver>> {
        self.inner.as_ref()?.remote_observer(request_size)
    }

    pub(crate) fn collocated_observer(&self, request_size: usize) -> Option<Arc<dyn ChildObserver>> {
        self.inner.as_ref()?.collocated_observer(request_size)
    }
}

/// Per-attempt child observer slot.
#[derive(Default)]
pub(crate) struct AttemptObserver {
    inner: Option<Arc<dyn ChildObserver>>,
}

impl AttemptObserver {
    pub(crate) fn attach(&mut self, observer: Option<Arc<dyn ChildObserver>>) {
        if let Some(o) = &observer {
            o.attach();
        }
        self.inner = observer;
    }

    pub(crate) fn detach(&mut self) {
        if let Some(o) = self.inner.take() {
            o.detach();
        }
    }

    pub(crate) fn failed(&self, exception_id: &str) {
        if let Some(o) = &self.inner {
            o.failed(exception_id);
        }
    }

    pub(crate) fn reply(&self, size: usize) {
        if let Some(o) = &self.inner {
            o.reply(size);
        }
    }
}
