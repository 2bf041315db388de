//! Process-wide infrastructure shared by all invocations.

use crate::config::ClientConfig;
use crate::exec::CallbackExecutor;
use crate::retry::RetryQueue;
use crate::timer::CancellationTimer;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One engine per communicator-like scope: holds the config, the retry
/// queue, the cancellation timer and the callback executor. Invocations
/// keep an `Arc` to it; destroying the engine force-terminates everything
/// still queued.
pub struct Engine {
    config: ClientConfig,
    handle: tokio::runtime::Handle,
    retry_queue: Arc<RetryQueue>,
    timer: Arc<CancellationTimer>,
    executor: CallbackExecutor,
    destroyed: AtomicBool,
}

impl Engine {
    pub fn new(config: ClientConfig, handle: tokio::runtime::Handle) -> Arc<Self> {
        Arc::new(Self {
            executor: CallbackExecutor::new(&handle),
            retry_queue: RetryQueue::new(handle.clone()),
            timer: CancellationTimer::new(handle.clone()),
            destroyed: AtomicBool::new(false),
            config,
            handle,
        })
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry_queue
    }

    pub(crate) fn timer(&self) -> &Arc<CancellationTimer> {
        &self.timer
    }

    pub(crate) fn executor(&self) -> &CallbackExecutor {
        &self.executor
    }

    pub(crate) fn spawn<F>(&self, f: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(f);
    }

    /// Tear down: disarm every timeout, abort every queued retry with
    /// [InvokeError::Shutdown](crate::InvokeError), then stop the callback
    /// executor once the aborts are queued. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.timer.destroy();
        self.retry_queue.destroy();
        self.executor.shutdown();
    }
}
