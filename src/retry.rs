//! Retry policy and the process-wide retry queue.
//!
//! The policy is a pure decision function over failure-kind tags; the queue
//! owns the invocation while a delayed retry is armed and releases it when
//! the timer fires, the retry is canceled, or the engine shuts down.

use crate::dispatch::CancellationHandler;
use crate::error::{FailureKind, InvokeError};
use crate::invocation::Invocation;
use crate::target::OperationMode;
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Decide whether a failed attempt may be retried.
///
/// `cnt` is the number of failures so far including this one; `sent` is
/// whether the current attempt's request reached the wire. Returns the
/// delay before the next attempt (zero means retry now), or the original
/// error when the failure is permanent or the retry budget is exhausted.
pub fn check_retry(
    ex: InvokeError,
    mode: OperationMode,
    sent: bool,
    cnt: u32,
    intervals: &[Duration],
) -> Result<Duration, InvokeError> {
    match ex.kind() {
        FailureKind::Local | FailureKind::Decode | FailureKind::Remote => return Err(ex),
        // A graceful close before dispatch is safe to resend unconditionally.
        FailureKind::CloseRetryable => {}
        FailureKind::Transient => {
            // A request that may already be executing on the peer cannot be
            // resent unless the operation is idempotent.
            if sent && mode != OperationMode::Idempotent {
                return Err(ex);
            }
        }
        // Stale channels are handled inline by the send loop, uncounted.
        FailureKind::Stale => return Ok(Duration::ZERO),
    }
    let idx = match (cnt as usize).checked_sub(1) {
        Some(idx) if idx < intervals.len() => idx,
        _ => {
            debug!("retry limit reached after {} failures: {}", cnt, ex);
            return Err(ex);
        }
    };
    let interval = intervals[idx];
    debug!("retrying in {:?} (failure {} of {}): {}", interval, cnt, intervals.len(), ex);
    Ok(interval)
}

struct RetryTask {
    invocation: Arc<Invocation>,
    // None until the timer task is spawned; add() backfills it.
    timer: Option<tokio::task::AbortHandle>,
}

/// Cancellation route for an invocation parked in the queue. Whoever
/// removes the queue entry (timer, cancel, destroy) owns the invocation.
struct RetryHandle {
    queue: Arc<RetryQueue>,
    id: u64,
}

impl CancellationHandler for RetryHandle {
    fn request_canceled(&self, invocation: &Arc<Invocation>, ex: InvokeError) {
        let Some(task) = self.queue.remove(self.id) else {
            // The timer fired or the queue was destroyed first.
            return;
        };
        if let Some(timer) = task.timer {
            timer.abort();
        }
        trace!("retry queue: canceled invocation {}: {}", invocation.id(), ex);
        if invocation.exception_impl(ex) {
            invocation.invoke_exception_async();
        }
    }
}

struct QueueInner {
    destroyed: bool,
    next_id: u64,
    pending: HashMap<u64, RetryTask>,
}

/// Process-wide scheduler of delayed retries.
pub struct RetryQueue {
    handle: tokio::runtime::Handle,
    inner: Mutex<QueueInner>,
}

impl RetryQueue {
    pub(crate) fn new(handle: tokio::runtime::Handle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            inner: Mutex::new(QueueInner { destroyed: false, next_id: 0, pending: HashMap::new() }),
        })
    }

    /// Queue a retry of `invocation` after `interval`. The queue owns the
    /// invocation until the retry fires, the invocation is canceled, or the
    /// queue is destroyed; the queue entry is the cancellation handler for
    /// the duration.
    pub(crate) fn add(
        self: &Arc<Self>,
        invocation: Arc<Invocation>,
        interval: Duration,
    ) -> Result<(), InvokeError> {
        let id = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return Err(InvokeError::Shutdown);
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.pending.insert(id, RetryTask { invocation: Arc::clone(&invocation), timer: None });
            id
        };
        trace!("retry queue: add invocation {} with interval {:?}", invocation.id(), interval);
        let handler: Arc<dyn CancellationHandler> =
            Arc::new(RetryHandle { queue: Arc::clone(self), id });
        if let Err(ex) = invocation.cancelable(&handler) {
            // Canceled between attempts; the pending entry is ours to drop.
            self.remove(id);
            if invocation.exception_impl(ex) {
                invocation.invoke_exception_async();
            }
            return Ok(());
        }
        let queue = Arc::clone(self);
        let task = self.handle.spawn(async move {
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            queue.fire(id);
        });
        let mut inner = self.inner.lock();
        match inner.pending.get_mut(&id) {
            Some(entry) => entry.timer = Some(task.abort_handle()),
            // Canceled or destroyed while spawning; the timer must not fire.
            None => task.abort(),
        }
        Ok(())
    }

    fn remove(&self, id: u64) -> Option<RetryTask> {
        self.inner.lock().pending.remove(&id)
    }

    fn fire(&self, id: u64) {
        // Remove before running; whoever removes the entry is the one
        // completion source.
        if let Some(task) = self.remove(id) {
            task.invocation.retry();
        }
    }

    /// Cancel every armed retry and force-terminate the queued invocations.
    pub(crate) fn destroy(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            std::mem::take(&mut inner.pending)
        };
        for (_, task) in pending {
            if let Some(timer) = task.timer {
                timer.abort();
            }
            let _ = task.invocation.abort(InvokeError::Shutdown);
        }
    }
}
