//! Process-wide cancellation timer for invocation timeouts.
//!
//! Firing a timeout is functionally a `cancel()` issued from the timer:
//! the entry is removed under the timer's own lock, the lock is released,
//! and only then does the invocation see the cancellation. Holding the
//! invocation's lock while canceling a token therefore cannot deadlock.

use crate::error::InvokeError;
use crate::invocation::Invocation;
use log::trace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Handle for one armed timeout, used to disarm it on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(u64);

struct TimerEntry {
    invocation: Arc<Invocation>,
    timer: tokio::task::AbortHandle,
}

struct TimerInner {
    destroyed: bool,
    next_token: u64,
    armed: HashMap<u64, TimerEntry>,
}

pub struct CancellationTimer {
    handle: tokio::runtime::Handle,
    inner: Mutex<TimerInner>,
}

impl CancellationTimer {
    pub(crate) fn new(handle: tokio::runtime::Handle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            inner: Mutex::new(TimerInner { destroyed: false, next_token: 0, armed: HashMap::new() }),
        })
    }

    /// Arm a timeout; the timer owns the invocation until it fires or is
    /// disarmed.
    pub(crate) fn schedule(
        self: &Arc<Self>,
        invocation: Arc<Invocation>,
        timeout: Duration,
    ) -> Result<TimerToken, InvokeError> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(InvokeError::Shutdown);
        }
        let token = inner.next_token;
        inner.next_token += 1;
        trace!("timer: arm {:?} for invocation {}", timeout, invocation.id());
        let timer = Arc::clone(self);
        let task = self.handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            timer.fire(token);
        });
        inner.armed.insert(token, TimerEntry { invocation, timer: task.abort_handle() });
        Ok(TimerToken(token))
    }

    fn fire(&self, token: u64) {
        let entry = self.inner.lock().armed.remove(&token);
        if let Some(entry) = entry {
            trace!("timer: fired for invocation {}", entry.invocation.id());
            entry.invocation.run_timer_task();
        }
    }

    /// Disarm a timeout; a no-op when it already fired.
    pub(crate) fn cancel(&self, token: TimerToken) {
        let entry = self.inner.lock().armed.remove(&token.0);
        if let Some(entry) = entry {
            entry.timer.abort();
        }
    }

    /// Drop every armed timeout without firing it.
    pub(crate) fn destroy(&self) {
        let armed = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            std::mem::take(&mut inner.armed)
        };
        for (_, entry) in armed {
            entry.timer.abort();
        }
    }
}
