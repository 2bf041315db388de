//! FIFO executor for user-facing callbacks.
//!
//! Completion sources (channel reply paths, the retry queue, the timer)
//! never run user code on their own thread; they submit an explicit task
//! naming the invocation and which callback is due, and a single worker
//! drains the queue in order. The single consumer is what guarantees a
//! sent notification submitted before a response notification is also
//! delivered before it.

use crate::error::InvokeError;
use crate::invocation::Invocation;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallbackKind {
    Sent,
    Exception,
    Response,
}

pub(crate) struct CallbackTask {
    pub invocation: Arc<Invocation>,
    pub kind: CallbackKind,
}

pub(crate) struct CallbackExecutor {
    tx: Mutex<Option<mpsc::UnboundedSender<CallbackTask>>>,
}

impl CallbackExecutor {
    pub(crate) fn new(handle: &tokio::runtime::Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<CallbackTask>();
        handle.spawn(async move {
            while let Some(task) = rx.recv().await {
                match task.kind {
                    CallbackKind::Sent => task.invocation.invoke_sent(),
                    CallbackKind::Exception => task.invocation.invoke_exception(),
                    CallbackKind::Response => task.invocation.invoke_response(),
                }
            }
        });
        Self { tx: Mutex::new(Some(tx)) }
    }

    pub(crate) fn submit(&self, task: CallbackTask) -> Result<(), InvokeError> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(task).map_err(|_| InvokeError::Shutdown),
            None => Err(InvokeError::Shutdown),
        }
    }

    /// Stop accepting tasks; already-queued callbacks still drain.
    pub(crate) fn shutdown(&self) {
        self.tx.lock().take();
    }
}
