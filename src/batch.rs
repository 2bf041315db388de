//! Batch-request accumulation.
//!
//! Batched invocations append into one shared buffer that is flushed as a
//! single message later. While a request is being encoded the shared
//! buffer is swapped out into the invocation (ownership transfer); finish
//! swaps it back and abort swaps it back and rolls the buffer back to the
//! recorded mark, so a half-encoded request never leaks into the flush.

use crate::buffer::RequestBuffer;
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

struct BatchInner {
    buffer: RequestBuffer,
    count: u32,
    mark: usize,
    owned_out: bool,
}

pub struct BatchQueue {
    inner: Mutex<BatchInner>,
    cond: Condvar,
}

impl BatchQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BatchInner {
                buffer: RequestBuffer::new(),
                count: 0,
                mark: 0,
                owned_out: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// Transfer the shared buffer into `out` so the caller can append its
    /// request. Blocks while another request holds the buffer. `out` must
    /// be empty.
    pub fn prepare_request(&self, out: &mut RequestBuffer) {
        debug_assert!(out.is_empty());
        let mut inner = self.inner.lock();
        while inner.owned_out {
            self.cond.wait(&mut inner);
        }
        inner.owned_out = true;
        inner.mark = inner.buffer.mark();
        std::mem::swap(&mut inner.buffer, out);
    }

    /// Return ownership with the appended request included.
    pub fn finish_request(&self, out: &mut RequestBuffer, operation: &str) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.owned_out, "finish without prepare");
        std::mem::swap(&mut inner.buffer, out);
        inner.count += 1;
        inner.owned_out = false;
        trace!("batched request for operation {:?} (count={})", operation, inner.count);
        self.cond.notify_one();
    }

    /// Return ownership discarding whatever was appended since prepare.
    pub fn abort_request(&self, out: &mut RequestBuffer) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.owned_out, "abort without prepare");
        std::mem::swap(&mut inner.buffer, out);
        let mark = inner.mark;
        inner.buffer.rollback(mark);
        inner.owned_out = false;
        self.cond.notify_one();
    }

    /// Take the accumulated requests, leaving the queue empty. Blocks
    /// while a request holds the buffer.
    pub fn flush(&self) -> (Vec<u8>, u32) {
        let mut inner = self.inner.lock();
        while inner.owned_out {
            self.cond.wait(&mut inner);
        }
        let buffer = std::mem::take(&mut inner.buffer);
        let count = inner.count;
        inner.count = 0;
        inner.mark = 0;
        (buffer.into_vec(), count)
    }

    pub fn request_count(&self) -> u32 {
        self.inner.lock().count
    }

    pub fn buffered_len(&self) -> usize {
        self.inner.lock().buffer.len()
    }
}
