#![allow(dead_code)]

use captains_log::*;
use parking_lot::Mutex;
use razor_invoke::*;
use rstest::fixture;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

pub struct TestRunner {
    pub rt: tokio::runtime::Runtime,
}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/invoke_test.log", Level::Trace).test().build().expect("log");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .expect("runtime");
        Self { rt }
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.engine_with(ClientConfig::default())
    }

    pub fn engine_with(&self, config: ClientConfig) -> Arc<Engine> {
        Engine::new(config, self.rt.handle().clone())
    }
}

impl fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "")
    }
}

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

/// Scripted outcome for one send attempt of a [MockChannel].
pub enum SendOutcome {
    /// Synchronous send; the scripted reply bytes come back immediately.
    Reply(Vec<u8>),
    /// Synchronous send, no reply will ever come.
    Sent,
    /// Synchronous send reported with the sent callback suppressed.
    SentNoCallback,
    /// Accepted and queued, then silence; only cancellation resolves it.
    Hang,
    /// The attempt fails before anything reaches the wire.
    Fail(InvokeError),
}

/// Channel driven by a per-attempt script. Registers itself for
/// cancellation like a real transport, counts sends, and records every
/// cancellation it is asked for.
pub struct MockChannel {
    script: Mutex<VecDeque<SendOutcome>>,
    sends: AtomicU32,
    canceled: Mutex<Vec<InvokeError>>,
    weak_self: Weak<MockChannel>,
}

impl MockChannel {
    pub fn new(script: Vec<SendOutcome>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            script: Mutex::new(script.into()),
            sends: AtomicU32::new(0),
            canceled: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        })
    }

    pub fn send_count(&self) -> u32 {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn canceled_with(&self) -> Vec<InvokeError> {
        self.canceled.lock().clone()
    }
}

impl RequestChannel for MockChannel {
    fn send_async_request(&self, out: &Arc<Invocation>) -> Result<AsyncStatus, InvokeError> {
        let this = self.weak_self.upgrade().expect("channel alive");
        let handler: Arc<dyn CancellationHandler> = this as _;
        out.cancelable(&handler)?;
        self.sends.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().pop_front().unwrap_or(SendOutcome::Hang);
        match outcome {
            SendOutcome::Fail(ex) => Err(ex),
            SendOutcome::Hang => Ok(AsyncStatus::QUEUED),
            SendOutcome::SentNoCallback => {
                out.sent();
                Ok(AsyncStatus::SENT)
            }
            SendOutcome::Sent => {
                if out.sent() {
                    out.invoke_sent_async();
                }
                Ok(AsyncStatus::SENT)
            }
            SendOutcome::Reply(bytes) => {
                if out.sent() {
                    out.invoke_sent_async();
                }
                if out.response(&bytes) {
                    out.invoke_response_async();
                }
                Ok(AsyncStatus::SENT)
            }
        }
    }
}

impl CancellationHandler for MockChannel {
    fn request_canceled(&self, out: &Arc<Invocation>, ex: InvokeError) {
        self.canceled.lock().push(ex.clone());
        if out.exception(ex) {
            out.invoke_exception_async();
        }
    }
}

pub fn registry() -> Arc<OperationRegistry> {
    OperationRegistry::builder()
        .operation("greet", OperationMode::Normal)
        .operation("touch", OperationMode::Idempotent)
        .build()
}

pub fn proxy_over(engine: Arc<Engine>, channel: Arc<MockChannel>) -> Proxy {
    Proxy::new(
        engine,
        TargetRef::new(Identity::new("service", "")),
        registry(),
        FixedResolver::new(channel),
    )
}

pub fn ok_reply(payload: &[u8]) -> Vec<u8> {
    let mut buf = buffer::RequestBuffer::new();
    proto::encode_payload_reply(&mut buf, ReplyStatus::Ok, payload);
    buf.into_vec()
}

pub fn user_exception_reply(payload: &[u8]) -> Vec<u8> {
    let mut buf = buffer::RequestBuffer::new();
    proto::encode_payload_reply(&mut buf, ReplyStatus::UserException, payload);
    buf.into_vec()
}
