//! Caller-facing front of the engine.
//!
//! A [Proxy] binds one [TargetRef] to an [Engine], a channel resolver and
//! an [OperationRegistry], and turns operation calls into [Invocation]s.
//! The registry is explicit and built up front, so every invokable
//! operation and its mode are known before the first call.

use crate::batch::BatchQueue;
use crate::delivery::ResultDelivery;
use crate::dispatch::ChannelResolver;
use crate::engine::Engine;
use crate::error::{InvokeError, NotExist};
use crate::invocation::Invocation;
use crate::observer::InvocationObserver;
use crate::proto;
use crate::target::{CURRENT_PROTOCOL, InvocationMode, OperationMode, TargetRef};
use log::trace;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct OperationDesc {
    pub mode: OperationMode,
}

/// Read-only map of the operations a proxy may invoke.
pub struct OperationRegistry {
    ops: HashMap<String, OperationDesc>,
}

impl OperationRegistry {
    pub fn builder() -> OperationRegistryBuilder {
        OperationRegistryBuilder { ops: HashMap::new() }
    }

    pub fn get(&self, operation: &str) -> Option<&OperationDesc> {
        self.ops.get(operation)
    }
}

pub struct OperationRegistryBuilder {
    ops: HashMap<String, OperationDesc>,
}

impl OperationRegistryBuilder {
    pub fn operation(mut self, name: &str, mode: OperationMode) -> Self {
        self.ops.insert(name.to_string(), OperationDesc { mode });
        self
    }

    pub fn build(self) -> Arc<OperationRegistry> {
        Arc::new(OperationRegistry { ops: self.ops })
    }
}

pub struct Proxy {
    engine: Arc<Engine>,
    target: TargetRef,
    registry: Arc<OperationRegistry>,
    resolver: Arc<dyn ChannelResolver>,
    batch: Option<Arc<BatchQueue>>,
    observer: Option<Arc<dyn InvocationObserver>>,
}

impl Proxy {
    pub fn new(
        engine: Arc<Engine>,
        target: TargetRef,
        registry: Arc<OperationRegistry>,
        resolver: Arc<dyn ChannelResolver>,
    ) -> Self {
        let batch = target.mode.is_batch().then(BatchQueue::new);
        Self { engine, target, registry, resolver, batch, observer: None }
    }

    pub fn with_observer(mut self, observer: Arc<dyn InvocationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn target(&self) -> &TargetRef {
        &self.target
    }

    fn check(&self, operation: &str) -> Result<OperationDesc, InvokeError> {
        if self.target.protocol != CURRENT_PROTOCOL {
            return Err(InvokeError::UnsupportedProtocol {
                major: self.target.protocol.major,
                minor: self.target.protocol.minor,
            });
        }
        self.registry.get(operation).copied().ok_or_else(|| {
            InvokeError::OperationNotExist(NotExist {
                identity: self.target.identity.clone(),
                facet: self.target.facet.clone(),
                operation: operation.to_string(),
            })
        })
    }

    /// Issue an asynchronous call of `operation` with an opaque payload
    /// encapsulation. The returned handle is live immediately; the outcome
    /// arrives through `delivery`.
    pub fn invoke_async(
        &self,
        operation: &str,
        payload: &[u8],
        delivery: Arc<dyn ResultDelivery>,
    ) -> Result<Arc<Invocation>, InvokeError> {
        let desc = self.check(operation)?;
        trace!("proxy invoke {:?} on {}", operation, self.target.identity);
        let out = Invocation::new(
            Arc::clone(&self.engine),
            self.target.clone(),
            operation,
            desc.mode,
            delivery,
            Arc::clone(&self.resolver),
            self.batch.clone(),
            self.observer.clone(),
        );
        {
            let mut request = out.request().lock();
            if let Some(batch) = &self.batch {
                batch.prepare_request(&mut request);
            }
            proto::encode_request_header(&mut request, &self.target, operation, desc.mode);
            proto::encode_encapsulation(&mut request, self.target.encoding, payload);
        }
        out.invoke()?;
        Ok(out)
    }

    /// Flush the batch queue: the accumulated requests travel as one
    /// send-only invocation. Flushing an empty queue completes without
    /// touching a channel.
    pub fn flush_batch(
        &self,
        delivery: Arc<dyn ResultDelivery>,
    ) -> Result<Arc<Invocation>, InvokeError> {
        let batch = self
            .batch
            .as_ref()
            .ok_or_else(|| InvokeError::Protocol("flush_batch on a non-batch proxy".into()))?;
        let (buffer, count) = batch.flush();
        trace!("flushing {} batched requests to {}", count, self.target.identity);
        let mut target = self.target.clone();
        target.mode = InvocationMode::Oneway;
        let out = Invocation::new(
            Arc::clone(&self.engine),
            target,
            "flushBatchRequests",
            OperationMode::Normal,
            delivery,
            Arc::clone(&self.resolver),
            None,
            self.observer.clone(),
        );
        if count == 0 {
            if out.sent_impl(true) {
                out.invoke_sent_async();
            }
            return Ok(out);
        }
        out.request().lock().write_bytes(&buffer);
        out.invoke()?;
        Ok(out)
    }

    /// Number of requests waiting in the batch queue, if this is a batch
    /// proxy.
    pub fn batch_request_count(&self) -> Option<u32> {
        self.batch.as_ref().map(|b| b.request_count())
    }
}
