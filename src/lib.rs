#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # razor-invoke
//!
//! This crate provides the client-side asynchronous invocation engine of a
//! request/reply RPC stack: everything between "the request is marshaled"
//! and "the user callback fires", independent of any concrete transport.
//!
//! If you are looking for a byte-level transport or a server-side
//! dispatcher, those live behind the [RequestChannel] and
//! [ChannelResolver] traits and are not part of this crate.
//!
//! ## Components
//!
//! - [Engine]: per-client root owning the retry queue, the cancellation
//!   timer and the callback executor, torn down as a unit by
//!   [Engine::destroy](Engine::destroy).
//! - [Proxy] + [OperationRegistry]: the caller-facing front. Operations
//!   and their modes are registered explicitly up front; a call encodes
//!   the request header and payload encapsulation and returns a live
//!   [Invocation] handle.
//! - [Invocation]: the in-flight state machine. One handle persists
//!   across every retried send attempt and reaches exactly one terminal
//!   outcome, no matter how many completion sources race for it.
//! - [RequestChannel] / [ChannelResolver]: the transport seam. A channel
//!   is anything able to carry one encoded request; [CollocatedChannel]
//!   ships in-process dispatch behind the same interface.
//! - [CallbackDelivery] / [WaitDelivery]: how outcomes reach the caller,
//!   either as one-shot callbacks or as a blocking wait layered on the
//!   non-blocking engine.
//! - [BatchQueue]: accumulation of send-only requests flushed in one
//!   batch through [Proxy::flush_batch](Proxy::flush_batch).
//!
//! ## The Design
//!
//! Retries and timeouts run on a `tokio` runtime handle the user supplies;
//! the engine never spawns its own runtime. User callbacks are delivered
//! by a single executor task in submission order, so a sent callback can
//! never trail its own response, and no user code ever runs under an
//! engine lock. A panicking callback is caught and warn-logged; it cannot
//! poison the engine.
//!
//! Failures carry a [FailureKind] classification, and the retry policy is
//! a pure function of that kind, the operation mode, whether the request
//! was already sent, and the configured retry intervals. A stale channel
//! re-resolves without consuming a retry slot.
//!
//! ## Usage
//!
//! ```no_run
//! use razor_invoke::*;
//! use std::sync::Arc;
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! let engine = Engine::new(ClientConfig::default(), rt.handle().clone());
//! let registry = OperationRegistry::builder()
//!     .operation("greet", OperationMode::Normal)
//!     .build();
//! let channel = CollocatedChannel::new(
//!     Arc::clone(&engine),
//!     Arc::new(|_request: &[u8]| Vec::new()),
//! );
//! let proxy = Proxy::new(
//!     Arc::clone(&engine),
//!     TargetRef::new(Identity::new("greeter", "")),
//!     registry,
//!     FixedResolver::new(channel),
//! );
//! let delivery = CallbackDelivery::builder()
//!     .on_response(|ok, payload| println!("ok={} {} bytes", ok, payload.len()))
//!     .on_exception(|ex| eprintln!("failed: {}", ex))
//!     .build();
//! proxy.invoke_async("greet", b"hello", delivery).unwrap();
//! ```

pub mod batch;
pub mod buffer;
mod config;
pub mod delivery;
pub mod dispatch;
mod engine;
pub mod error;
mod exec;
mod invocation;
pub mod observer;
pub mod proto;
mod proxy;
mod retry;
mod target;
mod timer;

pub use batch::BatchQueue;
pub use config::ClientConfig;
pub use delivery::{CallbackDelivery, ResultDelivery, WaitDelivery};
pub use dispatch::{
    AsyncStatus, CancellationHandler, ChannelResolver, CollocatedChannel, DispatchFn,
    FixedResolver, RequestChannel,
};
pub use engine::Engine;
pub use error::{FailureKind, InvokeError, NotExist};
pub use invocation::Invocation;
pub use observer::{ChildObserver, InvocationObserver};
pub use proto::{Identity, Reply, ReplyStatus};
pub use proxy::{OperationDesc, OperationRegistry, OperationRegistryBuilder, Proxy};
pub use target::{
    CURRENT_ENCODING, CURRENT_PROTOCOL, EncodingVersion, InvocationMode, OperationMode,
    ProtocolVersion, TargetRef,
};
