//! machina - Distributed Asynchronous Task Execution
//!
//! A worker runtime that consumes serialized task invocations from a
//! message broker, dispatches them to locally registered handlers, and
//! coordinates the lifecycle of individual tasks, linear chains, parallel
//! groups, and chord (fan-in) callbacks with durable state tracking and
//! retry policies.
//!
//! Delivery is at-least-once with idempotent state transitions; chord
//! triggering is at-most-once via an atomic test-and-set in the result
//! backend. Concrete broker transports and durable backends plug in
//! through the [`Broker`] and [`Backend`] contracts; in-memory reference
//! implementations of both ship with the crate.
//!
//! ```ignore
//! let mut registry = HandlerRegistry::new();
//! registry.register(
//!     "add",
//!     HandlerDescriptor::new(FnHandler::arc(|_ctx, args: Vec<Value>| async move {
//!         let sum = args.iter().filter_map(Value::as_i64).sum::<i64>();
//!         vec![Slot::value(sum.into()), Slot::nil()]
//!     }))
//!     .with_params(vec![ParamKind::Int, ParamKind::Int]),
//! );
//!
//! let worker = Arc::new(
//!     Worker::new(Config::from_env(), Arc::new(registry), broker, backend)
//!         .with_concurrency(8),
//! );
//! worker.launch().await?;
//! ```

pub mod backend;
pub mod broker;
pub mod config;
pub mod models;
pub mod worker;

pub use backend::{Backend, BackendError, InMemoryBackend};
pub use broker::{Broker, BrokerError, InMemoryBroker, TaskProcessor};
pub use config::{Config, TlsConfig, DEFAULT_RESULTS_EXPIRE_IN};
pub use models::{
    fibonacci_next, type_tag_of, Chain, Chord, Group, GroupMeta, Headers, Signature, StateKind,
    TaskError, TaskResult, TaskState,
};
pub use worker::{
    CallFailure, Callable, ErrorHandler, FnHandler, HandlerDescriptor, HandlerRegistry,
    Invocation, NotRegistered, ParamKind, ProcessError, RunnerError, Slot, TaskContext, Worker,
};
