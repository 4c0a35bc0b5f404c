//! Task handler contract and registry.
//!
//! Handlers are dynamic: they receive the signature's arguments as JSON
//! values and produce ordered return slots, the last of which is reserved
//! for the error report. Each registration attaches a
//! [`HandlerDescriptor`] declaring the parameter kinds (for arity checks
//! and numeric coercion) and whether the handler wants the per-invocation
//! context.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::models::{Headers, Signature, TaskError, TaskResult};

/// Declared type of one handler parameter.
///
/// Arguments arrive as JSON values, so numeric parameters see only one
/// numeric width on the wire; the kind tells the invoker how to narrow or
/// widen them before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// A boolean.
    Bool,
    /// A signed integer. Floating-point arguments narrow by truncation
    /// toward zero.
    Int,
    /// An unsigned integer. Floating-point arguments narrow by
    /// truncation toward zero.
    Uint,
    /// A floating-point number. Integer arguments widen.
    Float,
    /// A string.
    Str,
    /// A JSON array.
    Array,
    /// A JSON object.
    Object,
    /// Any value, passed through untouched.
    Any,
}

impl ParamKind {
    /// Name used in error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "i64",
            Self::Uint => "u64",
            Self::Float => "f64",
            Self::Str => "string",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One raw return slot from a handler invocation.
///
/// Handlers return a vector of slots; the final slot is the error report
/// ([`nil`](Self::nil) when the call succeeded) and every preceding slot
/// is a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    /// A payload value with its runtime type label.
    Value(TaskResult),
    /// An empty slot.
    Nil,
    /// An error report.
    Error(TaskError),
}

impl Slot {
    /// A payload slot whose type tag is inferred from the JSON kind.
    #[must_use]
    pub fn value(value: Value) -> Self {
        Self::Value(TaskResult::of(value))
    }

    /// A payload slot with an explicit type tag.
    #[must_use]
    pub fn tagged(type_tag: impl Into<String>, value: Value) -> Self {
        Self::Value(TaskResult::new(type_tag, value))
    }

    /// An empty slot: the error report of a successful call.
    #[must_use]
    pub const fn nil() -> Self {
        Self::Nil
    }

    /// A plain failure report.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(TaskError::failed(message))
    }

    /// A retriable failure report carrying an explicit delay.
    #[must_use]
    pub fn retry_in(delay: Duration, reason: impl Into<String>) -> Self {
        Self::Error(TaskError::retry_later(reason, delay))
    }
}

/// Per-invocation context handed to context-aware handlers.
///
/// Carries the signature's identity and headers, the tracing span the
/// worker opened for the invocation, and a cancellation token that fires
/// on immediate termination. Handlers opt in to cancellation by selecting
/// on [`cancelled`](Self::cancelled).
#[derive(Debug, Clone)]
pub struct TaskContext {
    signature_id: String,
    task_name: String,
    headers: Headers,
    cancel: CancellationToken,
    span: Span,
}

impl TaskContext {
    pub(crate) fn for_signature(signature: &Signature, span: Span, cancel: CancellationToken) -> Self {
        Self {
            signature_id: signature.id.clone(),
            task_name: signature.task_name.clone(),
            headers: signature.headers.clone(),
            cancel,
            span,
        }
    }

    /// A detached context: no identity, no span, never cancelled. Handed
    /// to handlers that did not declare themselves context-aware.
    #[must_use]
    pub fn background() -> Self {
        Self {
            signature_id: String::new(),
            task_name: String::new(),
            headers: Headers::new(),
            cancel: CancellationToken::new(),
            span: Span::none(),
        }
    }

    /// Id of the signature being invoked.
    #[must_use]
    pub fn signature_id(&self) -> &str {
        &self.signature_id
    }

    /// Name of the task being invoked.
    #[must_use]
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// The signature's headers.
    #[must_use]
    pub const fn headers(&self) -> &Headers {
        &self.headers
    }

    /// A string-valued header, if present.
    #[must_use]
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    /// The tracing span covering this invocation.
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Returns true once the invocation has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the invocation is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// A task handler.
///
/// Implementations receive the (already coerced) positional arguments and
/// return raw slots; the invoker interprets them. The worker may run any
/// number of invocations of the same handler concurrently.
///
/// # Example
///
/// ```ignore
/// struct Add;
///
/// #[async_trait]
/// impl Callable for Add {
///     async fn call(&self, _ctx: TaskContext, args: Vec<Value>) -> Vec<Slot> {
///         let sum = args.iter().filter_map(Value::as_i64).sum::<i64>();
///         vec![Slot::value(sum.into()), Slot::nil()]
///     }
/// }
/// ```
#[async_trait]
pub trait Callable: Send + Sync {
    /// Runs the handler. The final returned slot is the error report;
    /// return [`Slot::nil`] there on success.
    async fn call(&self, ctx: TaskContext, args: Vec<Value>) -> Vec<Slot>;
}

/// Adapter turning an async closure into a [`Callable`].
///
/// Saves a struct-per-handler for simple registrations:
///
/// ```ignore
/// let add = FnHandler::arc(|_ctx, args: Vec<Value>| async move {
///     let sum = args.iter().filter_map(Value::as_i64).sum::<i64>();
///     vec![Slot::value(sum.into()), Slot::nil()]
/// });
/// ```
pub struct FnHandler<F>(F);

impl<F, Fut> FnHandler<F>
where
    F: Fn(TaskContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<Slot>> + Send + 'static,
{
    /// Wraps `f` behind an `Arc<dyn Callable>`.
    #[must_use]
    pub fn arc(f: F) -> Arc<dyn Callable> {
        Arc::new(Self(f))
    }
}

#[async_trait]
impl<F, Fut> Callable for FnHandler<F>
where
    F: Fn(TaskContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<Slot>> + Send + 'static,
{
    async fn call(&self, ctx: TaskContext, args: Vec<Value>) -> Vec<Slot> {
        (self.0)(ctx, args).await
    }
}

/// A registered handler plus the metadata the invoker needs to bind a
/// signature to it.
#[derive(Clone)]
pub struct HandlerDescriptor {
    callable: Arc<dyn Callable>,
    params: Vec<ParamKind>,
    context_aware: bool,
    return_arity: usize,
}

impl PartialEq for HandlerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.callable, &other.callable)
            && self.params == other.params
            && self.context_aware == other.context_aware
            && self.return_arity == other.return_arity
    }
}

impl HandlerDescriptor {
    /// Describes a zero-argument handler returning one payload value.
    /// Adjust with the builder methods.
    #[must_use]
    pub fn new(callable: Arc<dyn Callable>) -> Self {
        Self {
            callable,
            params: Vec::new(),
            context_aware: false,
            return_arity: 1,
        }
    }

    /// Declares the handler's parameter kinds. The signature must carry
    /// exactly this many arguments.
    #[must_use]
    pub fn with_params(mut self, params: Vec<ParamKind>) -> Self {
        self.params = params;
        self
    }

    /// Marks the handler context-aware: it receives the per-invocation
    /// [`TaskContext`] instead of a detached one.
    #[must_use]
    pub fn context_aware(mut self) -> Self {
        self.context_aware = true;
        self
    }

    /// Declares how many payload slots the handler returns (excluding
    /// the error slot).
    #[must_use]
    pub fn with_return_arity(mut self, return_arity: usize) -> Self {
        self.return_arity = return_arity;
        self
    }

    /// The declared parameter kinds.
    #[must_use]
    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    /// Whether the handler receives the per-invocation context.
    #[must_use]
    pub const fn is_context_aware(&self) -> bool {
        self.context_aware
    }

    /// Declared number of payload slots.
    #[must_use]
    pub const fn return_arity(&self) -> usize {
        self.return_arity
    }

    pub(crate) fn callable(&self) -> Arc<dyn Callable> {
        Arc::clone(&self.callable)
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("params", &self.params)
            .field("context_aware", &self.context_aware)
            .field("return_arity", &self.return_arity)
            .finish_non_exhaustive()
    }
}

/// Lookup failure for an unregistered task name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no handler registered for task {0}")]
pub struct NotRegistered(pub String);

/// Process-wide mapping from task name to handler descriptor.
///
/// Registration is a setup-time operation (`&mut self`); after the
/// worker starts, the registry is only read.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerDescriptor>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `task_name`, replacing any previous
    /// registration.
    pub fn register(&mut self, task_name: impl Into<String>, descriptor: HandlerDescriptor) {
        self.handlers.insert(task_name.into(), descriptor);
    }

    /// Looks up the descriptor for a task name.
    ///
    /// # Errors
    ///
    /// Returns [`NotRegistered`] when no handler was registered under
    /// `task_name`.
    pub fn lookup(&self, task_name: &str) -> Result<&HandlerDescriptor, NotRegistered> {
        self.handlers
            .get(task_name)
            .ok_or_else(|| NotRegistered(task_name.to_string()))
    }

    /// Returns true if a handler is registered for `task_name`.
    #[must_use]
    pub fn is_registered(&self, task_name: &str) -> bool {
        self.handlers.contains_key(task_name)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
