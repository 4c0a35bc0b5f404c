//! Binding signatures to handlers and running them.
//!
//! An [`Invocation`] is a signature bound to a registered handler. The
//! bind step checks argument arity; the call step coerces arguments to
//! their declared kinds, injects the context, runs the handler under a
//! panic guard, and interprets the returned slots.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::Instrument;

use crate::models::{type_tag_of, Signature, TaskError, TaskResult};

use super::handler::{Callable, HandlerDescriptor, ParamKind, Slot, TaskContext};

/// A failed invocation: the task error plus, when the handler panicked,
/// the backtrace captured at the recovery site.
#[derive(Debug)]
pub struct CallFailure {
    /// What went wrong.
    pub error: TaskError,
    /// Backtrace captured when a panic was recovered.
    pub trace: Option<String>,
}

impl CallFailure {
    fn from_error(error: TaskError) -> Self {
        Self { error, trace: None }
    }
}

/// A signature bound to a handler, ready to run.
pub struct Invocation {
    callable: Arc<dyn Callable>,
    params: Vec<ParamKind>,
    context_aware: bool,
    return_arity: usize,
    ctx: TaskContext,
    task_name: String,
    args: Vec<Value>,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("params", &self.params)
            .field("context_aware", &self.context_aware)
            .field("return_arity", &self.return_arity)
            .field("ctx", &self.ctx)
            .field("task_name", &self.task_name)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl Invocation {
    /// Binds `signature` to a registered handler.
    ///
    /// The signature must carry exactly as many arguments as the handler
    /// declares parameters; the optional context is supplied by the
    /// worker, never counted.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::ArityMismatch`] on an argument count
    /// mismatch. This is a malformed invocation: the worker fails it
    /// directly without consulting the retry policy.
    pub fn bind(
        descriptor: &HandlerDescriptor,
        signature: &Signature,
        ctx: TaskContext,
    ) -> Result<Self, TaskError> {
        let expected = descriptor.params().len();
        let got = signature.args.len();
        if expected != got {
            return Err(TaskError::ArityMismatch { expected, got });
        }
        Ok(Self {
            callable: descriptor.callable(),
            params: descriptor.params().to_vec(),
            context_aware: descriptor.is_context_aware(),
            return_arity: descriptor.return_arity(),
            ctx,
            task_name: signature.task_name.clone(),
            args: signature.args.clone(),
        })
    }

    /// Runs the handler and interprets its return slots.
    ///
    /// The handler future runs inside the invocation's tracing span and
    /// under a panic guard: a panic never unwinds into the worker, it
    /// becomes the task's error. Panic payloads are interpreted in order:
    /// a [`TaskError`] payload becomes the returned error, a string
    /// payload becomes a plain failure with that message, anything else
    /// becomes [`TaskError::Panicked`].
    ///
    /// # Errors
    ///
    /// Returns a [`CallFailure`] carrying the task error and, for
    /// panics, the recovered backtrace.
    pub async fn call(self) -> Result<Vec<TaskResult>, CallFailure> {
        let task_name = self.task_name.clone();
        let span = self.ctx.span().clone();

        let args = coerce_args(&self.params, self.args).map_err(CallFailure::from_error)?;
        let ctx = if self.context_aware {
            self.ctx.clone()
        } else {
            TaskContext::background()
        };

        let started = Instant::now();
        let guarded = AssertUnwindSafe(self.callable.call(ctx, args).instrument(span))
            .catch_unwind()
            .await;
        histogram!("machina.task.duration_seconds", "task_name" => task_name.clone())
            .record(started.elapsed().as_secs_f64());

        let slots = match guarded {
            Ok(slots) => slots,
            Err(payload) => {
                let error = panic_to_error(payload);
                let trace = std::backtrace::Backtrace::force_capture().to_string();
                tracing::error!(task_name = %task_name, %error, trace = %trace, "task handler panicked");
                counter!("machina.tasks.panicked", "task_name" => task_name).increment(1);
                return Err(CallFailure {
                    error,
                    trace: Some(trace),
                });
            }
        };

        let results = extract_results(slots).map_err(CallFailure::from_error)?;
        if results.len() != self.return_arity {
            tracing::debug!(
                task_name = %task_name,
                declared = self.return_arity,
                produced = results.len(),
                "handler returned a different number of values than its registration declares"
            );
        }
        Ok(results)
    }
}

/// Converts a recovered panic payload into a task error.
fn panic_to_error(payload: Box<dyn std::any::Any + Send>) -> TaskError {
    match payload.downcast::<TaskError>() {
        Ok(error) => *error,
        Err(payload) => match payload.downcast::<String>() {
            Ok(message) => TaskError::Failed(*message),
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => TaskError::Failed((*message).to_string()),
                Err(_) => TaskError::Panicked,
            },
        },
    }
}

/// Coerces each argument to its declared parameter kind.
///
/// JSON deserialization flattens numeric widths, so integer parameters
/// accept floating-point arguments by truncating toward zero, and float
/// parameters accept integer arguments by widening. Any other mismatch
/// is a programming error surfaced from the call.
fn coerce_args(params: &[ParamKind], args: Vec<Value>) -> Result<Vec<Value>, TaskError> {
    args.into_iter()
        .zip(params)
        .enumerate()
        .map(|(index, (arg, kind))| coerce_arg(index, arg, *kind))
        .collect()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn coerce_arg(index: usize, arg: Value, kind: ParamKind) -> Result<Value, TaskError> {
    let mismatch = |arg: &Value| TaskError::TypeMismatch {
        index,
        expected: kind.name(),
        got: type_tag_of(arg),
    };
    match kind {
        ParamKind::Any => Ok(arg),
        ParamKind::Bool if arg.is_boolean() => Ok(arg),
        ParamKind::Str if arg.is_string() => Ok(arg),
        ParamKind::Array if arg.is_array() => Ok(arg),
        ParamKind::Object if arg.is_object() => Ok(arg),
        ParamKind::Int => match &arg {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(arg),
            Value::Number(n) => {
                let truncated = n.as_f64().unwrap_or_default() as i64;
                Ok(Value::from(truncated))
            }
            _ => Err(mismatch(&arg)),
        },
        ParamKind::Uint => match &arg {
            Value::Number(n) if n.is_u64() => Ok(arg),
            Value::Number(n) if n.is_i64() => {
                let signed = n.as_i64().unwrap_or_default();
                u64::try_from(signed)
                    .map(Value::from)
                    .map_err(|_| mismatch(&arg))
            }
            Value::Number(n) => {
                let truncated = n.as_f64().unwrap_or_default() as u64;
                Ok(Value::from(truncated))
            }
            _ => Err(mismatch(&arg)),
        },
        ParamKind::Float => match &arg {
            Value::Number(n) => {
                let widened = n.as_f64().unwrap_or_default();
                Ok(Value::from(widened))
            }
            _ => Err(mismatch(&arg)),
        },
        _ => Err(mismatch(&arg)),
    }
}

/// Interprets the handler's return slots.
///
/// The final slot is the error report: empty means success and every
/// preceding slot is wrapped as a [`TaskResult`] in order.
fn extract_results(mut slots: Vec<Slot>) -> Result<Vec<TaskResult>, TaskError> {
    let Some(last) = slots.pop() else {
        return Err(TaskError::ReturnsNoValue);
    };
    match last {
        Slot::Value(_) => Err(TaskError::LastReturnNotError),
        Slot::Error(error) => Err(error),
        Slot::Nil => Ok(slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Value(result) => result,
                Slot::Nil => TaskResult::null(),
                Slot::Error(error) => TaskResult::new("error", Value::String(error.to_string())),
            })
            .collect()),
    }
}
