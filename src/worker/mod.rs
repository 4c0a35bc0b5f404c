//! Worker: pulls signatures from the broker, invokes handlers, and
//! drives the post-execution decision graph.
//!
//! This module provides:
//! - `Worker` - the orchestrator binding a registry, broker, and backend
//! - `Callable` / `FnHandler` - the handler contract
//! - `HandlerRegistry` / `HandlerDescriptor` - handler registration
//! - `Invocation` - argument adaptation and panic-safe execution
//! - `TaskContext` - per-invocation context for opted-in handlers
//! - `ProcessError` - infrastructure failures surfaced to the broker
//! - `RunnerError` / launch helpers - worker lifecycle (see `runner`)

mod handler;
mod invoke;
mod runner;

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendError};
use crate::broker::{Broker, BrokerError, TaskProcessor};
use crate::config::Config;
use crate::models::{fibonacci_next, Signature, StateKind, TaskError, TaskResult};

pub use handler::{
    Callable, FnHandler, HandlerDescriptor, HandlerRegistry, NotRegistered, ParamKind, Slot,
    TaskContext,
};
pub use invoke::{CallFailure, Invocation};
pub use runner::RunnerError;

/// Error-reporting hook invoked on task failures and broker troubles.
///
/// Receives the error, the failing signature when there is one, and the
/// recovered backtrace when the failure was a panic.
pub type ErrorHandler = Arc<dyn Fn(&TaskError, Option<&Signature>, Option<&str>) + Send + Sync>;

/// Infrastructure failure while processing a delivery.
///
/// Returning one of these from [`TaskProcessor::process`] asks the broker
/// to redeliver the message. Task-level failures never surface here; they
/// are recorded in the backend and acknowledged.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// A backend state transition failed.
    #[error("failed to set state to '{state}' for task {task_id}")]
    State {
        /// The task whose transition failed.
        task_id: String,
        /// The state that could not be recorded.
        state: StateKind,
        /// The backend's error.
        #[source]
        source: BackendError,
    },

    /// The group completion check failed.
    #[error("completion check for group {group_uuid} failed")]
    GroupCompleted {
        /// The group being checked.
        group_uuid: String,
        /// The backend's error.
        #[source]
        source: BackendError,
    },

    /// The atomic chord trigger failed.
    #[error("chord trigger for group {group_uuid} failed")]
    TriggerChord {
        /// The group whose chord could not be claimed.
        group_uuid: String,
        /// The backend's error.
        #[source]
        source: BackendError,
    },

    /// A republish (retry or chord callback) failed.
    #[error("failed to publish task {task_id}")]
    Publish {
        /// The task that could not be published.
        task_id: String,
        /// The broker's error.
        #[source]
        source: BrokerError,
    },
}

/// A worker process: consumes signatures and orchestrates their
/// lifecycle.
///
/// One worker handle is shared by up to `concurrency` simultaneous
/// deliveries; everything it holds is read-only or internally
/// synchronized.
pub struct Worker {
    config: Config,
    registry: Arc<HandlerRegistry>,
    broker: Arc<dyn Broker>,
    backend: Arc<dyn Backend>,
    consumer_tag: String,
    concurrency: usize,
    queue: Option<String>,
    error_handler: Option<ErrorHandler>,
    cancel_root: CancellationToken,
}

impl Worker {
    /// Creates a worker with a concurrency of 1 and a default consumer
    /// tag. Adjust with the builder methods before launching.
    #[must_use]
    pub fn new(
        config: Config,
        registry: Arc<HandlerRegistry>,
        broker: Arc<dyn Broker>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            config,
            registry,
            broker,
            backend,
            consumer_tag: "machina_worker".to_string(),
            concurrency: 1,
            queue: None,
            error_handler: None,
            cancel_root: CancellationToken::new(),
        }
    }

    /// Sets the broker consumer tag.
    #[must_use]
    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    /// Sets how many deliveries may be processed in parallel.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Subscribes the worker to a custom queue instead of the configured
    /// default.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Installs the error-reporting hook. Without one, failures produce a
    /// log record.
    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = Some(handler);
    }

    /// The custom queue this worker subscribes to, if any.
    #[must_use]
    pub fn custom_queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// The broker consumer tag.
    #[must_use]
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub(crate) fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub(crate) fn error_handler(&self) -> Option<&ErrorHandler> {
        self.error_handler.as_ref()
    }

    pub(crate) fn cancel_root(&self) -> &CancellationToken {
        &self.cancel_root
    }

    /// Handles one delivered signature and drives its callbacks.
    async fn process_signature(&self, mut signature: Signature) -> Result<(), ProcessError> {
        // Unregistered task names are acknowledged without processing:
        // in mixed deployments other workers subscribed to the same
        // queue may own this name.
        let Ok(descriptor) = self.registry.lookup(&signature.task_name) else {
            tracing::debug!(
                task_id = %signature.id,
                task_name = %signature.task_name,
                "task not registered with this worker, skipping"
            );
            counter!("machina.tasks.skipped", "task_name" => signature.task_name.clone())
                .increment(1);
            return Ok(());
        };
        let descriptor = descriptor.clone();

        let span = tracing::info_span!(
            "task",
            task_id = %signature.id,
            task_name = %signature.task_name,
            trace_id = tracing::field::Empty,
        );
        if let Some(trace_id) = signature.headers.get("trace_id").and_then(Value::as_str) {
            span.record("trace_id", trace_id);
        }
        let ctx = TaskContext::for_signature(&signature, span, self.cancel_root.child_token());

        self.backend
            .set_state_received(&signature)
            .await
            .map_err(|source| ProcessError::State {
                task_id: signature.id.clone(),
                state: StateKind::Received,
                source,
            })?;

        // a bind failure means the invocation is malformed; no retry can
        // fix it, so go straight to the failure path
        let invocation = match Invocation::bind(&descriptor, &signature, ctx) {
            Ok(invocation) => invocation,
            Err(error) => return self.task_failed(&mut signature, &error, None).await,
        };

        self.backend
            .set_state_started(&signature)
            .await
            .map_err(|source| ProcessError::State {
                task_id: signature.id.clone(),
                state: StateKind::Started,
                source,
            })?;

        match invocation.call().await {
            Ok(results) => self.task_succeeded(&mut signature, &results).await,
            Err(failure) => {
                if let Some(delay) = failure.error.retry_in() {
                    self.retry_task_in(&mut signature, delay).await
                } else if failure.error.eligible_for_backoff() && signature.retry_count > 0 {
                    self.task_retry(&mut signature).await
                } else {
                    self.task_failed(&mut signature, &failure.error, failure.trace.as_deref())
                        .await
                }
            }
        }
    }

    /// Success path: record results, fan out callbacks, and evaluate
    /// group completion.
    async fn task_succeeded(
        &self,
        signature: &mut Signature,
        results: &[TaskResult],
    ) -> Result<(), ProcessError> {
        self.backend
            .set_state_success(signature, results)
            .await
            .map_err(|source| ProcessError::State {
                task_id: signature.id.clone(),
                state: StateKind::Success,
                source,
            })?;

        tracing::debug!(
            task_id = %signature.id,
            consumer_tag = %self.consumer_tag,
            "task processed"
        );
        counter!("machina.tasks.succeeded", "task_name" => signature.task_name.clone())
            .increment(1);

        // Success callbacks are published before any group bookkeeping:
        // a chord member's own callbacks fire whether or not the chord
        // is ready.
        let callbacks = std::mem::take(&mut signature.on_success);
        for mut callback in callbacks {
            if !signature.immutable {
                callback
                    .args
                    .extend(results.iter().map(|result| result.value.clone()));
            }
            if let Err(error) = self.broker.publish(&callback).await {
                tracing::warn!(
                    task_id = %callback.id,
                    %error,
                    "failed to publish success callback"
                );
            }
        }

        let Some(group_uuid) = signature.group_uuid.clone() else {
            return Ok(());
        };

        let completed = self
            .backend
            .group_completed(&group_uuid, signature.group_task_count)
            .await
            .map_err(|source| ProcessError::GroupCompleted {
                group_uuid: group_uuid.clone(),
                source,
            })?;
        if !completed {
            return Ok(());
        }

        let outcome = self.evaluate_chord(signature, &group_uuid).await;

        // AMQP-flavored backends accumulate per-group state queues that
        // must be reclaimed once the group has been consumed.
        if self.backend.is_amqp_like() {
            if let Err(error) = self.backend.purge_group_meta(&group_uuid).await {
                tracing::warn!(group_uuid = %group_uuid, %error, "failed to purge group meta");
            }
        }

        outcome
    }

    /// Claims and publishes the chord callback once the group has
    /// completed.
    async fn evaluate_chord(
        &self,
        signature: &mut Signature,
        group_uuid: &str,
    ) -> Result<(), ProcessError> {
        let Some(chord) = signature.chord_callback.take() else {
            return Ok(());
        };
        let mut chord = *chord;

        let should_trigger =
            self.backend
                .trigger_chord(group_uuid)
                .await
                .map_err(|source| ProcessError::TriggerChord {
                    group_uuid: group_uuid.to_string(),
                    source,
                })?;
        if !should_trigger {
            tracing::debug!(group_uuid = %group_uuid, "chord already triggered elsewhere");
            return Ok(());
        }

        let states = match self
            .backend
            .group_task_states(group_uuid, signature.group_task_count)
            .await
        {
            Ok(states) => states,
            Err(error) => {
                // the chord claim is already consumed; redelivering the
                // member would replay its success path for nothing
                tracing::warn!(
                    group_uuid = %group_uuid,
                    %error,
                    "failed to read group task states, abandoning chord"
                );
                return Ok(());
            }
        };

        for state in &states {
            if !state.is_success() {
                tracing::debug!(
                    group_uuid = %group_uuid,
                    member = %state.signature_id,
                    "group member did not succeed, abandoning chord"
                );
                return Ok(());
            }
            if !chord.immutable {
                chord
                    .args
                    .extend(state.results.iter().map(|result| result.value.clone()));
            }
        }

        self.broker
            .publish(&chord)
            .await
            .map_err(|source| ProcessError::Publish {
                task_id: chord.id.clone(),
                source,
            })?;
        counter!("machina.chords.triggered").increment(1);
        Ok(())
    }

    /// Default-backoff retry: consume an attempt, advance the Fibonacci
    /// tier, and republish.
    async fn task_retry(&self, signature: &mut Signature) -> Result<(), ProcessError> {
        self.backend
            .set_state_retry(signature)
            .await
            .map_err(|source| ProcessError::State {
                task_id: signature.id.clone(),
                state: StateKind::Retry,
                source,
            })?;

        signature.retry_count -= 1;
        signature.retry_timeout = fibonacci_next(signature.retry_timeout);
        signature.eta =
            Some(chrono::Utc::now() + chrono::Duration::seconds(i64::from(signature.retry_timeout)));

        tracing::warn!(
            task_id = %signature.id,
            retry_in_secs = signature.retry_timeout,
            remaining_retries = signature.retry_count,
            "task failed, scheduling retry"
        );
        counter!("machina.tasks.retried", "task_name" => signature.task_name.clone())
            .increment(1);

        self.broker
            .publish(signature)
            .await
            .map_err(|source| ProcessError::Publish {
                task_id: signature.id.clone(),
                source,
            })
    }

    /// Explicit-delay retry: republish with the handler's requested ETA,
    /// leaving the retry budget untouched.
    async fn retry_task_in(
        &self,
        signature: &mut Signature,
        delay: std::time::Duration,
    ) -> Result<(), ProcessError> {
        self.backend
            .set_state_retry(signature)
            .await
            .map_err(|source| ProcessError::State {
                task_id: signature.id.clone(),
                state: StateKind::Retry,
                source,
            })?;

        let delay_chrono =
            chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        signature.eta = Some(chrono::Utc::now() + delay_chrono);

        tracing::warn!(
            task_id = %signature.id,
            retry_in_secs = delay.as_secs(),
            "task deferred itself, scheduling retry"
        );
        counter!("machina.tasks.retried", "task_name" => signature.task_name.clone())
            .increment(1);

        self.broker
            .publish(signature)
            .await
            .map_err(|source| ProcessError::Publish {
                task_id: signature.id.clone(),
                source,
            })
    }

    /// Failure path: record the terminal state, report, and fan out
    /// error callbacks.
    async fn task_failed(
        &self,
        signature: &mut Signature,
        error: &TaskError,
        trace: Option<&str>,
    ) -> Result<(), ProcessError> {
        self.backend
            .set_state_failure(signature, &error.to_string())
            .await
            .map_err(|source| ProcessError::State {
                task_id: signature.id.clone(),
                state: StateKind::Failure,
                source,
            })?;

        if let Some(handler) = &self.error_handler {
            handler(error, Some(signature), trace);
        } else {
            tracing::error!(task_id = %signature.id, %error, "failed processing task");
        }
        counter!("machina.tasks.failed", "task_name" => signature.task_name.clone())
            .increment(1);

        // error callbacks always receive the error string as their first
        // argument, immutable or not
        for callback in &mut signature.on_error {
            let mut args = Vec::with_capacity(callback.args.len() + 1);
            args.push(Value::String(error.to_string()));
            args.append(&mut callback.args);
            callback.args = args;

            if let Err(publish_error) = self.broker.publish(callback).await {
                tracing::warn!(
                    task_id = %callback.id,
                    error = %publish_error,
                    "failed to publish error callback"
                );
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("consumer_tag", &self.consumer_tag)
            .field("concurrency", &self.concurrency)
            .field("queue", &self.queue)
            .field("registered_tasks", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TaskProcessor for Worker {
    async fn process(&self, signature: Signature) -> Result<(), ProcessError> {
        self.process_signature(signature).await
    }
}
