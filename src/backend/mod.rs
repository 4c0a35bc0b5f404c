//! Result backend contract: the durable store of task states and group
//! metadata.
//!
//! Concrete stores (DynamoDB and friends) live outside this crate; they
//! implement [`Backend`]. [`InMemoryBackend`] is the in-process reference
//! store used by the integration tests and for local prototyping.
//!
//! State transitions are idempotent per state, so at-least-once delivery
//! can replay them safely. Chord triggering is the one operation that
//! must be atomic across workers: [`Backend::trigger_chord`] is a
//! test-and-set that returns true to exactly one caller per group.

mod memory;

use async_trait::async_trait;

use crate::models::{Signature, TaskResult, TaskState};

pub use memory::InMemoryBackend;

/// Errors surfaced by a result backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The underlying store failed.
    #[error("backend storage error: {0}")]
    Storage(String),

    /// No state recorded for the given signature.
    #[error("task state for {0} not found")]
    NotFound(String),

    /// No bookkeeping recorded for the given group.
    #[error("group {0} not found")]
    GroupNotFound(String),
}

/// The durable state store contract consumed by workers.
///
/// Implementations must be safe for concurrent use; one backend handle is
/// shared by every in-flight task of every worker process.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Records group membership in submission order. Called by the
    /// submitting client; workers also self-register members on their
    /// first state transition, so groups work even when this was never
    /// called.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the store rejected the write.
    async fn init_group(&self, group_uuid: &str, task_ids: &[String]) -> Result<(), BackendError>;

    /// Transitions the task to `RECEIVED`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the store rejected the write.
    async fn set_state_received(&self, signature: &Signature) -> Result<(), BackendError>;

    /// Transitions the task to `STARTED`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the store rejected the write.
    async fn set_state_started(&self, signature: &Signature) -> Result<(), BackendError>;

    /// Transitions the task to `RETRY`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the store rejected the write.
    async fn set_state_retry(&self, signature: &Signature) -> Result<(), BackendError>;

    /// Transitions the task to `SUCCESS`, recording its results.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the store rejected the write.
    async fn set_state_success(
        &self,
        signature: &Signature,
        results: &[TaskResult],
    ) -> Result<(), BackendError>;

    /// Transitions the task to `FAILURE`, recording the error message.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the store rejected the write.
    async fn set_state_failure(
        &self,
        signature: &Signature,
        error: &str,
    ) -> Result<(), BackendError>;

    /// Returns the current state of a task.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotFound`] if no state was ever recorded.
    async fn task_state(&self, signature_id: &str) -> Result<TaskState, BackendError>;

    /// Returns true iff `group_task_count` members of the group have
    /// reached a terminal state (`SUCCESS` or `FAILURE`).
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the store could not be read.
    async fn group_completed(
        &self,
        group_uuid: &str,
        group_task_count: usize,
    ) -> Result<bool, BackendError>;

    /// Returns the members' states ordered by submission.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the group or any member state is
    /// missing.
    async fn group_task_states(
        &self,
        group_uuid: &str,
        group_task_count: usize,
    ) -> Result<Vec<TaskState>, BackendError>;

    /// Atomically claims the group's chord. Exactly one caller across
    /// all workers observes `true`; every later caller observes `false`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the store rejected the conditional
    /// write.
    async fn trigger_chord(&self, group_uuid: &str) -> Result<bool, BackendError>;

    /// Releases the group's bookkeeping. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the store rejected the delete.
    async fn purge_group_meta(&self, group_uuid: &str) -> Result<(), BackendError>;

    /// True for AMQP-flavored backends, which accumulate per-group state
    /// queues that the worker purges after chord evaluation.
    fn is_amqp_like(&self) -> bool {
        false
    }
}
