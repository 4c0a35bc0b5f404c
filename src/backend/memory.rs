//! In-process result backend backed by hash maps.
//!
//! Records expire after the configured TTL and are swept opportunistically
//! on writes. Chord triggering takes the write lock for its test-and-set,
//! which is what makes it atomic across every worker task in the process.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::config::DEFAULT_RESULTS_EXPIRE_IN;
use crate::models::{GroupMeta, Signature, StateKind, TaskResult, TaskState};

use super::{Backend, BackendError};

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<String, TaskState>,
    groups: HashMap<String, GroupMeta>,
    /// Transition journal, oldest first. Kept so tests and operators can
    /// observe state progressions, not just the latest state.
    journal: Vec<(String, StateKind)>,
}

/// An in-memory [`Backend`] for tests and local prototyping.
#[derive(Debug)]
pub struct InMemoryBackend {
    inner: RwLock<Inner>,
    expires_in: Duration,
    amqp_like: bool,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Creates a backend with the default results TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_expiry(DEFAULT_RESULTS_EXPIRE_IN)
    }

    /// Creates a backend whose records expire after `expires_in_seconds`.
    #[must_use]
    pub fn with_expiry(expires_in_seconds: u64) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            expires_in: Duration::seconds(i64::try_from(expires_in_seconds).unwrap_or(i64::MAX)),
            amqp_like: false,
        }
    }

    /// Flags this backend as AMQP-flavored, opting it into the worker's
    /// post-chord group purge. Exists so that purge path can be exercised
    /// without a real AMQP store.
    #[must_use]
    pub fn with_amqp_semantics(mut self) -> Self {
        self.amqp_like = true;
        self
    }

    /// Returns the recorded state transitions for a task, oldest first.
    pub async fn state_history(&self, signature_id: &str) -> Vec<StateKind> {
        self.inner
            .read()
            .await
            .journal
            .iter()
            .filter(|(id, _)| id == signature_id)
            .map(|(_, state)| *state)
            .collect()
    }

    /// Returns the group bookkeeping, if it exists.
    pub async fn group_meta(&self, group_uuid: &str) -> Option<GroupMeta> {
        self.inner.read().await.groups.get(group_uuid).cloned()
    }

    async fn record(&self, signature: &Signature, state: TaskState) {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        sweep(&mut inner, now, self.expires_in);
        if let Some(group_uuid) = &signature.group_uuid {
            let meta = inner
                .groups
                .entry(group_uuid.clone())
                .or_insert_with(|| expiring_meta(group_uuid, now, self.expires_in));
            meta.register(&signature.id);
        }
        inner.journal.push((signature.id.clone(), state.state));
        inner.states.insert(signature.id.clone(), state);
    }
}

fn expiring_meta(group_uuid: &str, now: DateTime<Utc>, expires_in: Duration) -> GroupMeta {
    let mut meta = GroupMeta::new(group_uuid);
    meta.expires_at = Some(now + expires_in);
    meta
}

fn sweep(inner: &mut Inner, now: DateTime<Utc>, expires_in: Duration) {
    inner
        .states
        .retain(|_, state| state.created_at + expires_in > now);
    inner
        .groups
        .retain(|_, meta| meta.expires_at.map_or(true, |at| at > now));
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn init_group(&self, group_uuid: &str, task_ids: &[String]) -> Result<(), BackendError> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        sweep(&mut inner, now, self.expires_in);
        let meta = inner
            .groups
            .entry(group_uuid.to_string())
            .or_insert_with(|| expiring_meta(group_uuid, now, self.expires_in));
        for task_id in task_ids {
            meta.register(task_id);
        }
        Ok(())
    }

    async fn set_state_received(&self, signature: &Signature) -> Result<(), BackendError> {
        self.record(signature, TaskState::received(signature)).await;
        Ok(())
    }

    async fn set_state_started(&self, signature: &Signature) -> Result<(), BackendError> {
        self.record(signature, TaskState::started(signature)).await;
        Ok(())
    }

    async fn set_state_retry(&self, signature: &Signature) -> Result<(), BackendError> {
        self.record(signature, TaskState::retry(signature)).await;
        Ok(())
    }

    async fn set_state_success(
        &self,
        signature: &Signature,
        results: &[TaskResult],
    ) -> Result<(), BackendError> {
        self.record(signature, TaskState::success(signature, results.to_vec()))
            .await;
        Ok(())
    }

    async fn set_state_failure(
        &self,
        signature: &Signature,
        error: &str,
    ) -> Result<(), BackendError> {
        self.record(signature, TaskState::failure(signature, error))
            .await;
        Ok(())
    }

    async fn task_state(&self, signature_id: &str) -> Result<TaskState, BackendError> {
        self.inner
            .read()
            .await
            .states
            .get(signature_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(signature_id.to_string()))
    }

    async fn group_completed(
        &self,
        group_uuid: &str,
        group_task_count: usize,
    ) -> Result<bool, BackendError> {
        let inner = self.inner.read().await;
        let Some(meta) = inner.groups.get(group_uuid) else {
            return Ok(false);
        };
        let completed = meta
            .task_ids
            .iter()
            .filter(|id| {
                inner
                    .states
                    .get(id.as_str())
                    .is_some_and(TaskState::is_completed)
            })
            .count();
        Ok(completed >= group_task_count)
    }

    async fn group_task_states(
        &self,
        group_uuid: &str,
        group_task_count: usize,
    ) -> Result<Vec<TaskState>, BackendError> {
        let inner = self.inner.read().await;
        let meta = inner
            .groups
            .get(group_uuid)
            .ok_or_else(|| BackendError::GroupNotFound(group_uuid.to_string()))?;
        meta.task_ids
            .iter()
            .take(group_task_count)
            .map(|id| {
                inner
                    .states
                    .get(id.as_str())
                    .cloned()
                    .ok_or_else(|| BackendError::NotFound(id.clone()))
            })
            .collect()
    }

    async fn trigger_chord(&self, group_uuid: &str) -> Result<bool, BackendError> {
        let mut inner = self.inner.write().await;
        let meta = inner
            .groups
            .get_mut(group_uuid)
            .ok_or_else(|| BackendError::GroupNotFound(group_uuid.to_string()))?;
        if meta.chord_triggered {
            return Ok(false);
        }
        meta.chord_triggered = true;
        Ok(true)
    }

    async fn purge_group_meta(&self, group_uuid: &str) -> Result<(), BackendError> {
        self.inner.write().await.groups.remove(group_uuid);
        Ok(())
    }

    fn is_amqp_like(&self) -> bool {
        self.amqp_like
    }
}
