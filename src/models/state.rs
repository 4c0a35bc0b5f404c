use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::result::TaskResult;
use super::signature::Signature;

/// Lifecycle state of a task as tracked by the result backend.
///
/// Tasks progress `Pending` -> `Received` -> `Started` and then reach one
/// of the terminal states `Success` or `Failure`. `Retry` is transient: a
/// new `Received` follows when the republished signature is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateKind {
    /// Task has been submitted but not yet seen by a worker.
    Pending,
    /// A worker has accepted the delivery.
    Received,
    /// The handler is executing.
    Started,
    /// Task completed successfully.
    Success,
    /// Task terminally failed.
    Failure,
    /// Task failed and has been republished with a new ETA.
    Retry,
}

impl Default for StateKind {
    fn default() -> Self {
        Self::Pending
    }
}

impl StateKind {
    /// All state variants.
    pub const ALL: &'static [Self] = &[
        Self::Pending,
        Self::Received,
        Self::Started,
        Self::Success,
        Self::Failure,
        Self::Retry,
    ];

    /// Wire name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Received => "RECEIVED",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Retry => "RETRY",
        }
    }

    /// Returns true for `Success` and `Failure`, the states a task cannot
    /// leave.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RECEIVED" => Ok(Self::Received),
            "STARTED" => Ok(Self::Started),
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            "RETRY" => Ok(Self::Retry),
            _ => Err(()),
        }
    }
}

/// Backend-owned record of a task's current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    /// Id of the signature this record belongs to.
    pub signature_id: String,
    /// Current lifecycle state.
    pub state: StateKind,
    /// Results captured on success.
    #[serde(default)]
    pub results: Vec<TaskResult>,
    /// Error message captured on failure.
    #[serde(default)]
    pub error: Option<String>,
    /// When this state was recorded.
    pub created_at: DateTime<Utc>,
}

impl TaskState {
    fn for_signature(signature: &Signature, state: StateKind) -> Self {
        Self {
            signature_id: signature.id.clone(),
            state,
            results: Vec::new(),
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Builds a `RECEIVED` record for `signature`.
    #[must_use]
    pub fn received(signature: &Signature) -> Self {
        Self::for_signature(signature, StateKind::Received)
    }

    /// Builds a `STARTED` record for `signature`.
    #[must_use]
    pub fn started(signature: &Signature) -> Self {
        Self::for_signature(signature, StateKind::Started)
    }

    /// Builds a `RETRY` record for `signature`.
    #[must_use]
    pub fn retry(signature: &Signature) -> Self {
        Self::for_signature(signature, StateKind::Retry)
    }

    /// Builds a `SUCCESS` record carrying the task's results.
    #[must_use]
    pub fn success(signature: &Signature, results: Vec<TaskResult>) -> Self {
        let mut state = Self::for_signature(signature, StateKind::Success);
        state.results = results;
        state
    }

    /// Builds a `FAILURE` record carrying the error message.
    #[must_use]
    pub fn failure(signature: &Signature, error: impl Into<String>) -> Self {
        let mut state = Self::for_signature(signature, StateKind::Failure);
        state.error = Some(error.into());
        state
    }

    /// Returns true if the task succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.state, StateKind::Success)
    }

    /// Returns true if the task reached a terminal state.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Backend-owned bookkeeping for a group of signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMeta {
    /// The group's identifier.
    pub group_uuid: String,
    /// Member signature ids in submission order.
    pub task_ids: Vec<String>,
    /// Set once the group's chord has been claimed by a worker.
    pub chord_triggered: bool,
    /// When the group was first seen.
    pub created_at: DateTime<Utc>,
    /// When this record may be reclaimed.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl GroupMeta {
    /// Creates empty bookkeeping for `group_uuid`.
    #[must_use]
    pub fn new(group_uuid: impl Into<String>) -> Self {
        Self {
            group_uuid: group_uuid.into(),
            task_ids: Vec::new(),
            chord_triggered: false,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Records a member id, keeping first-seen order and ignoring
    /// duplicates (deliveries are at-least-once).
    pub fn register(&mut self, task_id: &str) {
        if !self.task_ids.iter().any(|id| id == task_id) {
            self.task_ids.push(task_id.to_string());
        }
    }
}
