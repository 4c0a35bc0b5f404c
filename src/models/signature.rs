use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Headers attached to a task invocation.
///
/// Headers travel with the signature over the broker and carry trace
/// context and arbitrary user metadata. Non-string values are allowed but
/// only string values participate in trace propagation.
pub type Headers = HashMap<String, Value>;

/// A single task invocation.
///
/// A `Signature` describes everything a worker needs to run one task:
/// identity, routing, arguments, retry policy, and the callback graph to
/// fan out into afterwards. Signatures are created by the submitting
/// client, serialized onto the broker, and owned by exactly one worker
/// invocation from delivery to acknowledgment.
///
/// Use [`Signature::new`] to create one with a generated id, then the
/// `with_*` builder methods for the optional fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    /// Unique identifier for this invocation.
    pub id: String,

    /// Registry key naming the handler that should run this task.
    pub task_name: String,

    /// Optional routing hint for brokers that support it.
    #[serde(default)]
    pub routing_key: Option<String>,

    /// Ordered positional arguments, as deserialized from the wire.
    #[serde(default)]
    pub args: Vec<Value>,

    /// Trace context and user metadata.
    #[serde(default)]
    pub headers: Headers,

    /// Earliest wall-clock execution time. Brokers hold the message until
    /// this instant has passed.
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,

    /// Remaining default-backoff retry attempts.
    #[serde(default)]
    pub retry_count: u32,

    /// Current backoff tier in seconds. Advanced through the Fibonacci
    /// successor on each default retry.
    #[serde(default)]
    pub retry_timeout: u32,

    /// When true, task results are not forwarded into callback arguments.
    #[serde(default)]
    pub immutable: bool,

    /// Callbacks published after this task succeeds.
    #[serde(default)]
    pub on_success: Vec<Signature>,

    /// Callbacks published after this task terminally fails.
    #[serde(default)]
    pub on_error: Vec<Signature>,

    /// Callback published once when every member of the group has
    /// completed. Set on each member by [`Chord::new`](crate::models::Chord::new).
    #[serde(default)]
    pub chord_callback: Option<Box<Signature>>,

    /// Group this signature belongs to, if any.
    #[serde(default)]
    pub group_uuid: Option<String>,

    /// Size of the group when `group_uuid` is set.
    #[serde(default)]
    pub group_task_count: usize,
}

impl Signature {
    /// Creates a new signature with a generated `task_<uuid>` id.
    #[must_use]
    pub fn new(task_name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id: format!("task_{}", Uuid::new_v4()),
            task_name: task_name.into(),
            routing_key: None,
            args,
            headers: Headers::new(),
            eta: None,
            retry_count: 0,
            retry_timeout: 0,
            immutable: false,
            on_success: Vec::new(),
            on_error: Vec::new(),
            chord_callback: None,
            group_uuid: None,
            group_task_count: 0,
        }
    }

    /// Sets the broker routing key.
    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Sets the earliest execution time.
    #[must_use]
    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// Sets the number of default-backoff retry attempts.
    #[must_use]
    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Marks the signature immutable: its results will not be appended to
    /// callback arguments.
    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    /// Adds a header entry.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    /// Appends a success callback.
    #[must_use]
    pub fn with_success_callback(mut self, callback: Signature) -> Self {
        self.on_success.push(callback);
        self
    }

    /// Appends an error callback.
    #[must_use]
    pub fn with_error_callback(mut self, callback: Signature) -> Self {
        self.on_error.push(callback);
        self
    }

    /// Returns true if this signature belongs to a group.
    #[must_use]
    pub fn in_group(&self) -> bool {
        self.group_uuid.is_some()
    }
}
