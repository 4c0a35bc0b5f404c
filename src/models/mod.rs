//! Core data model: signatures, results, states, retry policy, and
//! workflow composition.

mod error;
mod result;
mod retry;
mod signature;
mod state;
mod workflow;

pub use error::TaskError;
pub use result::{type_tag_of, TaskResult};
pub use retry::fibonacci_next;
pub use signature::{Headers, Signature};
pub use state::{GroupMeta, StateKind, TaskState};
pub use workflow::{Chain, Chord, Group};
