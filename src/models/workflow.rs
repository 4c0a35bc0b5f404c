//! Workflow composition: chains, groups, and chords.
//!
//! These constructors only arrange signatures; nothing here talks to a
//! broker or backend. A chain nests successors into `on_success`, a group
//! stamps shared membership onto its tasks, and a chord attaches the
//! fan-in callback to every member. Workers discover the structure from
//! the signatures themselves as they process them.

use uuid::Uuid;

use super::signature::Signature;

/// A linear composition of tasks.
///
/// Each task is published only after its predecessor succeeds, and (unless
/// the predecessor is immutable) receives the predecessor's results as
/// extra trailing arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    /// First task of the chain, with every successor nested inside its
    /// `on_success` graph.
    pub head: Signature,
}

impl Chain {
    /// Links `tasks` into a chain. Returns `None` for an empty slice,
    /// since a chain needs a head to publish.
    #[must_use]
    pub fn new(tasks: Vec<Signature>) -> Option<Self> {
        let mut iter = tasks.into_iter().rev();
        let mut head = iter.next()?;
        for mut task in iter {
            task.on_success.push(head);
            head = task;
        }
        Some(Self { head })
    }
}

/// A set of tasks tracked for collective completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    /// Identifier shared by every member.
    pub group_uuid: String,
    /// The member signatures, stamped with the group id and size.
    pub tasks: Vec<Signature>,
}

impl Group {
    /// Stamps `tasks` with a fresh group id and the group size.
    #[must_use]
    pub fn new(tasks: Vec<Signature>) -> Self {
        let group_uuid = format!("group_{}", Uuid::new_v4());
        let count = tasks.len();
        let tasks = tasks
            .into_iter()
            .map(|mut task| {
                task.group_uuid = Some(group_uuid.clone());
                task.group_task_count = count;
                task
            })
            .collect();
        Self { group_uuid, tasks }
    }

    /// Member ids in submission order, for [`Backend::init_group`].
    ///
    /// [`Backend::init_group`]: crate::backend::Backend::init_group
    #[must_use]
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|task| task.id.clone()).collect()
    }
}

/// A group plus a callback that runs once after every member completes.
///
/// The callback receives the concatenation of all members' results as
/// trailing arguments unless it is marked immutable. If any member does
/// not succeed, the callback is abandoned.
#[derive(Debug, Clone, PartialEq)]
pub struct Chord {
    /// The member group, each task stamped with the callback.
    pub group: Group,
    /// The fan-in callback.
    pub callback: Signature,
}

impl Chord {
    /// Attaches `callback` to every member of `group`.
    #[must_use]
    pub fn new(mut group: Group, callback: Signature) -> Self {
        for task in &mut group.tasks {
            task.chord_callback = Some(Box::new(callback.clone()));
        }
        Self { group, callback }
    }
}
