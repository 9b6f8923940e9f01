//! One-shot background tasks.
//!
//! A task is a routine that runs once on its own member thread and
//! finishes; it returns no value — the worker mediator is the
//! value-returning path. The controller reaps finished members every
//! iteration and surfaces failures through the event bus.

use std::thread::JoinHandle;

use tracing::{debug, info};

use crate::clock::epoch_now;
use crate::error::{Error, Result};

/// Capability for task objects: `setup()` once, then `start()`.
pub trait Task: Send + 'static {
    /// Prepare the task before it starts.
    ///
    /// # Errors
    ///
    /// A setup error fails the task without `start` being called.
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Run the task to completion.
    ///
    /// # Errors
    ///
    /// The error is surfaced through the controller's error dispatch.
    fn start(&mut self) -> Result<()>;
}

/// Completion record of a reaped task.
#[derive(Debug)]
pub struct TaskExit {
    /// Runner-local task id.
    pub id: u64,
    /// Task name given at spawn.
    pub name: String,
    /// Failure description; `None` on clean exit.
    pub error: Option<String>,
}

struct TaskMember {
    id: u64,
    name: String,
    handle: Option<JoinHandle<Result<()>>>,
    spawned_at: f64,
}

/// Registry of live one-shot task members.
#[derive(Default)]
pub struct TaskRunner {
    members: Vec<TaskMember>,
    next_id: u64,
}

impl TaskRunner {
    /// Create an empty runner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `routine` on a fresh member thread and track it.
    ///
    /// # Errors
    ///
    /// Returns an error when the thread cannot be spawned.
    pub fn spawn<F>(&mut self, name: &str, routine: F) -> Result<u64>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        let handle = std::thread::Builder::new()
            .name(format!("task-{name}-{id}"))
            .spawn(routine)
            .map_err(|e| Error::runtime_with_source("failed to spawn task member", e))?;
        debug!(task = name, id, "task member spawned");
        self.members.push(TaskMember {
            id,
            name: name.to_string(),
            handle: Some(handle),
            spawned_at: epoch_now(),
        });
        Ok(id)
    }

    /// Spawn a [`Task`] object: `setup()` then `start()` on the member.
    ///
    /// # Errors
    ///
    /// Returns an error when the thread cannot be spawned.
    pub fn spawn_task<T: Task>(&mut self, name: &str, mut task: T) -> Result<u64> {
        self.spawn(name, move || {
            task.setup()?;
            task.start()
        })
    }

    /// Number of members still running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.members.len()
    }

    /// Collect every finished member, in spawn order.
    pub fn reap(&mut self) -> Vec<TaskExit> {
        let mut exits = Vec::new();
        self.members.retain_mut(|member| {
            let finished = member
                .handle
                .as_ref()
                .is_some_and(JoinHandle::is_finished);
            if !finished {
                return true;
            }
            if let Some(handle) = member.handle.take() {
                exits.push(exit_of(member, handle));
            }
            false
        });
        exits
    }

    /// Wait for every member to finish and collect the results.
    pub fn join_all(&mut self) -> Vec<TaskExit> {
        let mut exits = Vec::new();
        for mut member in self.members.drain(..) {
            if let Some(handle) = member.handle.take() {
                exits.push(exit_of(&member, handle));
            }
        }
        if !exits.is_empty() {
            info!(count = exits.len(), "joined remaining task members");
        }
        exits
    }
}

fn exit_of(member: &TaskMember, handle: JoinHandle<Result<()>>) -> TaskExit {
    let error = match handle.join() {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(panic) => Some(format!(
            "task panicked: {}",
            panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string())
        )),
    };
    debug!(
        task = %member.name,
        id = member.id,
        lived_secs = epoch_now() - member.spawned_at,
        clean = error.is_none(),
        "task member reaped"
    );
    TaskExit {
        id: member.id,
        name: member.name.clone(),
        error,
    }
}
