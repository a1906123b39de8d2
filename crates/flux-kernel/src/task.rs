//! Task, command, and state types shared by the scheduler's public API.

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::resources::Resources;

pub type TaskId = Uuid;

/// How a [`Command`]'s child process output should be handled, and whether
/// it is expected to exit promptly or run indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdExecType {
    /// Run to completion; stdout/stderr are not captured.
    Run,
    /// Run to completion; stdout is captured and returned.
    Output,
    /// Run to completion; stdout and stderr are captured merged.
    Combined,
    /// Runs indefinitely until killed or it exits on its own; stdio is
    /// inherited from the parent.
    LongRunning,
}

/// An external command the scheduler should execute.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
    pub exec_type: CmdExecType,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<String>, exec_type: CmdExecType) -> Self {
        Self {
            name: name.into(),
            args,
            exec_type,
        }
    }
}

/// Terminal and non-terminal lifecycle states for a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Killed,
    /// The task's process handle was waited on twice; indicates an internal
    /// scheduler bug rather than a process failure.
    Dead,
    Unknown,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Killed | TaskState::Dead
        )
    }
}

/// The result delivered to `on_launch_complete`: either the task started (and
/// for `Output`/`Combined` tasks, its captured output) or it failed to start
/// or to run to completion.
#[derive(Debug, Clone)]
pub struct LaunchResult {
    pub output: Option<Vec<u8>>,
    pub error: Option<String>,
}

/// A task as tracked internally by the scheduler.
///
/// `scheduling_tries` counts admission attempts (including denials that led
/// to a deferred re-enqueue); `scheduling_retries` is the budget before the
/// scheduler gives up and reports a launch failure.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub resources: Resources,
    pub command: Command,
    pub priority: i64,
    pub scheduling_retries: u32,
    pub scheduling_tries: u32,
    pub state: TaskState,
    pub queue_time: DateTime<Utc>,
    pub launch_time: Option<SystemTime>,
}

impl Task {
    pub fn new(request: &TaskRequest) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: request.name.clone(),
            resources: request.resources,
            command: request.command.clone(),
            priority: request.priority,
            scheduling_retries: request.scheduling_retries,
            scheduling_tries: 0,
            state: TaskState::Queued,
            queue_time: Utc::now(),
            launch_time: None,
        }
    }
}

/// A callback invoked once, when a task finishes launching (or fails to).
pub type OnLaunchComplete = Box<dyn FnOnce(LaunchResult) + Send + Sync>;

/// A callback invoked once, when a `LongRunning` task's process exits.
pub type OnTaskComplete = Box<dyn FnOnce(TaskState) + Send + Sync>;

/// The caller-supplied description of work to schedule.
pub struct TaskRequest {
    pub name: String,
    pub resources: Resources,
    pub command: Command,
    /// Higher values run first; ties broken oldest-first at equal priority,
    /// and the younger of equal-priority `LongRunning` tasks is preempted
    /// first when resources must be reclaimed.
    pub priority: i64,
    pub scheduling_retries: u32,
    pub on_launch_complete: OnLaunchComplete,
    pub on_task_complete: Option<OnTaskComplete>,
}

impl std::fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRequest")
            .field("name", &self.name)
            .field("resources", &self.resources)
            .field("command", &self.command)
            .field("priority", &self.priority)
            .field("scheduling_retries", &self.scheduling_retries)
            .finish_non_exhaustive()
    }
}
