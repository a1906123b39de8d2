//! Flux resource-aware process scheduler.
//!
//! This crate provides the bottom layer of the submission evaluation core:
//!
//! - **[`resources`]** -- integer CPU/memory accounting with saturating
//!   arithmetic.
//! - **[`task`]** -- the task/command/state model shared by the scheduler's
//!   public API.
//! - **[`scheduler`]** -- admission, preemption, and execution of external
//!   commands under a fixed resource budget.
//! - **[`wait_queue`]** -- a process-wide delayed re-enqueue primitive used
//!   by the scheduler (and reusable by `flux-nyx`) for short backoffs.
//! - **[`error`]** -- the unified error taxonomy shared by every crate in the
//!   workspace.
//!
//! Everything here is `Send + Sync` and designed to run inside a
//! multi-threaded tokio runtime.

pub mod error;
pub mod resources;
pub mod scheduler;
pub mod task;
pub mod wait_queue;

pub use error::{FluxError, Result};
pub use resources::Resources;
pub use scheduler::Scheduler;
pub use task::{
    CmdExecType, Command, LaunchResult, OnLaunchComplete, OnTaskComplete, Task, TaskId,
    TaskRequest, TaskState,
};
pub use wait_queue::WaitQueue;
