//! Resource-aware process scheduler.
//!
//! Owns a fixed `(CPU, Memory)` budget and admits [`Task`]s against it,
//! preempting lower-priority [`CmdExecType::LongRunning`] tasks when a
//! higher-priority request cannot otherwise fit. See `plan` for the
//! admission algorithm and `kill_victims` for the preemption protocol.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::{FluxError, Result};
use crate::resources::Resources;
use crate::task::{CmdExecType, LaunchResult, OnLaunchComplete, OnTaskComplete, Task, TaskId, TaskRequest, TaskState};
use crate::wait_queue::WaitQueue;

/// Anti-starvation priority bump applied to a deferred task on each denial.
const DEFER_PRIORITY_BUMP: i64 = 10;
/// Backoff before a deferred task is re-enqueued.
const DEFER_DELAY: Duration = Duration::from_secs(5);
/// Grace window the kill protocol waits for SIGTERM to take effect before
/// escalating to SIGKILL.
const KILL_GRACE_WINDOW: Duration = Duration::from_millis(2000);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Callbacks and live-process control a task needs beyond what's tracked in
/// [`Task`] itself (which is plain data so it can be cloned for `plan`'s
/// preemption scan).
struct TaskControl {
    on_launch_complete: Option<OnLaunchComplete>,
    on_task_complete: Option<OnTaskComplete>,
    /// Set once a `LongRunning` child has actually been spawned.
    pid: Option<i32>,
    /// Guards against a double `wait()`, the `WaitAlreadyCalled` sentinel.
    waited: bool,
}

/// Lock-free-ish, priority-aware, resource-bounded process scheduler.
///
/// Cheaply cloneable; every clone shares the same admission state. Call
/// [`Scheduler::start`] once to spawn the launch loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    budget: Resources,
    free: AsyncMutex<Resources>,
    tasks: DashMap<TaskId, Task>,
    control: DashMap<TaskId, TaskControl>,
    task_tx: mpsc::Sender<TaskId>,
    task_rx: AsyncMutex<Option<mpsc::Receiver<TaskId>>>,
    release_tx: mpsc::Sender<Resources>,
    release_rx: AsyncMutex<mpsc::Receiver<Resources>>,
    wait_queue: WaitQueue,
}

impl Scheduler {
    /// Create a scheduler with the given resource budget. `queue_capacity`
    /// bounds the scheduler's task-admission channel; the release channel is
    /// sized generously so returning resources never blocks in practice.
    pub fn new(budget: Resources, queue_capacity: usize) -> Self {
        let (task_tx, task_rx) = mpsc::channel(queue_capacity.max(1));
        let (release_tx, release_rx) = mpsc::channel(queue_capacity.max(1) * 4 + 256);
        Self {
            inner: Arc::new(Inner {
                budget,
                free: AsyncMutex::new(budget),
                tasks: DashMap::new(),
                control: DashMap::new(),
                task_tx,
                task_rx: AsyncMutex::new(Some(task_rx)),
                release_tx,
                release_rx: AsyncMutex::new(release_rx),
                wait_queue: WaitQueue::new(),
            }),
        }
    }

    /// Spawn the wait queue's background tick and the launch loop. Returns
    /// the launch loop's join handle.
    pub fn start(&self) -> JoinHandle<()> {
        self.inner.wait_queue.start();
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.launch_loop().await;
        })
    }

    /// Admit a task request. Returns the assigned task id immediately; the
    /// request's fate (admit, preempt-then-admit, deny, or retry-exhausted
    /// failure) is reported asynchronously via `on_launch_complete`.
    #[instrument(skip(self, request), fields(task_name = %request.name))]
    pub async fn schedule(&self, request: TaskRequest) -> Result<TaskId> {
        if request.priority < 0 {
            return Err(FluxError::InvalidRequest("priority must be non-negative".into()));
        }
        let task = Task::new(&request);
        let id = task.id;
        self.inner.tasks.insert(id, task);
        self.inner.control.insert(
            id,
            TaskControl {
                on_launch_complete: Some(request.on_launch_complete),
                on_task_complete: request.on_task_complete,
                pid: None,
                waited: false,
            },
        );
        self.inner
            .task_tx
            .send(id)
            .await
            .map_err(|_| FluxError::Internal("scheduler task queue closed".into()))?;
        Ok(id)
    }

    /// Current lifecycle state of a task, or `NotFound` once it has been
    /// reaped from the task map.
    pub fn get_task_state(&self, task_id: TaskId) -> Result<TaskState> {
        self.inner
            .tasks
            .get(&task_id)
            .map(|t| t.state)
            .ok_or(FluxError::NotFound {
                entity: "task",
                id: task_id.to_string(),
            })
    }

    /// Send the OS kill protocol at a single live task (used for external
    /// cancellation, distinct from the scheduler's own preemption path).
    pub async fn kill_task(&self, task_id: TaskId) -> Result<()> {
        let pid = self
            .inner
            .control
            .get(&task_id)
            .and_then(|c| c.pid)
            .ok_or(FluxError::NotFound {
                entity: "task",
                id: task_id.to_string(),
            })?;
        kill_one(task_id, pid).await
    }

    // ── launch loop ──────────────────────────────────────────────────

    async fn launch_loop(&self) {
        let mut rx = self
            .inner
            .task_rx
            .lock()
            .await
            .take()
            .expect("launch_loop started twice");
        while let Some(id) = rx.recv().await {
            self.drain_releases().await;
            let Some(mut task) = self.inner.tasks.get_mut(&id).map(|mut e| {
                e.scheduling_tries += 1;
                e.value().clone()
            }) else {
                continue;
            };

            match self.plan(&task).await {
                PlanOutcome::Admit => {
                    self.dispatch(task).await;
                }
                PlanOutcome::Deny => {
                    let retries = task.scheduling_retries;
                    if task.scheduling_tries >= retries {
                        self.fail_launch(
                            &mut task,
                            FluxError::TaskLaunchError {
                                task_id: task.id,
                                reason: format!(
                                    "denied after {} scheduling attempts",
                                    task.scheduling_tries
                                ),
                            },
                        );
                    } else {
                        self.defer(task).await;
                    }
                }
            }
        }
    }

    async fn drain_releases(&self) {
        let mut rx = self.inner.release_rx.lock().await;
        let mut free = self.inner.free.lock().await;
        // Non-blocking drain with a short grace window: give in-flight
        // releases a brief moment to land before we snapshot `free`.
        tokio::time::sleep(Duration::from_millis(1)).await;
        while let Ok(resources) = rx.try_recv() {
            *free = free.add(resources);
        }
    }

    /// Admission + preemption decision. Holds `free` for the entire
    /// plan-kill-reserve sequence so it is atomic with respect to any other
    /// concurrent admission (there is only one launch loop, but `kill_task`
    /// and releases can race the resource pool independently).
    async fn plan(&self, task: &Task) -> PlanOutcome {
        let mut free = self.inner.free.lock().await;
        if free.greater(task.resources) {
            *free = free.checked_use(task.resources).unwrap_or(*free);
            return PlanOutcome::Admit;
        }

        let mut candidates: Vec<Task> = self
            .inner
            .tasks
            .iter()
            .filter(|e| {
                e.value().id != task.id
                    && e.value().command.exec_type == CmdExecType::LongRunning
                    && e.value().state == TaskState::Running
                    && e.value().priority < task.priority
            })
            .map(|e| e.value().clone())
            .collect();

        // Ascending by priority; ties broken by younger launch_time first
        // (the newest among equals is preempted first).
        candidates.sort_by(|a, b| {
            a.priority.cmp(&b.priority).then_with(|| {
                b.launch_time
                    .unwrap_or(SystemTime::UNIX_EPOCH)
                    .cmp(&a.launch_time.unwrap_or(SystemTime::UNIX_EPOCH))
            })
        });

        let mut projected = *free;
        let mut victims = Vec::new();
        for candidate in candidates {
            if projected.greater(task.resources) {
                break;
            }
            projected = projected.add(candidate.resources);
            victims.push(candidate);
        }

        if !projected.greater(task.resources) {
            return PlanOutcome::Deny;
        }

        drop(free);
        self.kill_victims(&victims).await;

        let mut rx = self.inner.release_rx.lock().await;
        let mut free = self.inner.free.lock().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        while let Ok(resources) = rx.try_recv() {
            *free = free.add(resources);
        }
        drop(rx);

        if free.greater(task.resources) {
            *free = free.checked_use(task.resources).unwrap_or(*free);
            PlanOutcome::Admit
        } else {
            PlanOutcome::Deny
        }
    }

    async fn kill_victims(&self, victims: &[Task]) {
        let mut handles = Vec::new();
        for victim in victims {
            if let Some(pid) = self.inner.control.get(&victim.id).and_then(|c| c.pid) {
                let task_id = victim.id;
                handles.push(tokio::spawn(async move {
                    if let Err(err) = kill_one(task_id, pid).await {
                        warn!(task_id = %task_id, error = %err, "preemption kill failed");
                    }
                }));
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn defer(&self, mut task: Task) {
        task.priority += DEFER_PRIORITY_BUMP;
        if let Some(mut entry) = self.inner.tasks.get_mut(&task.id) {
            entry.priority = task.priority;
        }
        debug!(task_id = %task.id, new_priority = task.priority, "deferring task after denial");
        let scheduler = self.clone();
        let id = task.id;
        self.inner.wait_queue.add(DEFER_DELAY, move || {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _ = scheduler.inner.task_tx.send(id).await;
            });
        });
    }

    fn fail_launch(&self, task: &mut Task, err: FluxError) {
        if let Some(mut entry) = self.inner.tasks.get_mut(&task.id) {
            entry.state = TaskState::Failed;
        }
        if let Some(mut control) = self.inner.control.get_mut(&task.id) {
            if let Some(cb) = control.on_launch_complete.take() {
                cb(LaunchResult {
                    output: None,
                    error: Some(err.to_string()),
                });
            }
        }
        self.inner.control.remove(&task.id);
    }

    async fn dispatch(&self, mut task: Task) {
        task.launch_time = Some(SystemTime::now());
        if let Some(mut entry) = self.inner.tasks.get_mut(&task.id) {
            entry.launch_time = task.launch_time;
        }

        match task.command.exec_type {
            CmdExecType::LongRunning => self.dispatch_long_running(task).await,
            _ => self.dispatch_short(task).await,
        }
    }

    async fn dispatch_short(&self, task: Task) {
        let mut cmd = build_command(&task);
        let exec_type = task.command.exec_type;
        let (stdout_cfg, stderr_cfg) = match exec_type {
            CmdExecType::Output => (Stdio::piped(), Stdio::null()),
            CmdExecType::Combined => (Stdio::piped(), Stdio::piped()),
            _ => (Stdio::null(), Stdio::null()),
        };
        cmd.stdout(stdout_cfg).stderr(stderr_cfg).stdin(Stdio::null());

        let scheduler = self.clone();
        let task_id = task.id;
        let resources = task.resources;
        tokio::spawn(async move {
            let outcome = match cmd.spawn() {
                Ok(mut child) => {
                    let mut out = Vec::new();
                    if matches!(exec_type, CmdExecType::Output | CmdExecType::Combined) {
                        if let Some(mut stdout) = child.stdout.take() {
                            let _ = stdout.read_to_end(&mut out).await;
                        }
                    }
                    if matches!(exec_type, CmdExecType::Combined) {
                        if let Some(mut stderr) = child.stderr.take() {
                            let _ = stderr.read_to_end(&mut out).await;
                        }
                    }
                    child.wait().await.map(|status| (status, out))
                }
                Err(e) => Err(e),
            };

            let (state, error, output) = match outcome {
                Ok((status, out)) => (terminal_state_from_status(&status), exit_error(&status), Some(out)),
                Err(e) => (TaskState::Failed, Some(e.to_string()), None),
            };

            if let Some(mut entry) = scheduler.inner.tasks.get_mut(&task_id) {
                entry.state = state;
            }
            if let Some(mut control) = scheduler.inner.control.get_mut(&task_id) {
                if let Some(cb) = control.on_launch_complete.take() {
                    cb(LaunchResult { output, error });
                }
            }
            scheduler.inner.control.remove(&task_id);
            let _ = scheduler.inner.release_tx.send(resources).await;
        });
    }

    async fn dispatch_long_running(&self, task: Task) {
        let mut cmd = build_command(&task);
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let task_id = task.id;
        let resources = task.resources;
        let scheduler = self.clone();

        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id().map(|p| p as i32);
                if let Some(mut entry) = self.inner.tasks.get_mut(&task_id) {
                    entry.state = TaskState::Running;
                }
                if let Some(mut control) = self.inner.control.get_mut(&task_id) {
                    control.pid = pid;
                    if let Some(cb) = control.on_launch_complete.take() {
                        cb(LaunchResult { output: None, error: None });
                    }
                }
                tokio::spawn(async move {
                    scheduler.wait_long_running(task_id, resources, child).await;
                });
            }
            Err(e) => {
                let mut task = task;
                self.fail_launch(&mut task, FluxError::TaskLaunchError {
                    task_id,
                    reason: e.to_string(),
                });
                let _ = self.inner.release_tx.send(resources).await;
            }
        }
    }

    async fn wait_long_running(&self, task_id: TaskId, resources: Resources, mut child: Child) {
        let already_waited = self
            .inner
            .control
            .get(&task_id)
            .map(|c| c.waited)
            .unwrap_or(false);

        let state = if already_waited {
            TaskState::Dead
        } else {
            if let Some(mut control) = self.inner.control.get_mut(&task_id) {
                control.waited = true;
            }
            match child.wait().await {
                Ok(status) => terminal_state_from_status(&status),
                Err(_) => TaskState::Failed,
            }
        };

        if let Some(mut entry) = self.inner.tasks.get_mut(&task_id) {
            entry.state = state;
        }
        if let Some((_, mut control)) = self.inner.control.remove(&task_id) {
            if let Some(cb) = control.on_task_complete.take() {
                cb(state);
            }
        }
        let _ = self.inner.release_tx.send(resources).await;
    }
}

enum PlanOutcome {
    Admit,
    Deny,
}

fn build_command(task: &Task) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(&task.command.name);
    cmd.args(&task.command.args);
    cmd.kill_on_drop(false);
    // SAFETY: `set_pdeathsig` only calls `prctl` in the child after fork and
    // before exec; it touches no shared state and allocates nothing.
    unsafe {
        cmd.pre_exec(|| {
            let _ = nix::sys::prctl::set_pdeathsig(Signal::SIGKILL);
            Ok(())
        });
    }
    cmd
}

fn terminal_state_from_status(status: &std::process::ExitStatus) -> TaskState {
    if status.signal().is_some() {
        TaskState::Killed
    } else if status.success() {
        TaskState::Completed
    } else {
        TaskState::Failed
    }
}

fn exit_error(status: &std::process::ExitStatus) -> Option<String> {
    if status.success() {
        None
    } else if let Some(signal) = status.signal() {
        Some(format!("signal: {signal}"))
    } else {
        Some(format!("exit status {}", status.code().unwrap_or(-1)))
    }
}

/// Graceful-then-forceful kill of a single pid: SIGTERM, poll liveness via a
/// signal-0 probe for [`KILL_GRACE_WINDOW`], then SIGKILL if still alive.
async fn kill_one(task_id: TaskId, pid: i32) -> Result<()> {
    let nix_pid = Pid::from_raw(pid);
    let _ = signal::kill(nix_pid, Signal::SIGTERM);
    let deadline = tokio::time::Instant::now() + KILL_GRACE_WINDOW;
    while tokio::time::Instant::now() < deadline {
        match signal::kill(nix_pid, None) {
            Ok(()) => tokio::time::sleep(KILL_POLL_INTERVAL).await,
            Err(_) => return Ok(()), // process no longer exists
        }
    }
    info!(task_id = %task_id, pid, "task survived SIGTERM grace window, sending SIGKILL");
    signal::kill(nix_pid, Signal::SIGKILL).map_err(|_| FluxError::TaskKill { task_id })?;
    Ok(())
}

#[allow(dead_code)]
fn assert_not_in_two_states<T: Eq + std::hash::Hash>(a: &HashMap<T, ()>, b: &HashMap<T, ()>) {
    debug_assert!(a.keys().all(|k| !b.contains_key(k)));
}
