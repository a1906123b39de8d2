//! Master (§4.7): the root dispatcher. Owns the live worker-adapter roster,
//! the active-submission ledger, the elasticity loop that starts and kills
//! workers, and the bot list Bot Manager distributes across them.
//!
//! A worker's lifecycle identity is a single self-minted [`TaskId`] (distinct
//! from whatever id the scheduler assigns internally): `on_launch_complete`
//! and `on_task_complete` are plain `FnOnce(LaunchResult)`/`FnOnce(TaskState)`
//! closures with no task-id parameter, so Master mints its own id before
//! calling `Scheduler::schedule` and has the closures close over it. The
//! scheduler's own id is kept alongside it (in `PendingWorker`/`LiveWorker`)
//! purely so `kill_task` can be called later. One `pending`/`live`/`killed`
//! map keyed by this minted id, so a worker is never simultaneously tracked
//! in two of the three lifecycle states.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flux_kernel::{
    CmdExecType, Command, LaunchResult, OnLaunchComplete, OnTaskComplete, Resources, Scheduler, TaskId, TaskRequest,
    TaskState,
};
use flux_store::BotStore;
use futures::FutureExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bot_manager::{BotManager, BOT_MANAGER_MAIL_ID};
use crate::load_monitor::LoadMonitor;
use crate::mail::{
    CfSubResult, LoadReport, Mail, MailBody, MailId, SlaveReady, PRIORITY_BOT_ERROR, PRIORITY_CF_SUB_REQUEST,
    PRIORITY_CF_SUB_RESULT, PRIORITY_CF_SUB_RESULT_FAILURE, PRIORITY_CONTROL, PRIORITY_FAILURE,
    PRIORITY_WORKER_LIFECYCLE,
};
use crate::mailbox::Mailbox;
use crate::postman::{MailClient, Postman};
use crate::slave::{worker_mail_id, WorkerAdapter};

const IDLE_SLEEP: Duration = Duration::from_millis(100);
pub const MASTER_MAIL_ID: &str = "master";

/// Base priority for the first elastically-started worker; each additional
/// one in the same scale-up step steps down by 10, never below this floor.
const WORKER_START_PRIORITY_BASE: i64 = 80;
const WORKER_START_PRIORITY_STEP: i64 = 10;
const WORKER_START_PRIORITY_FLOOR: i64 = 30;

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

struct ActiveSub {
    requester_mail_id: MailId,
    worker_mail_id: MailId,
}

struct LiveWorker {
    scheduler_task_id: TaskId,
    mail_id: MailId,
    active_count: u32,
    priority: i64,
    adapter: Arc<WorkerAdapter>,
}

struct PendingWorker {
    scheduler_task_id: TaskId,
    rendezvous_path: PathBuf,
    priority: i64,
}

struct KilledWorker {
    scheduler_task_id: TaskId,
    mail_id: MailId,
}

struct MasterState {
    live: HashMap<TaskId, LiveWorker>,
    /// Preserves start order; worker selection and elasticity both need a
    /// stable notion of "the live set" beyond whatever order a `HashMap`
    /// iterates in.
    live_order: Vec<TaskId>,
    pending: HashMap<TaskId, PendingWorker>,
    killed: Vec<KilledWorker>,
    active_subs: HashMap<String, ActiveSub>,
    bots: Vec<String>,
}

pub struct Master {
    postman: Postman,
    scheduler: Arc<Scheduler>,
    bot_manager: Arc<BotManager>,
    load_monitor: Arc<LoadMonitor>,
    bots_store: BotStore,
    mailbox: Arc<Mailbox>,
    state: AsyncMutex<MasterState>,

    worker_binary_path: String,
    worker_binary_args: Vec<String>,
    scratch_dir: PathBuf,
    worker_resources: Resources,
    dial_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    readiness_poll_interval: Duration,
    readiness_poll_cap: Duration,
    bot_refresh_interval: Duration,
}

#[allow(clippy::too_many_arguments)]
impl Master {
    pub fn new(
        postman: Postman,
        scheduler: Arc<Scheduler>,
        bot_manager: Arc<BotManager>,
        load_monitor: Arc<LoadMonitor>,
        bots_store: BotStore,
        worker_binary_path: impl Into<String>,
        worker_binary_args: Vec<String>,
        scratch_dir: impl Into<PathBuf>,
        worker_resources: Resources,
        dial_timeout: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
        readiness_poll_interval: Duration,
        readiness_poll_cap: Duration,
        bot_refresh_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            postman,
            scheduler,
            bot_manager,
            load_monitor,
            bots_store,
            mailbox: Arc::new(Mailbox::new()),
            state: AsyncMutex::new(MasterState {
                live: HashMap::new(),
                live_order: Vec::new(),
                pending: HashMap::new(),
                killed: Vec::new(),
                active_subs: HashMap::new(),
                bots: Vec::new(),
            }),
            worker_binary_path: worker_binary_path.into(),
            worker_binary_args,
            scratch_dir: scratch_dir.into(),
            worker_resources,
            dial_timeout,
            read_timeout,
            write_timeout,
            readiness_poll_interval,
            readiness_poll_cap,
            bot_refresh_interval,
        })
    }

    pub fn mail_id(&self) -> &str {
        MASTER_MAIL_ID
    }

    /// Registers, starts the mail loop, and starts the periodic bot-refresh
    /// trigger. Returns both join handles.
    pub fn start(self: Arc<Self>) -> [JoinHandle<()>; 2] {
        self.postman
            .register(MASTER_MAIL_ID, self.clone())
            .expect("master mail id already registered");
        let mail_loop = {
            let this = self.clone();
            tokio::spawn(async move { this.run_mail_loop().await })
        };
        let refresh_loop = {
            let this = self.clone();
            tokio::spawn(async move { this.run_bot_refresh_loop().await })
        };
        [mail_loop, refresh_loop]
    }

    async fn run_mail_loop(self: Arc<Self>) {
        loop {
            let Some(mail) = self.mailbox.pop() else {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            };

            let from = mail.from.clone();
            let this = self.clone();
            let outcome = AssertUnwindSafe(this.dispatch(from.clone(), mail.body)).catch_unwind().await;
            if let Err(panic) = outcome {
                error!(cause = %panic_message(panic), from = %from, "master dispatch panicked");
                self.on_worker_panicked(from).await;
            }
        }
    }

    /// Master's own bot-list refresh cadence: fetches bots from the store and
    /// forwards the current bot/worker sets to Bot Manager. The incoming
    /// `RefreshBots` mail body doubles as an external-trigger signal (its
    /// payload is ignored on receipt; Master always recomputes fresh values
    /// before forwarding to Bot Manager) and as the outbound, populated
    /// message Bot Manager actually consumes.
    async fn run_bot_refresh_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.bot_refresh_interval).await;
            self.refresh_bots().await;
        }
    }

    async fn dispatch(self: Arc<Self>, from: MailId, body: MailBody) {
        match body {
            MailBody::CfSubRequest(req) => self.on_cf_sub_request(from, req).await,
            MailBody::CfSubResult(result) => self.on_cf_sub_result(result).await,
            MailBody::SlvTaskLaunch { task_id } => self.on_slv_task_launch(task_id).await,
            MailBody::SlaveReady(ready) => self.on_slave_ready(ready).await,
            MailBody::SlvScrDead { task_id } => self.on_slv_scr_dead(task_id).await,
            MailBody::LoadReport(report) => self.on_load_report(report).await,
            MailBody::SlaveBotError { error, worker_id } => self.on_slave_bot_error(error, worker_id).await,
            MailBody::RefreshBots { .. } => self.refresh_bots().await,
            MailBody::ComponentFailed { cause } => {
                warn!(%cause, from = %from, "a worker reported a panic");
                self.on_worker_panicked(from).await;
            }
            other => debug!(?other, from = %from, "master dropped unexpected mail body"),
        }
    }

    // ---- submission dispatch ------------------------------------------------

    /// `CfSubRequest` from a Watcher: pick the least-loaded live worker,
    /// unless an active entry for this submission already names a still-live
    /// worker, in which case this is a duplicate forward and is dropped.
    async fn on_cf_sub_request(&self, requester: MailId, req: crate::mail::CfSubRequest) {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.active_subs.get(&req.submission_id) {
            if state.live.values().any(|w| w.mail_id == existing.worker_mail_id) {
                debug!(submission = %req.submission_id, "dropping duplicate cf sub request, worker still live");
                return;
            }
        }

        self.load_monitor.record_arrival(now_millis()).await;

        let chosen = state
            .live_order
            .iter()
            .filter_map(|id| state.live.get(id))
            .min_by_key(|w| w.active_count)
            .map(|w| (w.scheduler_task_id, w.mail_id.clone()));

        let Some((task_id, worker_mail_id)) = chosen else {
            drop(state);
            self.postman.route(Mail::new(
                MASTER_MAIL_ID,
                requester,
                MailBody::CfSubResult(CfSubResult {
                    submission_id: req.submission_id,
                    status: None,
                    error: Some("no workers available".to_string()),
                }),
                PRIORITY_CF_SUB_RESULT_FAILURE,
            ));
            return;
        };

        if let Some(worker) = state.live.get_mut(&task_id) {
            worker.active_count += 1;
        }
        state.active_subs.insert(
            req.submission_id.clone(),
            ActiveSub { requester_mail_id: requester, worker_mail_id: worker_mail_id.clone() },
        );
        drop(state);

        self.postman.route(Mail::new(MASTER_MAIL_ID, worker_mail_id, MailBody::CfSubRequest(req), PRIORITY_CF_SUB_REQUEST));
    }

    /// `CfSubResult` from a worker: forward to the original requester, free
    /// up the worker's active-submission slot, and drop the ledger entry.
    async fn on_cf_sub_result(&self, result: CfSubResult) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.active_subs.remove(&result.submission_id) else {
            debug!(submission = %result.submission_id, "cf sub result with no matching active entry, dropping");
            return;
        };
        for worker in state.live.values_mut() {
            if worker.mail_id == entry.worker_mail_id {
                worker.active_count = worker.active_count.saturating_sub(1);
                break;
            }
        }
        drop(state);

        self.postman.route(Mail::new(
            MASTER_MAIL_ID,
            entry.requester_mail_id,
            MailBody::CfSubResult(result),
            PRIORITY_CF_SUB_RESULT,
        ));
    }

    // ---- worker lifecycle ----------------------------------------------------

    /// Scheduler callback: the pending worker's child task launched. Begin
    /// polling its rendezvous file for the "<host> <port>" line it writes.
    async fn on_slv_task_launch(self: &Arc<Self>, task_id: TaskId) {
        let rendezvous_path = {
            let state = self.state.lock().await;
            state.pending.get(&task_id).map(|p| p.rendezvous_path.clone())
        };
        let Some(rendezvous_path) = rendezvous_path else {
            debug!(worker = %task_id, "slv task launch for unknown pending worker, ignoring");
            return;
        };

        let this = self.clone();
        tokio::spawn(async move { this.poll_readiness(task_id, rendezvous_path).await });
    }

    async fn poll_readiness(&self, task_id: TaskId, rendezvous_path: PathBuf) {
        let started = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.readiness_poll_interval).await;

            match read_rendezvous_file(&rendezvous_path) {
                Ok(Some((host, port))) => {
                    self.postman.route(Mail::new(
                        MASTER_MAIL_ID,
                        MASTER_MAIL_ID,
                        MailBody::SlaveReady(SlaveReady {
                            task_id,
                            worker_mail_id: worker_mail_id(task_id),
                            address: Some((host, port)),
                            error: None,
                        }),
                        PRIORITY_WORKER_LIFECYCLE,
                    ));
                    return;
                }
                Ok(None) => {}
                Err(err) => warn!(worker = %task_id, %err, "error reading worker rendezvous file"),
            }

            if started.elapsed() >= self.readiness_poll_cap {
                warn!(worker = %task_id, "worker never became ready, giving up");
                self.postman.route(Mail::new(
                    MASTER_MAIL_ID,
                    MASTER_MAIL_ID,
                    MailBody::SlvScrDead { task_id },
                    PRIORITY_WORKER_LIFECYCLE,
                ));
                return;
            }
        }
    }

    /// `SlaveReady`: mint and start a worker adapter for a pending worker
    /// whose socket is up; a present `error`/absent `address` is handled as
    /// a dead worker instead, same as `SlvScrDead`.
    async fn on_slave_ready(self: &Arc<Self>, ready: SlaveReady) {
        if ready.error.is_some() || ready.address.is_none() {
            self.on_worker_dead(ready.task_id).await;
            return;
        }
        let (host, port) = ready.address.unwrap();

        let pending = {
            let mut state = self.state.lock().await;
            state.pending.remove(&ready.task_id)
        };
        let Some(pending) = pending else {
            debug!(worker = %ready.task_id, "slave ready for unknown pending worker, ignoring");
            return;
        };

        let adapter = WorkerAdapter::new(
            ready.task_id,
            MASTER_MAIL_ID,
            self.postman.clone(),
            self.bot_manager.clone(),
            self.load_monitor.clone(),
            (host, port),
            Some(pending.rendezvous_path.clone()),
            self.scratch_dir.clone(),
            self.dial_timeout,
            self.read_timeout,
            self.write_timeout,
        );

        if let Err(err) = self.postman.register(adapter.mail_id().to_string(), adapter.clone()) {
            error!(worker = %ready.task_id, %err, "could not register worker adapter");
            let _ = std::fs::remove_file(&pending.rendezvous_path);
            return;
        }
        adapter.clone().start();

        let mut state = self.state.lock().await;
        state.live.insert(
            ready.task_id,
            LiveWorker {
                scheduler_task_id: pending.scheduler_task_id,
                mail_id: adapter.mail_id().to_string(),
                active_count: 0,
                priority: pending.priority,
                adapter,
            },
        );
        state.live_order.push(ready.task_id);
        drop(state);

        info!(worker = %ready.task_id, "worker adapter ready");
        self.refresh_bots().await;
    }

    /// Scheduler callback (or synthetic, from a failed readiness poll): the
    /// worker's child process died. Finds it in whichever of
    /// pending/live/killed it currently occupies and tears it down.
    async fn on_slv_scr_dead(&self, task_id: TaskId) {
        self.on_worker_dead(task_id).await;
    }

    async fn on_worker_dead(&self, task_id: TaskId) {
        let mut state = self.state.lock().await;

        if let Some(pending) = state.pending.remove(&task_id) {
            let _ = std::fs::remove_file(&pending.rendezvous_path);
            drop(state);
            info!(worker = %task_id, "pending worker died before becoming ready");
            self.refresh_bots().await;
            return;
        }

        if let Some(worker) = state.live.remove(&task_id) {
            state.live_order.retain(|id| *id != task_id);
            state.active_subs.retain(|_, sub| sub.worker_mail_id != worker.mail_id);
            drop(state);

            self.postman.route(Mail::new(MASTER_MAIL_ID, worker.mail_id.clone(), MailBody::StopWorker, PRIORITY_CONTROL));
            self.postman.unregister(&worker.mail_id);
            if let Some(path) = worker.adapter.rendezvous_path_for_cleanup() {
                let _ = std::fs::remove_file(path);
            }
            info!(worker = %task_id, "live worker died");
            self.refresh_bots().await;
            return;
        }

        if let Some(pos) = state.killed.iter().position(|k| k.scheduler_task_id == task_id) {
            state.killed.remove(pos);
            debug!(worker = %task_id, "killed worker reaped");
            return;
        }

        debug!(worker = %task_id, "slv scr dead for unknown worker, ignoring");
    }

    /// A worker's dispatch loop panicked: restart it in place at the same
    /// priority, keeping the elasticity-chosen slot occupied.
    async fn on_worker_panicked(&self, worker_mail_id: MailId) {
        let found = {
            let mut state = self.state.lock().await;
            let task_id = state.live.iter().find(|(_, w)| w.mail_id == worker_mail_id).map(|(id, _)| *id);
            task_id.and_then(|id| state.live.remove(&id).map(|w| (id, w)))
        };
        let Some((task_id, worker)) = found else {
            return;
        };
        {
            let mut state = self.state.lock().await;
            state.live_order.retain(|id| *id != task_id);
            state.active_subs.retain(|_, sub| sub.worker_mail_id != worker.mail_id);
        }
        let _ = self.scheduler.kill_task(worker.scheduler_task_id).await;
        self.postman.unregister(&worker.mail_id);
        warn!(worker = %task_id, "restarting panicked worker");
        self.start_worker(worker.priority).await;
    }

    // ---- bot errors ------------------------------------------------------

    /// `SlaveBotError` classification: distinguishes "bots out of sync with
    /// Bot Manager" from "this worker has no bot at all" from "this specific
    /// worker is broken".
    async fn on_slave_bot_error(&self, error: String, worker_id: MailId) {
        if error.contains("not found") && error.contains("bot") {
            warn!(worker = %worker_id, %error, "bot manager doesn't recognize this bot, refreshing");
            self.refresh_bots().await;
            return;
        }
        if error.contains("no bots available") {
            let (bot_count, live_count) = {
                let state = self.state.lock().await;
                (state.bots.len(), state.live.len())
            };
            if bot_count >= live_count {
                warn!(worker = %worker_id, "no bots assigned but bot count covers workers, refreshing");
                self.refresh_bots().await;
            } else {
                let surplus = live_count.saturating_sub(bot_count);
                warn!(worker = %worker_id, surplus, "fewer bots than workers, killing surplus workers");
                self.kill_least_used(surplus).await;
                self.refresh_bots().await;
            }
            return;
        }
        warn!(worker = %worker_id, %error, "worker reported a bot error, killing it");
        self.kill_worker_by_mail_id(&worker_id).await;
    }

    async fn kill_worker_by_mail_id(&self, mail_id: &str) {
        let task_id = {
            let state = self.state.lock().await;
            state.live.iter().find(|(_, w)| w.mail_id == mail_id).map(|(id, _)| *id)
        };
        if let Some(task_id) = task_id {
            self.kill_worker(task_id).await;
        }
    }

    /// Kills the `count` live workers with the lowest active-submission
    /// count (least recently used, in elasticity's sense).
    async fn kill_least_used(&self, count: usize) {
        if count == 0 {
            return;
        }
        let victims: Vec<TaskId> = {
            let state = self.state.lock().await;
            let mut candidates: Vec<(&TaskId, &LiveWorker)> = state.live.iter().collect();
            candidates.sort_by_key(|(_, w)| w.active_count);
            candidates.into_iter().take(count).map(|(id, _)| *id).collect()
        };
        for task_id in victims {
            self.kill_worker(task_id).await;
        }
    }

    /// Moves a live worker to the killed set (scheduled-to-die, not yet
    /// reaped) and signals its process to stop. `on_worker_dead` finishes
    /// the teardown once the scheduler confirms the process has exited.
    async fn kill_worker(&self, task_id: TaskId) {
        let worker = {
            let mut state = self.state.lock().await;
            let Some(worker) = state.live.remove(&task_id) else { return };
            state.live_order.retain(|id| *id != task_id);
            state.killed.push(KilledWorker { scheduler_task_id: worker.scheduler_task_id, mail_id: worker.mail_id.clone() });
            worker
        };
        self.postman.route(Mail::new(MASTER_MAIL_ID, worker.mail_id.clone(), MailBody::StopWorker, PRIORITY_CONTROL));
        let _ = self.scheduler.kill_task(worker.scheduler_task_id).await;
    }

    // ---- elasticity --------------------------------------------------------

    /// `LoadReport{avg_load, avg_sub_t_millis}`: the scale-up/scale-down
    /// decision. `rec = floor(0.6 + avg_load * avg_sub_t_minutes)` is a
    /// biased-ceiling estimate of concurrent submissions in flight; `cap`
    /// additionally never exceeds half the known bot count (one bot can't
    /// usefully serve more than about two workers at a time).
    async fn on_load_report(&self, report: LoadReport) {
        let avg_sub_t_minutes = report.avg_sub_t_millis / 60_000.0;
        let rec = (0.6 + report.avg_load * avg_sub_t_minutes).floor() as i64;

        let (bot_count, live_count, pending_count) = {
            let state = self.state.lock().await;
            (state.bots.len() as i64, state.live.len() as i64, state.pending.len() as i64)
        };

        let cap = bot_count.div_ceil(2).min(rec.max(0));
        let floor = cap.max(1);
        let total = live_count + pending_count;

        if total < floor {
            let to_start = floor - total;
            info!(to_start, floor, cap, rec, "elasticity scaling up");
            for i in 0..to_start {
                let priority = (WORKER_START_PRIORITY_BASE - i * WORKER_START_PRIORITY_STEP).max(WORKER_START_PRIORITY_FLOOR);
                self.start_worker(priority).await;
            }
        } else if live_count > cap + 1 {
            let to_kill = (live_count - floor).max(0) as usize;
            info!(to_kill, cap, live_count, "elasticity scaling down");
            self.kill_least_used(to_kill).await;
        }
    }

    // ---- bot refresh -------------------------------------------------------

    async fn refresh_bots(&self) {
        let bots = match self.bots_store.list_bots().await {
            Ok(bots) => bots.into_iter().map(|b| b.name).collect::<Vec<_>>(),
            Err(err) => {
                warn!(%err, "failed to list bots");
                return;
            }
        };

        let mut state = self.state.lock().await;
        state.bots = bots.clone();
        let workers: Vec<MailId> = state.live_order.iter().filter_map(|id| state.live.get(id)).map(|w| w.mail_id.clone()).collect();
        drop(state);

        self.postman.route(Mail::new(
            MASTER_MAIL_ID,
            BOT_MANAGER_MAIL_ID,
            MailBody::RefreshBots { bots, workers },
            PRIORITY_CONTROL,
        ));
    }

    // ---- starting a worker --------------------------------------------------

    /// Creates a rendezvous scratch file and schedules a `LongRunning` task
    /// for a new worker child. The child is expected to write `"<host>
    /// <port>\n"` into the rendezvous file once its listener is up;
    /// `on_slv_task_launch` begins polling for that once the scheduler
    /// confirms the process has launched.
    async fn start_worker(self: &Arc<Self>, priority: i64) {
        let reservation_id = Uuid::now_v7();
        if let Err(err) = std::fs::create_dir_all(&self.scratch_dir) {
            error!(%err, "could not create scratch dir for worker rendezvous file");
            return;
        }
        let rendezvous_path = self.scratch_dir.join(format!("worker-{reservation_id}.sock"));
        if let Err(err) = std::fs::File::create(&rendezvous_path) {
            error!(%err, "could not create worker rendezvous file");
            return;
        }

        let mut args = self.worker_binary_args.clone();
        args.push("-f".to_string());
        args.push(rendezvous_path.display().to_string());

        let launch_postman = self.postman.clone();
        let launch_task_id = reservation_id;
        let on_launch_complete = Box::new(move |result: flux_kernel::task::LaunchResult| {
            let body = if result.error.is_some() {
                MailBody::SlvScrDead { task_id: launch_task_id }
            } else {
                MailBody::SlvTaskLaunch { task_id: launch_task_id }
            };
            launch_postman.route(Mail::new(MASTER_MAIL_ID, MASTER_MAIL_ID, body, PRIORITY_WORKER_LIFECYCLE));
        });

        let complete_postman = self.postman.clone();
        let complete_task_id = reservation_id;
        let on_task_complete = Box::new(move |_state: TaskState| {
            complete_postman.route(Mail::new(
                MASTER_MAIL_ID,
                MASTER_MAIL_ID,
                MailBody::SlvScrDead { task_id: complete_task_id },
                PRIORITY_WORKER_LIFECYCLE,
            ));
        });

        let request = TaskRequest {
            name: format!("worker-{reservation_id}"),
            resources: self.worker_resources,
            command: Command::new(self.worker_binary_path.clone(), args, CmdExecType::LongRunning),
            priority,
            scheduling_retries: 3,
            on_launch_complete,
            on_task_complete: Some(on_task_complete),
        };

        match self.scheduler.schedule(request).await {
            Ok(scheduler_task_id) => {
                let mut state = self.state.lock().await;
                state.pending.insert(reservation_id, PendingWorker { scheduler_task_id, rendezvous_path, priority });
            }
            Err(err) => {
                error!(%err, "failed to schedule worker task");
                let _ = std::fs::remove_file(&rendezvous_path);
            }
        }
    }
}

fn read_rendezvous_file(path: &std::path::Path) -> std::io::Result<Option<(String, u16)>> {
    use std::io::Read;

    let file = match std::fs::OpenOptions::new().read(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    let mut lock = fd_lock::RwLock::new(file);
    let mut guard = match lock.try_read() {
        Ok(guard) => guard,
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
        Err(err) => return Err(err),
    };

    let mut content = String::new();
    guard.read_to_string(&mut content)?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let mut parts = trimmed.split_whitespace();
    let host = parts.next().map(str::to_string);
    let port = parts.next().and_then(|p| p.parse::<u16>().ok());
    Ok(host.zip(port))
}

impl MailClient for Master {
    fn receive(&self, mail: Mail) {
        self.mailbox.add(mail);
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
