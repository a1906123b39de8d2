//! Mail: the message type that crosses the [`crate::postman::Postman`].
//!
//! Every actor enumerates the bodies it accepts as a variant of
//! [`MailBody`]; anything else reaching its mailbox is logged and
//! discarded (the "tagged sum type" approach to dynamic dispatch noted in
//! the design notes — no runtime type switch).
//!
//! Priority constants: the design notes call out that the source this is
//! distilled from defines several overlapping priority constants per mail
//! body across files. This implementation picks one canonical priority per
//! body — the lowest-numbered one the source defines for it — rather than
//! replicate the ambiguity.

use std::collections::HashMap;

use flux_kernel::TaskId;
use serde_json::Value;

use crate::cf_client::CfSubStatus;

/// Opaque name of a registered mail recipient.
pub type MailId = String;

/// Canonical priority for a given mail body (see module docs).
pub const PRIORITY_NORMAL: i64 = 50;
pub const PRIORITY_CF_SUB_REQUEST: i64 = 55;
pub const PRIORITY_CF_SUB_RESULT: i64 = 60;
pub const PRIORITY_CF_SUB_RESULT_FAILURE: i64 = 70;
pub const PRIORITY_CONTROL: i64 = 90;
pub const PRIORITY_INVALID_RECIPIENT: i64 = 95;
pub const PRIORITY_LOAD_REPORT: i64 = 40;
pub const PRIORITY_WORKER_LIFECYCLE: i64 = 70;
pub const PRIORITY_BOT_ERROR: i64 = 65;
/// Actor panic recovery and peer-stop notices: higher than ordinary
/// traffic so a supervisor reacts before its backlog grows further.
pub const PRIORITY_FAILURE: i64 = 85;
pub const PRIORITY_LIVENESS: i64 = 45;

/// A message routed through the Postman.
#[derive(Debug, Clone)]
pub struct Mail {
    pub from: MailId,
    pub to: MailId,
    pub body: MailBody,
    pub priority: i64,
}

impl Mail {
    pub fn new(from: impl Into<MailId>, to: impl Into<MailId>, body: MailBody, priority: i64) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            body,
            priority,
        }
    }
}

/// The request to submit a solution to a third-party evaluator.
#[derive(Debug, Clone)]
pub struct CfSubRequest {
    pub submission_id: String,
    pub solution: Value,
    pub language: String,
    pub site_problem_code: String,
}

/// The evaluator's (possibly failed) response to a submit request.
#[derive(Debug, Clone)]
pub struct CfSubResult {
    pub submission_id: String,
    pub status: Option<CfSubStatus>,
    pub error: Option<String>,
}

/// A submission row discovered by the Manager's poll loop.
#[derive(Debug, Clone)]
pub struct FluxSubmission {
    pub submission_id: String,
}

/// A duration sample reported to the Load Monitor.
#[derive(Debug, Clone, Copy)]
pub struct DurationSample {
    pub duration_millis: i64,
    pub sample_time_millis: i64,
}

/// A periodic load report from the Load Monitor to Master.
#[derive(Debug, Clone, Copy)]
pub struct LoadReport {
    pub avg_load: f64,
    pub avg_sub_t_millis: f64,
}

/// Worker adapter ready, as signalled by Master's readiness poller.
#[derive(Debug, Clone)]
pub struct SlaveReady {
    pub task_id: TaskId,
    pub worker_mail_id: MailId,
    pub address: Option<(String, u16)>,
    pub error: Option<String>,
}

/// The tagged sum of every mail body any actor in this crate accepts.
#[derive(Debug, Clone)]
pub enum MailBody {
    /// Manager → Watcher: begin the submit flow.
    Submit,
    /// Watcher → Master: forward a submit request.
    CfSubRequest(CfSubRequest),
    /// Master → Watcher (and Worker adapter → Master): the outcome.
    CfSubResult(CfSubResult),
    /// Manager poll loop → Manager: a queued/failed submission was found.
    FluxSubmission(FluxSubmission),
    /// Postman → any: the addressed recipient is not registered.
    InvalidMailClient(MailId),
    /// Bot monitor/Worker adapter/Bot manager/Master → supervisor (or self,
    /// when there is none above it): panic recovery.
    ComponentFailed { cause: String },
    /// Watcher's mail loop → Manager: this watcher's task panicked.
    WatcherFailed { submission_id: String, cause: String },
    /// Scheduler → Master: a pending worker's child task launched.
    SlvTaskLaunch { task_id: TaskId },
    /// Master's readiness poller → Master: worker socket is up (or failed).
    SlaveReady(SlaveReady),
    /// Scheduler → Master: a worker's child process died.
    SlvScrDead { task_id: TaskId },
    /// Load monitor → Master: periodic elasticity input.
    LoadReport(LoadReport),
    /// Worker adapter → Master: a submission failed due to a bot problem.
    SlaveBotError { error: String, worker_id: MailId },
    /// Master → Bot manager: bots changed, redistribute.
    RefreshBots { bots: Vec<String>, workers: Vec<MailId> },
    /// Worker adapter's internal load-monitor sample.
    DurationSample(DurationSample),
    /// Bot manager → Bot monitor: liveness ticks.
    KeepAlive(i64),
    Stop(i64),
    /// Master → Worker adapter: drain the inbox and exit, failing any
    /// queued submit requests with an internal error.
    StopWorker,
    /// Bot monitor internal: freshen status map.
    SubAlert(CfSubStatus),
    /// Bot monitor internal: advance stop-decision clock.
    UpdateStopDecision(i64),
    /// Bot monitor → Bot manager: this bot's monitor has exited.
    MonitorStopped { bot_name: String },
    /// Worker adapter → Master: the bot this worker used became unusable.
    CorruptedBot { bot_name: String },
    /// Bot manager / Master: distribute the bot set across workers.
    RefreshBotsResult { bots: Vec<String>, workers: Vec<MailId> },
    /// Arbitrary key/value control mail used by tests and bootstrapping.
    Control(HashMap<String, String>),
}
