//! Worker Adapter ("Slave", §4.8): owns one TCP-connected worker child
//! process and drives its submit protocol.
//!
//! Everything this actor needs beyond its own mailbox — a bot to submit
//! under, the bot's prior site submission id, cookie persistence, and the
//! submission-duration sample for the Load Monitor — is reached through
//! `Arc<BotManager>` / `Arc<LoadMonitor>` direct calls rather than mail,
//! since both are already held by reference and every submit needs a
//! synchronous answer before the worker can talk to the child process.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flux_kernel::TaskId;
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::bot_manager::BotManager;
use crate::cf_client::{WorkerSolution, WorkerSubmitRequest, WorkerSubmitResponse, BOT_ERROR_SENTINEL};
use crate::load_monitor::LoadMonitor;
use crate::mail::{
    Mail, MailBody, MailId, PRIORITY_BOT_ERROR, PRIORITY_CF_SUB_RESULT, PRIORITY_CF_SUB_RESULT_FAILURE,
    PRIORITY_FAILURE,
};
use crate::mailbox::Mailbox;
use crate::postman::{MailClient, Postman};
use std::sync::Arc;

const IDLE_SLEEP: Duration = Duration::from_millis(100);
const SUBMISSION_POLL_ATTEMPTS: u32 = 3;
const SUBMISSION_POLL_INTERVAL: Duration = Duration::from_secs(5);
const SCRATCH_FILE_RETRIES: u32 = 3;

pub fn worker_mail_id(task_id: TaskId) -> MailId {
    format!("worker:{task_id}")
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub struct WorkerAdapter {
    task_id: TaskId,
    mail_id: MailId,
    master_mail_id: MailId,
    postman: Postman,
    bot_manager: Arc<BotManager>,
    load_monitor: Arc<LoadMonitor>,
    address: (String, u16),
    rendezvous_path: Option<PathBuf>,
    scratch_dir: PathBuf,
    dial_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    mailbox: Arc<Mailbox>,
}

impl WorkerAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: TaskId,
        master_mail_id: impl Into<MailId>,
        postman: Postman,
        bot_manager: Arc<BotManager>,
        load_monitor: Arc<LoadMonitor>,
        address: (String, u16),
        rendezvous_path: Option<PathBuf>,
        scratch_dir: PathBuf,
        dial_timeout: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            task_id,
            mail_id: worker_mail_id(task_id),
            master_mail_id: master_mail_id.into(),
            postman,
            bot_manager,
            load_monitor,
            address,
            rendezvous_path,
            scratch_dir,
            dial_timeout,
            read_timeout,
            write_timeout,
            mailbox: Arc::new(Mailbox::new()),
        })
    }

    pub fn mail_id(&self) -> &str {
        &self.mail_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// The rendezvous file path, if any, for a caller that needs to clean
    /// it up itself (e.g. Master tearing down a worker it just killed).
    pub fn rendezvous_path_for_cleanup(&self) -> Option<PathBuf> {
        self.rendezvous_path.clone()
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self: Arc<Self>) {
        loop {
            let Some(mail) = self.mailbox.pop() else {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            };

            if matches!(mail.body, MailBody::StopWorker) {
                self.drain_and_exit().await;
                break;
            }

            let this = Arc::clone(&self);
            let outcome = AssertUnwindSafe(this.dispatch(mail)).catch_unwind().await;
            if let Err(panic) = outcome {
                error!(worker = %self.mail_id, cause = %panic_message(panic), "worker adapter dispatch panicked");
                self.postman.route(Mail::new(
                    self.mail_id.clone(),
                    self.master_mail_id.clone(),
                    MailBody::ComponentFailed { cause: "worker adapter dispatch panicked".into() },
                    PRIORITY_FAILURE,
                ));
            }
        }
        if let Some(path) = &self.rendezvous_path {
            let _ = std::fs::remove_file(path);
        }
        self.postman.unregister(&self.mail_id);
    }

    async fn dispatch(&self, mail: Mail) {
        match mail.body {
            MailBody::CfSubRequest(req) => self.on_cf_sub_request(req).await,
            other => debug!(worker = %self.mail_id, ?other, "worker adapter dropped unexpected mail body"),
        }
    }

    /// Drains any remaining queued submit requests, answering each with an
    /// internal-error result, before the caller breaks the run loop.
    async fn drain_and_exit(&self) {
        while let Some(mail) = self.mailbox.pop() {
            if let MailBody::CfSubRequest(req) = mail.body {
                self.reply_failure(req.submission_id, "worker adapter is shutting down".into());
            }
        }
    }

    fn reply_failure(&self, submission_id: String, error: String) {
        self.postman.route(Mail::new(
            self.mail_id.clone(),
            self.master_mail_id.clone(),
            MailBody::CfSubResult(crate::mail::CfSubResult {
                submission_id,
                status: None,
                error: Some(error),
            }),
            PRIORITY_CF_SUB_RESULT_FAILURE,
        ));
    }

    async fn on_cf_sub_request(&self, req: crate::mail::CfSubRequest) {
        let started_at = now_millis();

        let bot_name = match self.bot_manager.get_bot(&self.mail_id).await {
            Ok(bot) => bot,
            Err(err) => {
                warn!(worker = %self.mail_id, %err, "bot manager could not assign a bot");
                self.postman.route(Mail::new(
                    self.mail_id.clone(),
                    self.master_mail_id.clone(),
                    MailBody::SlaveBotError { error: err.to_string(), worker_id: self.mail_id.clone() },
                    PRIORITY_BOT_ERROR,
                ));
                self.reply_failure(req.submission_id, err.to_string());
                return;
            }
        };

        let extension = match extension_for(&req.language) {
            Ok(ext) => ext,
            Err(err) => {
                self.reply_failure(req.submission_id, err);
                return;
            }
        };

        let (solution_path, cleanup) = match self.write_scratch_file(&req, extension) {
            Ok(pair) => pair,
            Err(err) => {
                self.reply_failure(req.submission_id, format!("could not stage solution file: {err}"));
                return;
            }
        };
        let _cleanup = cleanup;

        let prev = match self.bot_manager.latest_known_submission_id(&bot_name).await {
            Ok(id) => id,
            Err(flux_kernel::FluxError::NotFound { .. }) => 0,
            Err(err) => {
                self.reply_failure(req.submission_id, err.to_string());
                return;
            }
        };

        let cookies = self.bot_manager.get_cookies(&bot_name).await.unwrap_or_default();

        let wire_request = WorkerSubmitRequest {
            req_type: "submit".to_string(),
            platform: "codeforces".to_string(),
            solution: WorkerSolution {
                cookies,
                language: req.language.clone(),
                solution_file_path: solution_path.display().to_string(),
                bot_name: bot_name.clone(),
                site_problem_code: req.site_problem_code.clone(),
                submission_id: req.submission_id.clone(),
            },
        };

        let response = match self.talk_to_worker(&wire_request).await {
            Ok(response) => response,
            Err(err) => {
                self.reply_failure(req.submission_id, err);
                return;
            }
        };

        if !response.cookies.is_empty() {
            if let Err(err) = self.bot_manager.update_cookies(&bot_name, response.cookies).await {
                warn!(worker = %self.mail_id, %err, "failed to persist rotated cookies");
            }
        }

        if !response.error.is_empty() {
            if response.error == BOT_ERROR_SENTINEL {
                self.postman.route(Mail::new(
                    self.mail_id.clone(),
                    self.master_mail_id.clone(),
                    MailBody::CorruptedBot { bot_name: bot_name.clone() },
                    PRIORITY_BOT_ERROR,
                ));
            }
            self.reply_failure(req.submission_id, response.error);
            return;
        }

        let status = self.poll_for_new_submission(&bot_name, prev).await;
        let finished_at = now_millis();
        self.load_monitor.record_duration(finished_at - started_at, finished_at).await;

        match status {
            Some(status) => {
                self.postman.route(Mail::new(
                    self.mail_id.clone(),
                    self.master_mail_id.clone(),
                    MailBody::CfSubResult(crate::mail::CfSubResult {
                        submission_id: req.submission_id,
                        status: Some(status),
                        error: None,
                    }),
                    PRIORITY_CF_SUB_RESULT,
                ));
            }
            None => self.reply_failure(req.submission_id, "submission never appeared in site listing".into()),
        }
    }

    fn write_scratch_file(
        &self,
        req: &crate::mail::CfSubRequest,
        extension: &str,
    ) -> std::io::Result<(PathBuf, tempfile::TempPath)> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let code = req.solution.get("code").and_then(|v| v.as_str()).unwrap_or_default();
        let header = match extension {
            "py" => format!("# submission {}\n", req.submission_id),
            _ => format!("// submission {}\n", req.submission_id),
        };

        for _ in 0..SCRATCH_FILE_RETRIES {
            let name = format!("sol-{:016x}.{extension}", rand::random::<u64>());
            let path = self.scratch_dir.join(name);
            match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    use std::io::Write;
                    file.write_all(header.as_bytes())?;
                    file.write_all(code.as_bytes())?;
                    return Ok((path.clone(), tempfile::TempPath::from_path(path)));
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err),
            }
        }
        Err(std::io::Error::new(std::io::ErrorKind::AlreadyExists, "exhausted scratch file retries"))
    }

    async fn talk_to_worker(&self, request: &WorkerSubmitRequest) -> Result<WorkerSubmitResponse, String> {
        let (host, port) = &self.address;
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect((host.as_str(), *port)))
            .await
            .map_err(|_| "dial timed out".to_string())?
            .map_err(|err| format!("dial failed: {err}"))?;

        let mut line = serde_json::to_string(request).map_err(|err| err.to_string())?;
        line.push('\n');
        let (read_half, mut write_half) = stream.into_split();
        tokio::time::timeout(self.write_timeout, write_half.write_all(line.as_bytes()))
            .await
            .map_err(|_| "write timed out".to_string())?
            .map_err(|err| format!("write failed: {err}"))?;

        let mut reader = BufReader::new(read_half);
        let mut response_line = String::new();
        tokio::time::timeout(self.read_timeout, reader.read_line(&mut response_line))
            .await
            .map_err(|_| "read timed out".to_string())?
            .map_err(|err| format!("read failed: {err}"))?;

        serde_json::from_str(response_line.trim_end()).map_err(|err| format!("malformed worker response: {err}"))
    }

    async fn poll_for_new_submission(&self, bot_name: &str, prev: i64) -> Option<crate::cf_client::CfSubStatus> {
        for attempt in 0..SUBMISSION_POLL_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(SUBMISSION_POLL_INTERVAL).await;
            }
            match self.bot_manager.poll_latest_submission(bot_name).await {
                Ok(Some(status)) if status.id > prev => return Some(status),
                Ok(_) => {}
                Err(err) => warn!(bot = %bot_name, %err, "poll_latest_submission failed"),
            }
        }
        None
    }
}

fn extension_for(language: &str) -> Result<&'static str, String> {
    match language.to_ascii_lowercase().as_str() {
        "java" => Ok("java"),
        "cpp" | "c++" | "gnu++17" | "gnu++20" => Ok("cpp"),
        "py" | "python" | "python3" => Ok("py"),
        other => Err(format!("unsupported language: {other}")),
    }
}

impl MailClient for WorkerAdapter {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_for_maps_known_languages() {
        assert_eq!(extension_for("java").unwrap(), "java");
        assert_eq!(extension_for("GNU++17").unwrap(), "cpp");
        assert_eq!(extension_for("python3").unwrap(), "py");
        assert!(extension_for("rust").is_err());
    }

    #[test]
    fn worker_mail_id_is_stable_per_task() {
        let id = TaskId::now_v7();
        assert_eq!(worker_mail_id(id), worker_mail_id(id));
    }
}
