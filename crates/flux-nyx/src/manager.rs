//! Manager: inventory of Watchers, driven by a periodic DB poll (§4.6).
//!
//! The poll loop is the only periodic DB reader in the pipeline — it is
//! what turns "a row got inserted (or flux_failed) in the store" into "a
//! Watcher exists and has been told to Submit". Everything else about a
//! submission's lifetime lives inside its Watcher.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use flux_store::transaction::Store as TxStore;
use flux_store::{SubmissionStore, FLUX_FAILED, FLUX_QUEUED};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::mail::{Mail, MailBody, MailId, PRIORITY_NORMAL};
use crate::mailbox::Mailbox;
use crate::postman::{MailClient, Postman};
use crate::status_manager::SubmissionStatusManager;
use crate::watcher::{watcher_mail_id, ProblemGateway, Watcher};

const IDLE_SLEEP: Duration = Duration::from_millis(100);
pub const MANAGER_MAIL_ID: &str = "manager";

pub struct Manager {
    master_mail_id: MailId,
    postman: Postman,
    status: SubmissionStatusManager,
    store: TxStore,
    submissions: SubmissionStore,
    problems: Arc<dyn ProblemGateway>,
    watchers: DashMap<String, Arc<Watcher>>,
    mailbox: Arc<Mailbox>,
    poll_interval: Duration,
    stopped: AtomicBool,
}

impl Manager {
    pub fn new(
        master_mail_id: impl Into<MailId>,
        postman: Postman,
        status: SubmissionStatusManager,
        store: TxStore,
        submissions: SubmissionStore,
        problems: Arc<dyn ProblemGateway>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            master_mail_id: master_mail_id.into(),
            postman,
            status,
            store,
            submissions,
            problems,
            watchers: DashMap::new(),
            mailbox: Arc::new(Mailbox::new()),
            poll_interval,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn mail_id(&self) -> &str {
        MANAGER_MAIL_ID
    }

    /// Registers with the Postman, then spawns the mail loop and the DB
    /// poll loop. The poll loop's cancellation is tied to this Manager's
    /// lifetime via `stopped` rather than a context deadline, since it is
    /// not a single request but an ongoing background responsibility.
    pub fn start(self: Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        self.postman
            .register(MANAGER_MAIL_ID, self.clone())
            .expect("manager mail id already registered");

        let mail_loop = {
            let this = self.clone();
            tokio::spawn(async move { this.run_mail_loop().await })
        };
        let poll_loop = {
            let this = self.clone();
            tokio::spawn(async move { this.run_poll_loop().await })
        };
        (mail_loop, poll_loop)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn run_poll_loop(self: Arc<Self>) {
        while !self.stopped.load(Ordering::SeqCst) {
            tokio::time::sleep(self.poll_interval).await;
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            match self.submissions.poll_pending(&[FLUX_QUEUED, FLUX_FAILED]).await {
                Ok(pending) => {
                    for submission in pending {
                        if self.watchers.contains_key(&submission.id) {
                            continue;
                        }
                        self.postman.route(Mail::new(
                            MANAGER_MAIL_ID,
                            MANAGER_MAIL_ID,
                            MailBody::FluxSubmission(crate::mail::FluxSubmission {
                                submission_id: submission.id,
                            }),
                            PRIORITY_NORMAL,
                        ));
                    }
                }
                Err(err) => warn!(%err, "manager poll failed"),
            }
        }
    }

    async fn run_mail_loop(self: Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) && self.mailbox.is_empty() {
                break;
            }
            let Some(mail) = self.mailbox.pop() else {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            };

            let this = self.clone();
            let outcome = AssertUnwindSafe(this.dispatch(mail)).catch_unwind().await;
            if let Err(panic) = outcome {
                error!(cause = %panic_message(panic), "manager mail dispatch panicked, continuing");
            }
        }
    }

    async fn dispatch(self: Arc<Self>, mail: Mail) {
        match mail.body {
            MailBody::FluxSubmission(flux) => self.on_flux_submission(flux.submission_id).await,
            MailBody::InvalidMailClient(id) => self.on_invalid_mail_client(id),
            MailBody::CfSubResult(result) => self.on_cf_sub_result(result.submission_id),
            MailBody::WatcherFailed { submission_id, cause } => {
                warn!(%submission_id, %cause, "watcher failed, restarting");
                self.watchers.remove(&submission_id);
                self.on_flux_submission(submission_id).await;
            }
            other => debug!(?other, "manager dropped unexpected mail body"),
        }
    }

    async fn on_flux_submission(&self, submission_id: String) {
        let watcher = self
            .watchers
            .entry(submission_id.clone())
            .or_insert_with(|| self.spawn_watcher(&submission_id))
            .clone();

        self.postman.route(Mail::new(
            MANAGER_MAIL_ID,
            watcher.mail_id().to_string(),
            MailBody::Submit,
            PRIORITY_NORMAL,
        ));
    }

    fn spawn_watcher(&self, submission_id: &str) -> Arc<Watcher> {
        let watcher = Watcher::new(
            submission_id,
            MANAGER_MAIL_ID,
            self.master_mail_id.clone(),
            self.postman.clone(),
            self.status.clone(),
            self.store.clone(),
            Arc::clone(&self.problems),
        );
        match self.postman.register(watcher.mail_id().to_string(), watcher.clone()) {
            Ok(()) => {}
            Err(_) => {
                // A prior watcher for this id is still registered (shouldn't
                // happen since we only get here on a fresh map entry, but a
                // racing restart could double-register); unregister first.
                self.postman.unregister(watcher.mail_id());
                let _ = self.postman.register(watcher.mail_id().to_string(), watcher.clone());
            }
        }
        watcher.clone().start();
        info!(submission_id = %submission_id, "created watcher");
        watcher
    }

    fn on_invalid_mail_client(&self, id: MailId) {
        // Only meaningful for watcher ids we still believe are alive.
        if let Some(submission_id) = id.strip_prefix("watcher:") {
            if let Some(watcher) = self.watchers.get(submission_id) {
                let _ = self.postman.register(id, watcher.clone());
            }
        }
    }

    fn on_cf_sub_result(&self, submission_id: String) {
        if let Some((_, watcher)) = self.watchers.remove(&submission_id) {
            self.postman.unregister(watcher.mail_id());
        } else {
            // Watcher may have already unregistered itself; make sure the
            // mail id it used is not left dangling either way.
            self.postman.unregister(&watcher_mail_id(&submission_id));
        }
    }
}

impl MailClient for Manager {
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
    use crate::status_manager::NoContestsOngoing;
    use async_trait::async_trait;
    use flux_store::{CfSubmissionStore, Database};

    struct FixedProblem;
    #[async_trait]
    impl ProblemGateway for FixedProblem {
        async fn site_problem_code(&self, _problem_id: &str) -> flux_kernel::Result<String> {
            Ok("1A".into())
        }
    }

    struct Recorder {
        received: std::sync::Mutex<Vec<Mail>>,
    }
    impl MailClient for Recorder {
        fn receive(&self, mail: Mail) {
            self.received.lock().unwrap().push(mail);
        }
    }

    async fn harness() -> (Arc<Manager>, SubmissionStore, Postman, Arc<Recorder>) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let submissions = SubmissionStore::new(db.clone());
        let cf = CfSubmissionStore::new(db.clone());
        let store = TxStore::new(db.clone());
        let status = SubmissionStatusManager::new(submissions.clone(), cf, Arc::new(NoContestsOngoing));
        let postman = Postman::new();
        let master = Arc::new(Recorder { received: std::sync::Mutex::new(Vec::new()) });
        postman.register("master", master.clone()).unwrap();

        let manager = Manager::new(
            "master",
            postman.clone(),
            status,
            store,
            submissions.clone(),
            Arc::new(FixedProblem),
            Duration::from_millis(30),
        );
        manager.clone().start();
        (manager, submissions, postman, master)
    }

    #[tokio::test]
    async fn poll_creates_exactly_one_watcher_across_cycles() {
        let (manager, submissions, postman, master) = harness().await;
        submissions
            .insert_submission("s1".into(), "alice".into(), "p1".into(), None, serde_json::json!({"language":"cpp"}))
            .await
            .unwrap();

        // Let several poll ticks elapse.
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.stop();

        assert_eq!(manager.watchers.len(), 1);
        // The lone watcher should have forwarded exactly one CfSubRequest.
        assert_eq!(master.received.lock().unwrap().len(), 1);
        let _ = postman;
    }

    #[tokio::test]
    async fn cf_sub_result_drops_watcher_from_inventory() {
        let (manager, submissions, postman, _master) = harness().await;
        submissions
            .insert_submission("s1".into(), "alice".into(), "p1".into(), None, serde_json::json!({}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(manager.watchers.contains_key("s1"));

        postman.route(Mail::new(
            "watcher:s1",
            "manager",
            MailBody::CfSubResult(crate::mail::CfSubResult {
                submission_id: "s1".into(),
                status: None,
                error: None,
            }),
            50,
        ));
        tokio::time::sleep(Duration::from_millis(80)).await;
        manager.stop();
        assert!(!manager.watchers.contains_key("s1"));
    }
}
