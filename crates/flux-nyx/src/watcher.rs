//! Watcher: a submission-scoped actor that drives one submission through
//! its lifetime (§4.5).
//!
//! Accepts exactly two mail bodies — `Submit` and `CfSubResult` — and ends
//! its own mail loop once the submission reaches a terminal outcome
//! (linked and state advanced, or a peer watcher already did so). Every
//! dispatch runs under panic recovery so a bug in this watcher cannot take
//! down the Manager or any sibling watcher; the recovery path posts
//! `WatcherFailed` back to the Manager, which restarts the watch.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flux_store::transaction::Store as TxStore;
use flux_store::{CfSubmission, StoreError};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::mail::{
    CfSubRequest, Mail, MailBody, MailId, PRIORITY_CF_SUB_REQUEST, PRIORITY_FAILURE,
};
use crate::mailbox::Mailbox;
use crate::postman::{MailClient, Postman};
use crate::status_manager::{CallerContext, SubmissionStatusManager};

const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Stated interface onto the out-of-scope problem domain service: the
/// evaluator-specific problem code a worker passes to the third-party
/// site (e.g. Codeforces' `"1325A"` contest/index pair).
#[async_trait]
pub trait ProblemGateway: Send + Sync {
    async fn site_problem_code(&self, problem_id: &str) -> flux_kernel::Result<String>;
}

pub fn watcher_mail_id(submission_id: &str) -> MailId {
    format!("watcher:{submission_id}")
}

pub struct Watcher {
    submission_id: String,
    mail_id: MailId,
    manager_mail_id: MailId,
    master_mail_id: MailId,
    postman: Postman,
    status: SubmissionStatusManager,
    store: TxStore,
    problems: Arc<dyn ProblemGateway>,
    mailbox: Arc<Mailbox>,
}

impl Watcher {
    pub fn new(
        submission_id: impl Into<String>,
        manager_mail_id: impl Into<MailId>,
        master_mail_id: impl Into<MailId>,
        postman: Postman,
        status: SubmissionStatusManager,
        store: TxStore,
        problems: Arc<dyn ProblemGateway>,
    ) -> Arc<Self> {
        let submission_id = submission_id.into();
        let mail_id = watcher_mail_id(&submission_id);
        Arc::new(Self {
            submission_id,
            mail_id,
            manager_mail_id: manager_mail_id.into(),
            master_mail_id: master_mail_id.into(),
            postman,
            status,
            store,
            problems,
            mailbox: Arc::new(Mailbox::new()),
        })
    }

    pub fn mail_id(&self) -> &str {
        &self.mail_id
    }

    /// Validates prerequisites (none beyond registration today) and
    /// launches the mail-processing task. Returns once the task is
    /// spawned; the watcher then lives until it self-terminates.
    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            self.run().await;
        });
    }

    async fn run(self: Arc<Self>) {
        loop {
            let Some(mail) = self.mailbox.pop() else {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            };

            let this = Arc::clone(&self);
            let outcome = AssertUnwindSafe(this.dispatch(mail)).catch_unwind().await;

            match outcome {
                Ok(Terminal::Yes) => break,
                Ok(Terminal::No) => {}
                Err(panic) => {
                    let cause = panic_message(panic);
                    error!(submission_id = %self.submission_id, %cause, "watcher panicked");
                    self.postman.route(Mail::new(
                        self.mail_id.clone(),
                        self.manager_mail_id.clone(),
                        MailBody::WatcherFailed {
                            submission_id: self.submission_id.clone(),
                            cause,
                        },
                        PRIORITY_FAILURE,
                    ));
                    break;
                }
            }
        }
        self.postman.unregister(&self.mail_id);
    }

    async fn dispatch(&self, mail: Mail) -> Terminal {
        match mail.body {
            MailBody::Submit => self.on_submit().await,
            MailBody::CfSubResult(result) => self.on_cf_sub_result(result).await,
            other => {
                warn!(submission_id = %self.submission_id, ?other, "watcher dropped unexpected mail body");
                Terminal::No
            }
        }
    }

    async fn on_submit(&self) -> Terminal {
        let ctx = CallerContext::internal();
        let evaluated = match self.status.get_submission(&ctx, &self.submission_id).await {
            Ok(e) => e,
            Err(err) => {
                warn!(submission_id = %self.submission_id, %err, "watcher could not read submission");
                self.fail_to_flux().await;
                return Terminal::No;
            }
        };

        if evaluated.cf_submission.is_some() {
            debug!(submission_id = %self.submission_id, "submission already linked, ending watch");
            return Terminal::Yes;
        }

        let problem_id = evaluated.submission.problem_id.clone();
        let site_problem_code = match self.problems.site_problem_code(&problem_id).await {
            Ok(code) => code,
            Err(err) => {
                warn!(submission_id = %self.submission_id, %err, "failed to resolve site problem code");
                self.fail_to_flux().await;
                return Terminal::No;
            }
        };

        let language = evaluated
            .submission
            .solution
            .get("language")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let request = CfSubRequest {
            submission_id: self.submission_id.clone(),
            solution: evaluated.submission.solution,
            language,
            site_problem_code,
        };

        self.postman.route(Mail::new(
            self.mail_id.clone(),
            self.master_mail_id.clone(),
            MailBody::CfSubRequest(request),
            PRIORITY_CF_SUB_REQUEST,
        ));
        Terminal::No
    }

    async fn on_cf_sub_result(&self, result: crate::mail::CfSubResult) -> Terminal {
        if let Some(err) = result.error {
            debug!(submission_id = %self.submission_id, %err, "submit failed, returning to flux_failed");
            self.fail_to_flux().await;
            self.notify_manager_drop(Some(err)).await;
            return Terminal::Yes;
        }

        let Some(status) = result.status else {
            self.fail_to_flux().await;
            self.notify_manager_drop(Some("worker returned no status".into())).await;
            return Terminal::Yes;
        };

        let verdict = status.normalized_verdict().to_string();
        let link = CfSubmission {
            submission_id: self.submission_id.clone(),
            cf_sub_id: status.id,
            verdict: verdict.clone(),
            time_consumed_millis: status.time_consumed_millis,
            memory_consumed_bytes: status.memory_consumed_bytes,
            passed_test_count: status.passed_test_count,
        };

        match self.store.link_cf_submission_and_update_state(link, verdict).await {
            Ok(()) => {
                info!(submission_id = %self.submission_id, "linked submission and advanced state");
                self.notify_manager_drop(None).await;
                Terminal::Yes
            }
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(submission_id = %self.submission_id, "peer watcher already linked this submission");
                self.notify_manager_drop(None).await;
                Terminal::Yes
            }
            Err(err) => {
                warn!(submission_id = %self.submission_id, %err, "failed to commit cf submission link");
                self.fail_to_flux().await;
                self.notify_manager_drop(Some(err.to_string())).await;
                Terminal::Yes
            }
        }
    }

    async fn fail_to_flux(&self) {
        if let Err(err) = self
            .status
            .update_submission_state(&self.submission_id, flux_store::FLUX_FAILED)
            .await
        {
            debug!(submission_id = %self.submission_id, %err, "could not write flux_failed (likely already past flux)");
        }
    }

    async fn notify_manager_drop(&self, error: Option<String>) {
        // Reuses PRIORITY_CF_SUB_REQUEST rather than minting a constant for
        // this one internal bookkeeping message.
        self.postman.route(Mail::new(
            self.mail_id.clone(),
            self.manager_mail_id.clone(),
            MailBody::CfSubResult(crate::mail::CfSubResult {
                submission_id: self.submission_id.clone(),
                status: None,
                error,
            }),
            PRIORITY_CF_SUB_REQUEST,
        ));
    }
}

impl MailClient for Watcher {
    fn receive(&self, mail: Mail) {
        self.mailbox.add(mail);
    }
}

enum Terminal {
    Yes,
    No,
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
    use flux_store::{CfSubmissionStore, Database, SubmissionStore};
    use std::sync::Mutex as StdMutex;

    struct FixedProblem(String);
    #[async_trait]
    impl ProblemGateway for FixedProblem {
        async fn site_problem_code(&self, _problem_id: &str) -> flux_kernel::Result<String> {
            Ok(self.0.clone())
        }
    }

    struct Recorder {
        received: StdMutex<Vec<Mail>>,
    }
    impl MailClient for Recorder {
        fn receive(&self, mail: Mail) {
            self.received.lock().unwrap().push(mail);
        }
    }

    async fn harness() -> (
        Postman,
        SubmissionStatusManager,
        TxStore,
        SubmissionStore,
        Arc<Recorder>,
        Arc<Recorder>,
    ) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let submissions = SubmissionStore::new(db.clone());
        let cf = CfSubmissionStore::new(db.clone());
        let store = TxStore::new(db.clone());
        let status = SubmissionStatusManager::new(
            submissions.clone(),
            cf,
            Arc::new(crate::status_manager::NoContestsOngoing),
        );
        let postman = Postman::new();
        let manager = Arc::new(Recorder { received: StdMutex::new(Vec::new()) });
        let master = Arc::new(Recorder { received: StdMutex::new(Vec::new()) });
        postman.register("manager", manager.clone()).unwrap();
        postman.register("master", master.clone()).unwrap();
        (postman, status, store, submissions, manager, master)
    }

    #[tokio::test]
    async fn submit_forwards_cf_sub_request_to_master() {
        let (postman, status, store, submissions, _manager, master) = harness().await;
        submissions
            .insert_submission(
                "s1".into(),
                "alice".into(),
                "p1".into(),
                None,
                serde_json::json!({"language": "cpp"}),
            )
            .await
            .unwrap();

        let watcher = Watcher::new(
            "s1",
            "manager",
            "master",
            postman.clone(),
            status,
            store,
            Arc::new(FixedProblem("1325A".into())),
        );
        postman.register(watcher.mail_id().to_string(), watcher.clone()).unwrap();
        watcher.clone().start();

        watcher.receive(Mail::new("manager", watcher.mail_id(), MailBody::Submit, 50));

        tokio::time::sleep(Duration::from_millis(250)).await;
        let received = master.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(matches!(received[0].body, MailBody::CfSubRequest(ref r) if r.site_problem_code == "1325A"));
    }

    #[tokio::test]
    async fn already_linked_ends_watch_without_forwarding() {
        let (postman, status, store, submissions, _manager, master) = harness().await;
        submissions
            .insert_submission("s1".into(), "alice".into(), "p1".into(), None, serde_json::json!({}))
            .await
            .unwrap();
        store
            .link_cf_submission_and_update_state(
                CfSubmission {
                    submission_id: "s1".into(),
                    cf_sub_id: 1,
                    verdict: "TESTING".into(),
                    time_consumed_millis: 0,
                    memory_consumed_bytes: 0,
                    passed_test_count: 0,
                },
                "TESTING".into(),
            )
            .await
            .unwrap();

        let watcher = Watcher::new(
            "s1",
            "manager",
            "master",
            postman.clone(),
            status,
            store,
            Arc::new(FixedProblem("1325A".into())),
        );
        postman.register(watcher.mail_id().to_string(), watcher.clone()).unwrap();
        watcher.clone().start();
        watcher.receive(Mail::new("manager", watcher.mail_id(), MailBody::Submit, 50));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(master.received.lock().unwrap().is_empty());
        assert!(!postman.is_registered(watcher.mail_id()));
    }

    #[tokio::test]
    async fn duplicate_cf_sub_result_ends_gracefully() {
        let (postman, status, store, submissions, manager, _master) = harness().await;
        submissions
            .insert_submission("s1".into(), "alice".into(), "p1".into(), None, serde_json::json!({}))
            .await
            .unwrap();
        // Peer already linked it.
        store
            .link_cf_submission_and_update_state(
                CfSubmission {
                    submission_id: "s1".into(),
                    cf_sub_id: 1,
                    verdict: "OK".into(),
                    time_consumed_millis: 1,
                    memory_consumed_bytes: 1,
                    passed_test_count: 1,
                },
                "OK".into(),
            )
            .await
            .unwrap();

        let watcher = Watcher::new(
            "s1",
            "manager",
            "master",
            postman.clone(),
            status,
            store,
            Arc::new(FixedProblem("1325A".into())),
        );
        postman.register(watcher.mail_id().to_string(), watcher.clone()).unwrap();
        watcher.clone().start();

        watcher.receive(Mail::new(
            "master",
            watcher.mail_id(),
            MailBody::CfSubResult(crate::mail::CfSubResult {
                submission_id: "s1".into(),
                status: Some(crate::cf_client::CfSubStatus {
                    id: 1,
                    verdict: "OK".into(),
                    time_consumed_millis: 1,
                    memory_consumed_bytes: 1,
                    passed_test_count: 1,
                }),
                error: None,
            }),
            50,
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(manager.received.lock().unwrap().len(), 1);
        assert!(!postman.is_registered(watcher.mail_id()));
    }
}
