//! Submission intake (§6): the externally consumed `Submit` API.
//!
//! Validates that the problem exists and that the caller is admitted to
//! submit to it (contest-admissibility when `contestId` is given,
//! practice-admissibility otherwise), persists a `flux_queued` row, and
//! posts `fluxSubmission` mail to the Manager — the same mail the
//! Manager's own poll loop posts for a submission it discovers cold, so
//! a fresh submit and a post-crash re-poll both end up on the identical
//! path into a Watcher.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use flux_kernel::{FluxError, Result};
use flux_store::SubmissionStore;
use tracing::info;
use uuid::Uuid;

use crate::mail::{FluxSubmission, Mail, MailBody, PRIORITY_NORMAL};
use crate::manager::MANAGER_MAIL_ID;
use crate::postman::Postman;
use crate::status_manager::{CallerContext, ContestGateway};
use crate::watcher::ProblemGateway;

/// Alias kept for symmetry with `flux_store::StoreResult` style naming;
/// intake surfaces the same [`FluxError`] taxonomy every other collaborator
/// does.
pub type IntakeError = FluxError;

/// Whether a problem may be submitted to outside of its owning contest.
/// Mirrors [`ContestGateway`]'s role for the contest case: an
/// out-of-scope domain service this crate only needs one call from.
#[async_trait]
pub trait PracticeGateway: Send + Sync {
    async fn is_practice_allowed(&self, problem_id: &str) -> Result<bool>;
}

/// A `PracticeGateway` that always allows practice submissions —
/// deployments or tests with no contest-scoped problems at all.
pub struct AlwaysAllowPractice;

#[async_trait]
impl PracticeGateway for AlwaysAllowPractice {
    async fn is_practice_allowed(&self, _problem_id: &str) -> Result<bool> {
        Ok(true)
    }
}

/// What `Submit` returns on success.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub submission_id: String,
}

/// Validates and enqueues a new submission.
#[derive(Clone)]
pub struct Submit {
    submissions: SubmissionStore,
    problems: Arc<dyn ProblemGateway>,
    contests: Arc<dyn ContestGateway>,
    practice: Arc<dyn PracticeGateway>,
    postman: Postman,
}

impl Submit {
    pub fn new(
        submissions: SubmissionStore,
        problems: Arc<dyn ProblemGateway>,
        contests: Arc<dyn ContestGateway>,
        practice: Arc<dyn PracticeGateway>,
        postman: Postman,
    ) -> Self {
        Self {
            submissions,
            problems,
            contests,
            practice,
            postman,
        }
    }

    /// `Submit(ctx, {problemId, contestId?, solution}) → err`.
    ///
    /// Scenario 4: an unknown `problem_id` fails with `NotFound` and no row
    /// is written. Scenario 5: a practice submission (`contest_id = None`)
    /// to a problem whose owning contest is ongoing and disallows practice
    /// fails with `Unauthorized`.
    pub async fn submit(
        &self,
        ctx: &CallerContext,
        problem_id: String,
        contest_id: Option<String>,
        solution: HashMap<String, String>,
    ) -> Result<SubmitOutcome> {
        let submitted_by = match ctx {
            CallerContext::External(claims) => claims.subject.clone(),
            CallerContext::Internal => "system".to_string(),
        };

        self.problems
            .site_problem_code(&problem_id)
            .await
            .map_err(|_| FluxError::NotFound {
                entity: "problem",
                id: problem_id.clone(),
            })?;

        match &contest_id {
            Some(cid) => {
                if !self.contests.is_ongoing(cid).await? {
                    return Err(FluxError::Unauthorized(format!(
                        "contest {cid} is not ongoing"
                    )));
                }
            }
            None => {
                if !self.practice.is_practice_allowed(&problem_id).await? {
                    return Err(FluxError::Unauthorized(format!(
                        "practice submissions to {problem_id} are disallowed while its contest is ongoing"
                    )));
                }
            }
        }

        let id = Uuid::now_v7().to_string();
        let solution_value = serde_json::to_value(&solution).map_err(|e| {
            FluxError::InvalidRequest(format!("solution could not be encoded: {e}"))
        })?;

        let submission = self
            .submissions
            .insert_submission(id, submitted_by, problem_id, contest_id, solution_value)
            .await?;

        info!(submission_id = %submission.id, "submission accepted, queued as flux_queued");

        self.postman.route(Mail::new(
            "intake",
            MANAGER_MAIL_ID,
            MailBody::FluxSubmission(FluxSubmission {
                submission_id: submission.id.clone(),
            }),
            PRIORITY_NORMAL,
        ));

        Ok(SubmitOutcome {
            submission_id: submission.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postman::MailClient;
    use flux_store::Database;
    use std::sync::Mutex as StdMutex;

    struct FixedProblem(String);
    #[async_trait]
    impl ProblemGateway for FixedProblem {
        async fn site_problem_code(&self, _problem_id: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct UnknownProblem;
    #[async_trait]
    impl ProblemGateway for UnknownProblem {
        async fn site_problem_code(&self, problem_id: &str) -> Result<String> {
            Err(FluxError::NotFound {
                entity: "problem",
                id: problem_id.to_string(),
            })
        }
    }

    struct AlwaysOngoing;
    #[async_trait]
    impl ContestGateway for AlwaysOngoing {
        async fn is_ongoing(&self, _contest_id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    struct NeverOngoing;
    #[async_trait]
    impl ContestGateway for NeverOngoing {
        async fn is_ongoing(&self, _contest_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    struct DisallowPractice;
    #[async_trait]
    impl PracticeGateway for DisallowPractice {
        async fn is_practice_allowed(&self, _problem_id: &str) -> Result<bool> {
            Ok(false)
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

    async fn harness() -> (SubmissionStore, Postman, Arc<Recorder>) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let submissions = SubmissionStore::new(db);
        let postman = Postman::new();
        let manager = Arc::new(Recorder { received: StdMutex::new(Vec::new()) });
        postman.register(MANAGER_MAIL_ID, manager.clone()).unwrap();
        (submissions, postman, manager)
    }

    #[tokio::test]
    async fn unknown_problem_is_not_found_and_writes_no_row() {
        let (submissions, postman, _manager) = harness().await;
        let intake = Submit::new(
            submissions.clone(),
            Arc::new(UnknownProblem),
            Arc::new(NeverOngoing),
            Arc::new(AlwaysAllowPractice),
            postman,
        );

        let err = intake
            .submit(&CallerContext::internal(), "ghost".into(), None, HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FluxError::NotFound { entity: "problem", .. }));
        assert!(submissions.poll_pending(&[flux_store::FLUX_QUEUED]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn practice_disallowed_during_ongoing_contest_is_unauthorized() {
        let (submissions, postman, _manager) = harness().await;
        let intake = Submit::new(
            submissions,
            Arc::new(FixedProblem("1325A".into())),
            Arc::new(AlwaysOngoing),
            Arc::new(DisallowPractice),
            postman,
        );

        let err = intake
            .submit(
                &CallerContext::internal(),
                "p1".into(),
                None,
                HashMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FluxError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn contest_not_ongoing_is_unauthorized() {
        let (submissions, postman, _manager) = harness().await;
        let intake = Submit::new(
            submissions,
            Arc::new(FixedProblem("1325A".into())),
            Arc::new(NeverOngoing),
            Arc::new(AlwaysAllowPractice),
            postman,
        );

        let err = intake
            .submit(
                &CallerContext::internal(),
                "p1".into(),
                Some("c1".into()),
                HashMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FluxError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn happy_path_inserts_row_and_notifies_manager() {
        let (submissions, postman, manager) = harness().await;
        let intake = Submit::new(
            submissions.clone(),
            Arc::new(FixedProblem("1325A".into())),
            Arc::new(NeverOngoing),
            Arc::new(AlwaysAllowPractice),
            postman,
        );

        let mut solution = HashMap::new();
        solution.insert("language".to_string(), "cpp".to_string());

        let outcome = intake
            .submit(
                &CallerContext::External(crate::status_manager::Claims { subject: "alice".into() }),
                "p1".into(),
                None,
                solution,
            )
            .await
            .unwrap();

        let row = submissions.get_submission(&outcome.submission_id).await.unwrap();
        assert_eq!(row.state, flux_store::FLUX_QUEUED);
        assert_eq!(row.submitted_by, "alice");

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let received = manager.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(matches!(
            received[0].body,
            MailBody::FluxSubmission(ref f) if f.submission_id == outcome.submission_id
        ));
    }
}
