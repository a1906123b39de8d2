//! Submission status manager (§4.12): the one place that reads and writes
//! submission + evaluator-linkage state together.
//!
//! Read path composes the base `submissions` row with the Codeforces
//! linkage row; write paths delegate straight to the typed stores (or the
//! cross-table [`flux_store::transaction::Store`] when a caller needs both
//! written atomically, as the Watcher and Bot Monitor do).
//!
//! Authorization is a thin hook, not a policy engine: the actual
//! role/contest/problem services are out of scope here and are consumed
//! through the [`ContestGateway`] trait, the stated interface this crate
//! needs from them.

use std::sync::Arc;

use async_trait::async_trait;
use flux_kernel::{FluxError, Result};
use flux_store::{CfSubmission, CfSubmissionStore, Submission, SubmissionStore};

/// The caller's identity claims, as resolved by the (out-of-scope) auth
/// boundary. Only the subject is needed here.
#[derive(Debug, Clone)]
pub struct Claims {
    pub subject: String,
}

/// Distinguishes an externally authenticated caller from the core's own
/// internal callers (Watcher, Bot Monitor), which bypass claims
/// enforcement entirely — the internal-query marker from §4.12.
#[derive(Debug, Clone)]
pub enum CallerContext {
    External(Claims),
    Internal,
}

impl CallerContext {
    pub fn internal() -> Self {
        CallerContext::Internal
    }
}

/// Stated interface onto the out-of-scope contest domain service: whether
/// a contest is still ongoing (practice submissions to a live contest hide
/// the solution body from non-owners).
#[async_trait]
pub trait ContestGateway: Send + Sync {
    async fn is_ongoing(&self, contest_id: &str) -> Result<bool>;
}

/// A `ContestGateway` that reports every contest as finished — useful for
/// deployments or tests that don't need the stricter authorization path.
pub struct NoContestsOngoing;

#[async_trait]
impl ContestGateway for NoContestsOngoing {
    async fn is_ongoing(&self, _contest_id: &str) -> Result<bool> {
        Ok(false)
    }
}

/// A submission composed with its evaluator-specific linkage row, if any.
#[derive(Debug, Clone)]
pub struct EvaluatedSubmission {
    pub submission: Submission,
    pub cf_submission: Option<CfSubmission>,
}

/// Abstracts per-evaluator DB read/update of submission + linkage state.
/// The only evaluator wired up today is Codeforces; a second evaluator
/// would add its own linkage store and a branch in `compose`.
#[derive(Clone)]
pub struct SubmissionStatusManager {
    submissions: SubmissionStore,
    cf_submissions: CfSubmissionStore,
    contests: Arc<dyn ContestGateway>,
}

impl SubmissionStatusManager {
    pub fn new(
        submissions: SubmissionStore,
        cf_submissions: CfSubmissionStore,
        contests: Arc<dyn ContestGateway>,
    ) -> Self {
        Self {
            submissions,
            cf_submissions,
            contests,
        }
    }

    /// Reads a submission, composed with its Codeforces linkage row if one
    /// exists yet. Strips `solution` when the caller is not the submitter,
    /// the submission belongs to a contest, and that contest is still
    /// ongoing — unless `ctx` is [`CallerContext::Internal`].
    pub async fn get_submission(&self, ctx: &CallerContext, id: &str) -> Result<EvaluatedSubmission> {
        let mut submission = self.submissions.get_submission(id).await?;
        let cf_submission = match self.cf_submissions.get_cf_submission(id).await {
            Ok(row) => Some(row),
            Err(flux_store::StoreError::NotFound { .. }) => None,
            Err(err) => return Err(err.into()),
        };

        if let CallerContext::External(claims) = ctx {
            if claims.subject != submission.submitted_by {
                if let Some(contest_id) = submission.contest_id.clone() {
                    if self.contests.is_ongoing(&contest_id).await? {
                        submission.solution = serde_json::Value::Null;
                    }
                }
            }
        }

        Ok(EvaluatedSubmission {
            submission,
            cf_submission,
        })
    }

    /// `UpdateSubmission(ctx, qtx, id, state)`: advances a single
    /// submission's state, validated against the transition DAG by the
    /// underlying store.
    pub async fn update_submission_state(&self, id: impl Into<String>, state: impl Into<String>) -> Result<()> {
        self.submissions
            .update_submission_state(id, state)
            .await
            .map_err(FluxError::from)
    }

    /// `BulkUpdateSubmissionState(ctx, qtx, ids, states)`: fails outright if
    /// `ids.len() != states.len()`, otherwise applies every transition in
    /// one batch, atomically.
    pub async fn bulk_update_submission_state(&self, ids: Vec<String>, states: Vec<String>) -> Result<()> {
        if ids.len() != states.len() {
            return Err(FluxError::InvalidRequest(format!(
                "bulk_update_submission_state: {} ids but {} states",
                ids.len(),
                states.len()
            )));
        }
        self.submissions
            .bulk_update_submission_state(ids, states)
            .await
            .map_err(FluxError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_store::Database;

    async fn seeded() -> (SubmissionStore, CfSubmissionStore) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        (SubmissionStore::new(db.clone()), CfSubmissionStore::new(db))
    }

    struct AlwaysOngoing;
    #[async_trait]
    impl ContestGateway for AlwaysOngoing {
        async fn is_ongoing(&self, _contest_id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn non_owner_gets_solution_stripped_during_ongoing_contest() {
        let (submissions, cf) = seeded().await;
        submissions
            .insert_submission(
                "s1".into(),
                "alice".into(),
                "p1".into(),
                Some("c1".into()),
                serde_json::json!({"language": "cpp", "code": "secret"}),
            )
            .await
            .unwrap();

        let manager = SubmissionStatusManager::new(submissions, cf, Arc::new(AlwaysOngoing));
        let result = manager
            .get_submission(&CallerContext::External(Claims { subject: "bob".into() }), "s1")
            .await
            .unwrap();
        assert_eq!(result.submission.solution, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn owner_always_sees_solution() {
        let (submissions, cf) = seeded().await;
        submissions
            .insert_submission(
                "s1".into(),
                "alice".into(),
                "p1".into(),
                Some("c1".into()),
                serde_json::json!({"language": "cpp", "code": "secret"}),
            )
            .await
            .unwrap();

        let manager = SubmissionStatusManager::new(submissions, cf, Arc::new(AlwaysOngoing));
        let result = manager
            .get_submission(&CallerContext::External(Claims { subject: "alice".into() }), "s1")
            .await
            .unwrap();
        assert_ne!(result.submission.solution, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn internal_context_bypasses_stripping() {
        let (submissions, cf) = seeded().await;
        submissions
            .insert_submission(
                "s1".into(),
                "alice".into(),
                "p1".into(),
                Some("c1".into()),
                serde_json::json!({"language": "cpp", "code": "secret"}),
            )
            .await
            .unwrap();

        let manager = SubmissionStatusManager::new(submissions, cf, Arc::new(AlwaysOngoing));
        let result = manager.get_submission(&CallerContext::Internal, "s1").await.unwrap();
        assert_ne!(result.submission.solution, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn bulk_update_rejects_mismatched_lengths() {
        let (submissions, cf) = seeded().await;
        let manager = SubmissionStatusManager::new(submissions, cf, Arc::new(NoContestsOngoing));
        let err = manager
            .bulk_update_submission_state(vec!["s1".into()], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, FluxError::InvalidRequest(_)));
    }
}
