//! Submission records and the state-alphabet legality rules from the
//! specification's §6 (flux states → non-sink site states → sink site
//! states, with no regression once past flux).

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::Database;
use crate::error::{classify_sqlite, StoreError, StoreResult};

/// Flux-internal queued state: not yet forwarded to any evaluator.
pub const FLUX_QUEUED: &str = "flux_queued";
/// Flux-internal failure state: the watcher could not even reach the site.
pub const FLUX_FAILED: &str = "flux_failed";

/// Terminal verdicts past which no further transition is permitted.
pub const SINK_STATES: &[&str] = &[
    "FAILED",
    "OK",
    "PARTIAL",
    "COMPILATION_ERROR",
    "RUNTIME_ERROR",
    "WRONG_ANSWER",
    "TIME_LIMIT_EXCEEDED",
    "MEMORY_LIMIT_EXCEEDED",
    "IDLENESS_LIMIT_EXCEEDED",
    "SECURITY_VIOLATED",
    "CRASHED",
    "INPUT_PREPARATION_CRASHED",
    "CHALLENGED",
    "SKIPPED",
    "REJECTED",
];

/// True for `flux_queued` / `flux_failed`.
pub fn is_flux(state: &str) -> bool {
    state == FLUX_QUEUED || state == FLUX_FAILED
}

/// True for a sink (terminal) site verdict.
pub fn is_sink(state: &str) -> bool {
    SINK_STATES.contains(&state)
}

/// Normalizes a site-reported verdict string: the third-party site reports
/// an empty string while a submission is still being judged.
pub fn normalize_verdict(verdict: &str) -> &str {
    if verdict.is_empty() {
        "TESTING"
    } else {
        verdict
    }
}

/// Checks whether moving from `from` to `to` obeys `flux_* → non-sink →
/// sink`, with no regression once past flux.
///
/// Two flux states are mutually legal (`flux_queued` re-queuing attempts),
/// flux may move to a non-sink state, and non-sink may move to a non-sink
/// or a sink state. Nothing may move out of a sink state, and nothing may
/// move from non-sink back to flux.
pub fn is_legal_transition(from: &str, to: &str) -> bool {
    if is_sink(from) {
        return false;
    }
    if is_flux(from) {
        return true;
    }
    // from is non-sink: to may be non-sink or sink, but not flux.
    !is_flux(to)
}

/// A persisted submission row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Submission {
    pub id: String,
    pub submitted_by: String,
    pub problem_id: String,
    pub contest_id: Option<String>,
    pub solution: serde_json::Value,
    pub state: String,
    pub submitted_at: i64,
    pub updated_at: i64,
}

fn row_to_submission(row: &Row<'_>) -> rusqlite::Result<Submission> {
    let solution_raw: String = row.get("solution")?;
    let solution = serde_json::from_str(&solution_raw).unwrap_or(serde_json::Value::Null);
    Ok(Submission {
        id: row.get("id")?,
        submitted_by: row.get("submitted_by")?,
        problem_id: row.get("problem_id")?,
        contest_id: row.get("contest_id")?,
        solution,
        state: row.get("state")?,
        submitted_at: row.get("submitted_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Typed access to the `submissions` table.
#[derive(Clone)]
pub struct SubmissionStore {
    db: Database,
}

impl SubmissionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a new submission with state `flux_queued`. Returns the row id.
    pub async fn insert_submission(
        &self,
        id: String,
        submitted_by: String,
        problem_id: String,
        contest_id: Option<String>,
        solution: serde_json::Value,
    ) -> StoreResult<Submission> {
        let now = Utc::now().timestamp();
        let solution_raw = serde_json::to_string(&solution)?;

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO submissions \
                     (id, submitted_by, problem_id, contest_id, solution, state, submitted_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![id, submitted_by, problem_id, contest_id, solution_raw, FLUX_QUEUED, now],
                )
                .map_err(|e| classify_sqlite(e, "submission", id.clone()))?;

                Ok(Submission {
                    id,
                    submitted_by,
                    problem_id,
                    contest_id,
                    solution,
                    state: FLUX_QUEUED.to_string(),
                    submitted_at: now,
                    updated_at: now,
                })
            })
            .await
    }

    pub async fn get_submission(&self, id: impl Into<String>) -> StoreResult<Submission> {
        let id = id.into();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    "SELECT id, submitted_by, problem_id, contest_id, solution, state, submitted_at, updated_at \
                     FROM submissions WHERE id = ?1",
                    params![id],
                    row_to_submission,
                )
                .optional()
                .map_err(|e| classify_sqlite(e, "submission", id.clone()))?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "submission",
                    id: id.clone(),
                })
            })
            .await
    }

    /// Updates `state`, validating the transition against the state
    /// alphabet. Rejects the write (without touching the row) if the
    /// transition is illegal.
    pub async fn update_submission_state(
        &self,
        id: impl Into<String>,
        new_state: impl Into<String>,
    ) -> StoreResult<()> {
        let id = id.into();
        let new_state = new_state.into();
        let now = Utc::now().timestamp();

        self.db
            .execute(move |conn| {
                let current: String = conn
                    .query_row(
                        "SELECT state FROM submissions WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| classify_sqlite(e, "submission", id.clone()))?
                    .ok_or_else(|| StoreError::NotFound {
                        entity: "submission",
                        id: id.clone(),
                    })?;

                if !is_legal_transition(&current, &new_state) {
                    debug!(id = %id, from = %current, to = %new_state, "rejected illegal submission transition");
                    return Err(StoreError::InvalidArgument(format!(
                        "illegal submission transition {current} -> {new_state}"
                    )));
                }

                conn.execute(
                    "UPDATE submissions SET state = ?1, updated_at = ?2 WHERE id = ?3",
                    params![new_state, now, id],
                )
                .map_err(|e| classify_sqlite(e, "submission", id.clone()))?;
                Ok(())
            })
            .await
    }

    /// Fetches submissions whose state is in `states`, used by the Manager's
    /// poll loop to find unwatched submissions.
    pub async fn poll_pending(&self, states: &[&str]) -> StoreResult<Vec<Submission>> {
        let states: Vec<String> = states.iter().map(|s| s.to_string()).collect();

        self.db
            .execute(move |conn| {
                let placeholders = states.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
                let sql = format!(
                    "SELECT id, submitted_by, problem_id, contest_id, solution, state, submitted_at, updated_at \
                     FROM submissions WHERE state IN ({placeholders}) ORDER BY submitted_at ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(states.iter()), row_to_submission)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    /// Bulk-updates submission state for a batch of ids, validating each
    /// transition. Fails if `ids.len() != states.len()`.
    pub async fn bulk_update_submission_state(
        &self,
        ids: Vec<String>,
        states: Vec<String>,
    ) -> StoreResult<()> {
        if ids.len() != states.len() {
            return Err(StoreError::InvalidArgument(format!(
                "bulk_update_submission_state: {} ids but {} states",
                ids.len(),
                states.len()
            )));
        }
        let now = Utc::now().timestamp();

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction().map_err(StoreError::Sqlite)?;
                for (id, new_state) in ids.iter().zip(states.iter()) {
                    let current: String = tx
                        .query_row(
                            "SELECT state FROM submissions WHERE id = ?1",
                            params![id],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(|e| classify_sqlite(e, "submission", id.clone()))?
                        .ok_or_else(|| StoreError::NotFound {
                            entity: "submission",
                            id: id.clone(),
                        })?;

                    if !is_legal_transition(&current, new_state) {
                        return Err(StoreError::InvalidArgument(format!(
                            "illegal submission transition {current} -> {new_state} for {id}"
                        )));
                    }

                    tx.execute(
                        "UPDATE submissions SET state = ?1, updated_at = ?2 WHERE id = ?3",
                        params![new_state, now, id],
                    )
                    .map_err(|e| classify_sqlite(e, "submission", id.clone()))?;
                }
                tx.commit().map_err(StoreError::Sqlite)?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(state: &str) -> Submission {
        Submission {
            id: "s1".into(),
            submitted_by: "u1".into(),
            problem_id: "p1".into(),
            contest_id: None,
            solution: serde_json::json!({}),
            state: state.into(),
            submitted_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn flux_to_non_sink_is_legal() {
        assert!(is_legal_transition(FLUX_QUEUED, "TESTING"));
    }

    #[test]
    fn flux_to_flux_is_legal() {
        assert!(is_legal_transition(FLUX_QUEUED, FLUX_FAILED));
    }

    #[test]
    fn non_sink_to_sink_is_legal() {
        assert!(is_legal_transition("TESTING", "OK"));
    }

    #[test]
    fn non_sink_to_flux_is_illegal() {
        assert!(!is_legal_transition("TESTING", FLUX_FAILED));
    }

    #[test]
    fn sink_to_anything_is_illegal() {
        assert!(!is_legal_transition("OK", "TESTING"));
        assert!(!is_legal_transition("OK", FLUX_FAILED));
        assert!(!is_legal_transition("OK", "WRONG_ANSWER"));
    }

    #[test]
    fn empty_verdict_normalizes_to_testing() {
        assert_eq!(normalize_verdict(""), "TESTING");
        assert_eq!(normalize_verdict("OK"), "OK");
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = SubmissionStore::new(db);

        let inserted = store
            .insert_submission(
                "s1".into(),
                "u1".into(),
                "p1".into(),
                None,
                serde_json::json!({"lang": "cpp"}),
            )
            .await
            .unwrap();
        assert_eq!(inserted.state, FLUX_QUEUED);

        let fetched = store.get_submission("s1").await.unwrap();
        assert_eq!(fetched, inserted);
    }

    #[tokio::test]
    async fn update_rejects_illegal_transition() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = SubmissionStore::new(db);
        store
            .insert_submission("s1".into(), "u1".into(), "p1".into(), None, serde_json::json!({}))
            .await
            .unwrap();

        store.update_submission_state("s1", "OK").await.unwrap();
        let result = store.update_submission_state("s1", FLUX_FAILED).await;
        assert!(result.is_err());

        let fetched = store.get_submission("s1").await.unwrap();
        assert_eq!(fetched.state, "OK");
    }

    #[tokio::test]
    async fn poll_pending_returns_only_matching_states() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = SubmissionStore::new(db);
        store
            .insert_submission("s1".into(), "u1".into(), "p1".into(), None, serde_json::json!({}))
            .await
            .unwrap();
        store
            .insert_submission("s2".into(), "u1".into(), "p1".into(), None, serde_json::json!({}))
            .await
            .unwrap();
        store.update_submission_state("s2", "OK").await.unwrap();

        let pending = store.poll_pending(&[FLUX_QUEUED, FLUX_FAILED]).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "s1");
    }

    #[tokio::test]
    async fn bulk_update_rejects_mismatched_lengths() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = SubmissionStore::new(db);
        let err = store
            .bulk_update_submission_state(vec!["s1".into()], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn bulk_update_is_atomic_on_failure() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let store = SubmissionStore::new(db);
        store
            .insert_submission("s1".into(), "u1".into(), "p1".into(), None, serde_json::json!({}))
            .await
            .unwrap();
        store.update_submission_state("s1", "OK").await.unwrap();
        store
            .insert_submission("s2".into(), "u1".into(), "p1".into(), None, serde_json::json!({}))
            .await
            .unwrap();

        // s1 (sink "OK") -> flux_failed is illegal; the whole batch must roll back.
        let result = store
            .bulk_update_submission_state(
                vec!["s1".into(), "s2".into()],
                vec![FLUX_FAILED.into(), "TESTING".into()],
            )
            .await;
        assert!(result.is_err());

        let s2 = store.get_submission("s2").await.unwrap();
        assert_eq!(s2.state, FLUX_QUEUED, "s2 must not have been updated");
    }

    #[test]
    fn state_helpers_cover_whole_alphabet() {
        let s = submission(FLUX_QUEUED);
        assert!(is_flux(&s.state));
        assert!(!is_sink(&s.state));
    }
}
