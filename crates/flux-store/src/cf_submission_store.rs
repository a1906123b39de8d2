//! The Codeforces linkage table: one row per submission once a worker has
//! confirmed it reached the site.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{classify_sqlite, StoreError, StoreResult};
use crate::submission_store::SINK_STATES;

/// A persisted `cf_submissions` row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CfSubmission {
    pub submission_id: String,
    pub cf_sub_id: i64,
    pub verdict: String,
    pub time_consumed_millis: i64,
    pub memory_consumed_bytes: i64,
    pub passed_test_count: i64,
}

fn row_to_cf_submission(row: &Row<'_>) -> rusqlite::Result<CfSubmission> {
    Ok(CfSubmission {
        submission_id: row.get("submission_id")?,
        cf_sub_id: row.get("cf_sub_id")?,
        verdict: row.get("verdict")?,
        time_consumed_millis: row.get("time_consumed_millis")?,
        memory_consumed_bytes: row.get("memory_consumed_bytes")?,
        passed_test_count: row.get("passed_test_count")?,
    })
}

/// Typed access to the `cf_submissions` table.
#[derive(Clone)]
pub struct CfSubmissionStore {
    db: Database,
}

impl CfSubmissionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts the linkage row the first time a worker confirms a submission
    /// reached the site. A second insert for the same `submission_id` (two
    /// peer watchers racing on the same `CfSubResult`) fails with
    /// `AlreadyExists`, which callers must treat as "a peer already wrote
    /// this, end the watch gracefully" rather than a fatal error.
    pub async fn insert_cf_submission(&self, row: CfSubmission) -> StoreResult<()> {
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO cf_submissions \
                     (submission_id, cf_sub_id, verdict, time_consumed_millis, memory_consumed_bytes, passed_test_count) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row.submission_id,
                        row.cf_sub_id,
                        row.verdict,
                        row.time_consumed_millis,
                        row.memory_consumed_bytes,
                        row.passed_test_count,
                    ],
                )
                .map_err(|e| classify_sqlite(e, "cf_submission", row.submission_id.clone()))?;
                Ok(())
            })
            .await
    }

    pub async fn get_cf_submission(&self, submission_id: impl Into<String>) -> StoreResult<CfSubmission> {
        let submission_id = submission_id.into();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    "SELECT submission_id, cf_sub_id, verdict, time_consumed_millis, memory_consumed_bytes, passed_test_count \
                     FROM cf_submissions WHERE submission_id = ?1",
                    params![submission_id],
                    row_to_cf_submission,
                )
                .optional()
                .map_err(|e| classify_sqlite(e, "cf_submission", submission_id.clone()))?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "cf_submission",
                    id: submission_id.clone(),
                })
            })
            .await
    }

    pub async fn get_by_cf_sub_id(&self, cf_sub_id: i64) -> StoreResult<CfSubmission> {
        self.db
            .execute(move |conn| {
                conn.query_row(
                    "SELECT submission_id, cf_sub_id, verdict, time_consumed_millis, memory_consumed_bytes, passed_test_count \
                     FROM cf_submissions WHERE cf_sub_id = ?1",
                    params![cf_sub_id],
                    row_to_cf_submission,
                )
                .optional()
                .map_err(|e| classify_sqlite(e, "cf_submission", cf_sub_id.to_string()))?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "cf_submission",
                    id: cf_sub_id.to_string(),
                })
            })
            .await
    }

    /// Fetches every linkage row whose stored verdict is not yet a sink
    /// state. A bot monitor reconciles this set, sorted by `cf_sub_id`,
    /// against the site's bot-scoped listing via a two-pointer merge — the
    /// matching against the bot-specific HTTP response is what scopes this
    /// otherwise-global query to "this bot's" rows (`cf_sub_id` is unique
    /// per site submission, so only entries the bot actually owns match).
    pub async fn get_bulk_non_sink(&self) -> StoreResult<Vec<CfSubmission>> {
        self.db
            .execute(move |conn| {
                let placeholders = SINK_STATES.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
                let sql = format!(
                    "SELECT submission_id, cf_sub_id, verdict, time_consumed_millis, memory_consumed_bytes, passed_test_count \
                     FROM cf_submissions WHERE verdict NOT IN ({placeholders}) ORDER BY cf_sub_id ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(SINK_STATES.iter()), row_to_cf_submission)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    /// Bulk-updates the monitored fields for a batch of linkage rows,
    /// keyed by `submission_id`. Used by the Bot Monitor's reconciliation
    /// cycle alongside a submission-state bulk update, in the same
    /// transaction.
    pub async fn bulk_update_verdicts(&self, updates: Vec<CfSubmission>) -> StoreResult<()> {
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction().map_err(StoreError::Sqlite)?;
                for row in &updates {
                    tx.execute(
                        "UPDATE cf_submissions \
                         SET verdict = ?1, time_consumed_millis = ?2, memory_consumed_bytes = ?3, passed_test_count = ?4 \
                         WHERE submission_id = ?5",
                        params![
                            row.verdict,
                            row.time_consumed_millis,
                            row.memory_consumed_bytes,
                            row.passed_test_count,
                            row.submission_id,
                        ],
                    )
                    .map_err(|e| classify_sqlite(e, "cf_submission", row.submission_id.clone()))?;
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
    use crate::submission_store::{SubmissionStore, FLUX_QUEUED};

    fn row(submission_id: &str, cf_sub_id: i64, verdict: &str) -> CfSubmission {
        CfSubmission {
            submission_id: submission_id.into(),
            cf_sub_id,
            verdict: verdict.into(),
            time_consumed_millis: 0,
            memory_consumed_bytes: 0,
            passed_test_count: 0,
        }
    }

    async fn seeded_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        db
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let db = seeded_db().await;
        let submissions = SubmissionStore::new(db.clone());
        submissions
            .insert_submission("s1".into(), "u1".into(), "p1".into(), None, serde_json::json!({}))
            .await
            .unwrap();

        let store = CfSubmissionStore::new(db);
        store.insert_cf_submission(row("s1", 42, "TESTING")).await.unwrap();

        let fetched = store.get_cf_submission("s1").await.unwrap();
        assert_eq!(fetched.cf_sub_id, 42);

        let by_cf_id = store.get_by_cf_sub_id(42).await.unwrap();
        assert_eq!(by_cf_id.submission_id, "s1");
    }

    #[tokio::test]
    async fn duplicate_insert_is_already_exists() {
        let db = seeded_db().await;
        let submissions = SubmissionStore::new(db.clone());
        submissions
            .insert_submission("s1".into(), "u1".into(), "p1".into(), None, serde_json::json!({}))
            .await
            .unwrap();

        let store = CfSubmissionStore::new(db);
        store.insert_cf_submission(row("s1", 42, "TESTING")).await.unwrap();

        let err = store
            .insert_cf_submission(row("s1", 43, "TESTING"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { entity: "cf_submission", .. }));
    }

    #[tokio::test]
    async fn get_bulk_non_sink_excludes_sink_verdicts() {
        let db = seeded_db().await;
        let submissions = SubmissionStore::new(db.clone());
        for id in ["s1", "s2", "s3"] {
            submissions
                .insert_submission(id.into(), "u1".into(), "p1".into(), None, serde_json::json!({}))
                .await
                .unwrap();
        }

        let store = CfSubmissionStore::new(db);
        store.insert_cf_submission(row("s1", 1, "TESTING")).await.unwrap();
        store.insert_cf_submission(row("s2", 2, "OK")).await.unwrap();
        store.insert_cf_submission(row("s3", 3, "COMPILING")).await.unwrap();

        let pending = store.get_bulk_non_sink().await.unwrap();
        let ids: Vec<_> = pending.iter().map(|r| r.submission_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s3"]);
    }

    #[tokio::test]
    async fn bulk_update_verdicts_applies_all_rows() {
        let db = seeded_db().await;
        let submissions = SubmissionStore::new(db.clone());
        for id in ["s1", "s2"] {
            submissions
                .insert_submission(id.into(), "u1".into(), "p1".into(), None, serde_json::json!({}))
                .await
                .unwrap();
        }
        let store = CfSubmissionStore::new(db);
        store.insert_cf_submission(row("s1", 1, "TESTING")).await.unwrap();
        store.insert_cf_submission(row("s2", 2, "TESTING")).await.unwrap();

        store
            .bulk_update_verdicts(vec![row("s1", 1, "OK"), row("s2", 2, "WRONG_ANSWER")])
            .await
            .unwrap();

        assert_eq!(store.get_cf_submission("s1").await.unwrap().verdict, "OK");
        assert_eq!(store.get_cf_submission("s2").await.unwrap().verdict, "WRONG_ANSWER");
        let _ = FLUX_QUEUED;
    }
}
