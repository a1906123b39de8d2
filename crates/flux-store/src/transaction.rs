//! Cross-table atomic operations.
//!
//! The Watcher needs to insert a `cf_submissions` linkage row and update the
//! parent `submissions.state` column as a single unit (so a crash or a
//! racing peer watcher never leaves one written without the other); the Bot
//! Monitor needs the same atomicity across a whole reconciliation batch.
//! Both are expressed here as single `spawn_blocking` closures driving one
//! `rusqlite::Transaction`, rather than composing the individual store
//! methods (which would each open their own transaction).

use rusqlite::params;

use crate::cf_submission_store::CfSubmission;
use crate::db::Database;
use crate::error::{classify_sqlite, StoreError, StoreResult};
use crate::submission_store::is_legal_transition;

/// Bundles the three typed stores behind one shared [`Database`] handle and
/// exposes the operations that must cross table boundaries atomically.
#[derive(Clone)]
pub struct Store {
    db: Database,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Inserts the `cf_submissions` linkage row and updates the parent
    /// submission's state in one transaction.
    ///
    /// A `UNIQUE` violation on the linkage insert (a peer watcher already
    /// wrote this submission's result) surfaces as
    /// [`StoreError::AlreadyExists`] with the transaction rolled back —
    /// callers must treat that as "peer succeeded, end watch gracefully".
    pub async fn link_cf_submission_and_update_state(
        &self,
        link: CfSubmission,
        new_state: String,
    ) -> StoreResult<()> {
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction().map_err(StoreError::Sqlite)?;

                let current: String = tx
                    .query_row(
                        "SELECT state FROM submissions WHERE id = ?1",
                        params![link.submission_id],
                        |row| row.get(0),
                    )
                    .map_err(|e| classify_sqlite(e, "submission", link.submission_id.clone()))?;

                if !is_legal_transition(&current, &new_state) {
                    return Err(StoreError::InvalidArgument(format!(
                        "illegal submission transition {current} -> {new_state}"
                    )));
                }

                tx.execute(
                    "INSERT INTO cf_submissions \
                     (submission_id, cf_sub_id, verdict, time_consumed_millis, memory_consumed_bytes, passed_test_count) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        link.submission_id,
                        link.cf_sub_id,
                        link.verdict,
                        link.time_consumed_millis,
                        link.memory_consumed_bytes,
                        link.passed_test_count,
                    ],
                )
                .map_err(|e| classify_sqlite(e, "cf_submission", link.submission_id.clone()))?;

                tx.execute(
                    "UPDATE submissions SET state = ?1, updated_at = strftime('%s','now') WHERE id = ?2",
                    params![new_state, link.submission_id],
                )
                .map_err(|e| classify_sqlite(e, "submission", link.submission_id.clone()))?;

                tx.commit().map_err(StoreError::Sqlite)?;
                Ok(())
            })
            .await
    }

    /// The Bot Monitor's reconciliation cycle: bulk-updates the submission
    /// state column and the linkage table's monitored fields in one
    /// transaction, driven by the two-pointer merge's accumulated vectors.
    ///
    /// `submission_ids`/`states` and `links` are independent batches (a
    /// linkage row whose monitored fields changed does not necessarily
    /// imply a state change, and vice versa isn't possible but the two
    /// lists are kept decoupled to mirror the source's parallel-vector
    /// accumulation).
    pub async fn reconcile_bot_monitor(
        &self,
        submission_ids: Vec<String>,
        states: Vec<String>,
        links: Vec<CfSubmission>,
    ) -> StoreResult<()> {
        if submission_ids.len() != states.len() {
            return Err(StoreError::InvalidArgument(format!(
                "reconcile_bot_monitor: {} submission ids but {} states",
                submission_ids.len(),
                states.len()
            )));
        }

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction().map_err(StoreError::Sqlite)?;

                for (id, new_state) in submission_ids.iter().zip(states.iter()) {
                    let current: String = tx
                        .query_row(
                            "SELECT state FROM submissions WHERE id = ?1",
                            params![id],
                            |row| row.get(0),
                        )
                        .map_err(|e| classify_sqlite(e, "submission", id.clone()))?;

                    if !is_legal_transition(&current, new_state) {
                        return Err(StoreError::InvalidArgument(format!(
                            "illegal submission transition {current} -> {new_state} for {id}"
                        )));
                    }

                    tx.execute(
                        "UPDATE submissions SET state = ?1, updated_at = strftime('%s','now') WHERE id = ?2",
                        params![new_state, id],
                    )
                    .map_err(|e| classify_sqlite(e, "submission", id.clone()))?;
                }

                for link in &links {
                    tx.execute(
                        "UPDATE cf_submissions \
                         SET verdict = ?1, time_consumed_millis = ?2, memory_consumed_bytes = ?3, passed_test_count = ?4 \
                         WHERE submission_id = ?5",
                        params![
                            link.verdict,
                            link.time_consumed_millis,
                            link.memory_consumed_bytes,
                            link.passed_test_count,
                            link.submission_id,
                        ],
                    )
                    .map_err(|e| classify_sqlite(e, "cf_submission", link.submission_id.clone()))?;
                }

                tx.commit().map_err(StoreError::Sqlite)?;
                Ok(())
            })
            .await
    }
}
