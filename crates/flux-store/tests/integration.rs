//! Integration tests for the flux-store crate against a real on-disk
//! SQLite database.

use flux_store::{
    Bot, BotStore, CfSubmission, CfSubmissionStore, Database, Store, SubmissionStore, FLUX_QUEUED,
};

fn link(submission_id: &str, cf_sub_id: i64, verdict: &str) -> CfSubmission {
    CfSubmission {
        submission_id: submission_id.into(),
        cf_sub_id,
        verdict: verdict.into(),
        time_consumed_millis: 0,
        memory_consumed_bytes: 0,
        passed_test_count: 0,
    }
}

#[tokio::test]
async fn database_open_and_migrate_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("flux.db");

    let db = Database::open_and_migrate(db_path.clone()).await.unwrap();

    for table in ["submissions", "cf_submissions", "bots"] {
        let count: i64 = db
            .execute(move |conn| {
                let sql = format!("SELECT count(*) FROM {table}");
                let c: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
                Ok(c)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}

#[tokio::test]
async fn migrations_are_idempotent_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("flux.db");

    let db = Database::open_and_migrate(db_path.clone()).await.unwrap();
    // Running migrations again against the same file must be a no-op, not
    // an error (e.g. "table already exists").
    db.run_migrations().await.unwrap();
    db.run_migrations().await.unwrap();
}

#[tokio::test]
async fn submission_round_trips_every_field() {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();
    let store = SubmissionStore::new(db);

    let inserted = store
        .insert_submission(
            "sub-1".into(),
            "user-42".into(),
            "problem-7".into(),
            Some("contest-3".into()),
            serde_json::json!({"language": "cpp", "code": "int main(){}"}),
        )
        .await
        .unwrap();

    let fetched = store.get_submission("sub-1").await.unwrap();
    assert_eq!(fetched, inserted);
    assert_eq!(fetched.state, FLUX_QUEUED);
    assert_eq!(fetched.contest_id.as_deref(), Some("contest-3"));
}

#[tokio::test]
async fn duplicate_cf_submission_insert_is_translated_not_raw() {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();
    let submissions = SubmissionStore::new(db.clone());
    submissions
        .insert_submission("sub-1".into(), "user-1".into(), "problem-1".into(), None, serde_json::json!({}))
        .await
        .unwrap();

    let cf_submissions = CfSubmissionStore::new(db);
    cf_submissions
        .insert_cf_submission(link("sub-1", 100, "TESTING"))
        .await
        .unwrap();

    // A second watcher racing on the same result must get a typed
    // AlreadyExists, never a raw rusqlite error leaking out of the crate.
    let err = cf_submissions
        .insert_cf_submission(link("sub-1", 101, "TESTING"))
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("already exists"), "unexpected error: {message}");
}

#[tokio::test]
async fn watcher_style_link_and_state_update_is_atomic() {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();
    let submissions = SubmissionStore::new(db.clone());
    submissions
        .insert_submission("sub-1".into(), "user-1".into(), "problem-1".into(), None, serde_json::json!({}))
        .await
        .unwrap();

    let store = Store::new(db.clone());
    store
        .link_cf_submission_and_update_state(link("sub-1", 1, "TESTING"), "TESTING".into())
        .await
        .unwrap();

    assert_eq!(submissions.get_submission("sub-1").await.unwrap().state, "TESTING");

    // Peer watcher delivering the same result again must fail cleanly and
    // leave the prior successful write untouched.
    let err = store
        .link_cf_submission_and_update_state(link("sub-1", 1, "OK"), "OK".into())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already exists"));
    assert_eq!(submissions.get_submission("sub-1").await.unwrap().state, "TESTING");
}

#[tokio::test]
async fn bot_monitor_style_reconciliation_updates_both_tables() {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();

    let bots = BotStore::new(db.clone());
    let inserted: Bot = bots.insert_bot("tourist".into(), "codeforces".into()).await.unwrap();
    assert_eq!(inserted.name, "tourist");

    let submissions = SubmissionStore::new(db.clone());
    let cf_submissions = CfSubmissionStore::new(db.clone());
    for (id, cf_id) in [("sub-1", 1), ("sub-2", 2)] {
        submissions
            .insert_submission(id.into(), "user-1".into(), "problem-1".into(), None, serde_json::json!({}))
            .await
            .unwrap();
        cf_submissions.insert_cf_submission(link(id, cf_id, "TESTING")).await.unwrap();
        submissions.update_submission_state(id, "TESTING").await.unwrap();
    }

    let pending = cf_submissions.get_bulk_non_sink().await.unwrap();
    assert_eq!(pending.len(), 2);

    let store = Store::new(db.clone());
    store
        .reconcile_bot_monitor(
            vec!["sub-1".into(), "sub-2".into()],
            vec!["OK".into(), "WRONG_ANSWER".into()],
            vec![link("sub-1", 1, "OK"), link("sub-2", 2, "WRONG_ANSWER")],
        )
        .await
        .unwrap();

    assert_eq!(submissions.get_submission("sub-1").await.unwrap().state, "OK");
    assert_eq!(cf_submissions.get_cf_submission("sub-2").await.unwrap().verdict, "WRONG_ANSWER");

    // Reconciled rows are now sink states and must drop out of the pending set.
    assert!(cf_submissions.get_bulk_non_sink().await.unwrap().is_empty());
}

#[tokio::test]
async fn poll_pending_drives_manager_style_queue_scan() {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();
    let store = SubmissionStore::new(db);

    store
        .insert_submission("queued-1".into(), "user-1".into(), "problem-1".into(), None, serde_json::json!({}))
        .await
        .unwrap();
    store
        .insert_submission("running-1".into(), "user-1".into(), "problem-1".into(), None, serde_json::json!({}))
        .await
        .unwrap();
    store.update_submission_state("running-1", "TESTING").await.unwrap();

    let pending = store.poll_pending(&[FLUX_QUEUED, flux_store::FLUX_FAILED]).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "queued-1");
}
