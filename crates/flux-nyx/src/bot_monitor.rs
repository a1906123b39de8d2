//! Bot monitor (§4.10): one per bot, tracking that bot's in-flight site
//! submissions and reconciling them against the store.
//!
//! Owns its status map and stop-decision clock outright; nothing else
//! touches them. The only two things it tells the outside world are a
//! reconciled batch (write-through to the store) and its own exit
//! (`MonitorStopped`, to the Bot Manager).

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flux_store::transaction::Store as TxStore;
use flux_store::{is_sink, CfSubmission, CfSubmissionStore};
use futures::FutureExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::cf_client::{CfClient, CfSubStatus};
use crate::mail::{Mail, MailBody, MailId, PRIORITY_CONTROL, PRIORITY_FAILURE};
use crate::mailbox::Mailbox;
use crate::postman::{MailClient, Postman};

const COLD_START_LISTING_COUNT: u32 = 50;

pub fn bot_monitor_mail_id(bot_name: &str) -> MailId {
    format!("bot_monitor:{bot_name}")
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

struct SignalState {
    end_life: bool,
    latest_signal_millis: i64,
    latest_stop_decision_millis: i64,
    status_map: HashMap<i64, CfSubStatus>,
}

pub struct BotMonitor {
    bot_name: String,
    mail_id: MailId,
    bot_manager_mail_id: MailId,
    postman: Postman,
    cf: CfClient,
    cf_submissions: CfSubmissionStore,
    store: TxStore,
    mailbox: Arc<Mailbox>,
    state: AsyncMutex<SignalState>,
    tick_interval: Duration,
    stop_grace: Duration,
}

impl BotMonitor {
    pub fn new(
        bot_name: impl Into<String>,
        bot_manager_mail_id: impl Into<MailId>,
        postman: Postman,
        cf: CfClient,
        cf_submissions: CfSubmissionStore,
        store: TxStore,
        tick_interval: Duration,
        stop_grace: Duration,
    ) -> Arc<Self> {
        let bot_name = bot_name.into();
        let mail_id = bot_monitor_mail_id(&bot_name);
        let now = now_millis();
        Arc::new(Self {
            bot_name,
            mail_id,
            bot_manager_mail_id: bot_manager_mail_id.into(),
            postman,
            cf,
            cf_submissions,
            store,
            mailbox: Arc::new(Mailbox::new()),
            state: AsyncMutex::new(SignalState {
                end_life: false,
                latest_signal_millis: now,
                latest_stop_decision_millis: now,
                status_map: HashMap::new(),
            }),
            tick_interval,
            stop_grace,
        })
    }

    pub fn mail_id(&self) -> &str {
        &self.mail_id
    }

    pub fn bot_name(&self) -> &str {
        &self.bot_name
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.tick_interval).await;

            let this = Arc::clone(&self);
            let outcome = AssertUnwindSafe(this.tick()).catch_unwind().await;
            match outcome {
                Ok(true) => break,
                Ok(false) => {}
                Err(panic) => {
                    error!(bot = %self.bot_name, cause = %panic_message(panic), "bot monitor tick panicked");
                    self.postman.route(Mail::new(
                        self.mail_id.clone(),
                        self.bot_manager_mail_id.clone(),
                        MailBody::ComponentFailed { cause: "bot monitor tick panicked".into() },
                        PRIORITY_FAILURE,
                    ));
                }
            }
        }
        self.postman.unregister(&self.mail_id);
    }

    /// One tick: drain the mailbox, run the monitor cycle, then check stop
    /// semantics. Returns `true` once the monitor should exit its loop.
    async fn tick(self: Arc<Self>) -> bool {
        let now = now_millis();
        self.drain_mailbox(now).await;

        let changed = self.monitor_cycle().await;
        if changed {
            self.update_stop_decision(now).await;
        }

        self.should_stop(now).await
    }

    async fn drain_mailbox(&self, now: i64) {
        while let Some(mail) = self.mailbox.pop() {
            match mail.body {
                MailBody::Stop(t) => self.on_signal(t, true).await,
                MailBody::KeepAlive(t) => self.on_signal(t, false).await,
                MailBody::SubAlert(status) => self.on_sub_alert(status, now).await,
                MailBody::UpdateStopDecision(t) => self.on_update_stop_decision(t).await,
                other => debug!(bot = %self.bot_name, ?other, "bot monitor dropped unexpected mail body"),
            }
        }
    }

    async fn on_signal(&self, t: i64, is_stop: bool) {
        let mut state = self.state.lock().await;
        if t > state.latest_signal_millis {
            state.latest_signal_millis = t;
            if is_stop {
                state.end_life = true;
            }
        }
    }

    async fn on_sub_alert(&self, status: CfSubStatus, now: i64) {
        let mut state = self.state.lock().await;
        state.status_map.insert(status.id, status);
        state.latest_stop_decision_millis = now;
    }

    async fn on_update_stop_decision(&self, t: i64) {
        let mut state = self.state.lock().await;
        if state.end_life {
            state.latest_stop_decision_millis = state.latest_stop_decision_millis.max(t);
        }
    }

    async fn update_stop_decision(&self, now: i64) {
        let mut state = self.state.lock().await;
        if state.end_life {
            state.latest_stop_decision_millis = state.latest_stop_decision_millis.max(now);
        } else {
            state.latest_stop_decision_millis = now;
        }
    }

    async fn should_stop(&self, now: i64) -> bool {
        let state = self.state.lock().await;
        if state.end_life && now > state.latest_stop_decision_millis + self.stop_grace.as_millis() as i64 {
            self.postman.route(Mail::new(
                self.mail_id.clone(),
                self.bot_manager_mail_id.clone(),
                MailBody::MonitorStopped { bot_name: self.bot_name.clone() },
                PRIORITY_CONTROL,
            ));
            true
        } else {
            false
        }
    }

    /// Refreshes the status map from the site if anything tracked is still
    /// non-sink (or the map is cold), then reconciles against the store.
    /// Returns whether the reconciliation pass wrote anything.
    async fn monitor_cycle(&self) -> bool {
        let needs_refresh = {
            let state = self.state.lock().await;
            state.status_map.is_empty() || state.status_map.values().any(|s| !is_sink(&s.normalized_verdict()))
        };

        if needs_refresh {
            match self.cf.list_submissions(&self.bot_name, 1, COLD_START_LISTING_COUNT).await {
                Ok(listing) => {
                    let mut state = self.state.lock().await;
                    state.status_map = listing.into_iter().map(|s| (s.id, s)).collect();
                }
                Err(err) => {
                    warn!(bot = %self.bot_name, %err, "site listing refresh failed, using stale map");
                }
            }
        }

        self.reconcile().await
    }

    async fn reconcile(&self) -> bool {
        let local: BTreeMap<i64, CfSubStatus> = {
            let state = self.state.lock().await;
            state.status_map.clone().into_iter().collect()
        };

        let db_rows = match self.cf_submissions.get_bulk_non_sink().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(bot = %self.bot_name, %err, "failed to load non-sink linkage rows");
                return false;
            }
        };

        let mut submission_ids = Vec::new();
        let mut states = Vec::new();
        let mut links = Vec::new();

        let mut local_iter = local.into_iter().peekable();
        let mut db_iter = db_rows.into_iter().peekable();

        loop {
            let (Some((local_id, _)), Some(db_row)) = (local_iter.peek(), db_iter.peek()) else {
                break;
            };
            match local_id.cmp(&db_row.cf_sub_id) {
                std::cmp::Ordering::Less => {
                    local_iter.next();
                }
                std::cmp::Ordering::Greater => {
                    db_iter.next();
                }
                std::cmp::Ordering::Equal => {
                    let (_, status) = local_iter.next().unwrap();
                    let db_row = db_iter.next().unwrap();
                    let verdict = status.normalized_verdict();
                    if verdict != db_row.verdict
                        || status.time_consumed_millis != db_row.time_consumed_millis
                        || status.memory_consumed_bytes != db_row.memory_consumed_bytes
                        || status.passed_test_count != db_row.passed_test_count
                    {
                        submission_ids.push(db_row.submission_id.clone());
                        states.push(verdict.clone());
                        links.push(CfSubmission {
                            submission_id: db_row.submission_id,
                            cf_sub_id: db_row.cf_sub_id,
                            verdict,
                            time_consumed_millis: status.time_consumed_millis,
                            memory_consumed_bytes: status.memory_consumed_bytes,
                            passed_test_count: status.passed_test_count,
                        });
                    }
                }
            }
        }

        if submission_ids.is_empty() {
            return false;
        }

        match self.store.reconcile_bot_monitor(submission_ids, states, links).await {
            Ok(()) => true,
            Err(err) => {
                warn!(bot = %self.bot_name, %err, "bot monitor reconciliation write failed");
                false
            }
        }
    }

    /// `GetLatestSubmission(botName)`: a single-entry listing fetch, used by
    /// the Worker Adapter to check whether its just-submitted solution has
    /// landed on the site yet. Always wakes this monitor's next tick.
    pub async fn get_latest_submission(&self) -> Option<CfSubStatus> {
        let latest = match self.cf.list_submissions(&self.bot_name, 1, 1).await {
            Ok(mut listing) => listing.pop(),
            Err(err) => {
                warn!(bot = %self.bot_name, %err, "get_latest_submission failed");
                return None;
            }
        };
        if let Some(status) = latest.clone() {
            self.on_sub_alert(status, now_millis()).await;
        }
        latest
    }

    /// Highest `cf_sub_id` this monitor currently has cached, or `0` if it
    /// hasn't seen one yet — the Worker Adapter's baseline before a submit.
    pub async fn latest_known_id(&self) -> i64 {
        self.state.lock().await.status_map.keys().copied().max().unwrap_or(0)
    }
}

impl MailClient for BotMonitor {
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
    use flux_store::Database;

    fn store_and_cf(db: &Database) -> (TxStore, CfSubmissionStore) {
        (TxStore::new(db.clone()), CfSubmissionStore::new(db.clone()))
    }

    #[tokio::test]
    async fn stop_followed_by_older_keep_alive_is_ignored() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let (store, cf) = store_and_cf(&db);
        let postman = Postman::new();

        let monitor = BotMonitor::new(
            "tourist",
            "bot_manager",
            postman,
            CfClient::new("https://example/{handle}/{from}/{count}"),
            cf,
            store,
            Duration::from_secs(3600),
            Duration::from_secs(300),
        );

        monitor.on_signal(100, true).await;
        monitor.on_signal(50, false).await; // older, must not clear end_life
        let state = monitor.state.lock().await;
        assert!(state.end_life);
    }

    #[tokio::test]
    async fn sub_alert_upserts_status_and_freshens_clock() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let (store, cf) = store_and_cf(&db);
        let postman = Postman::new();

        let monitor = BotMonitor::new(
            "tourist",
            "bot_manager",
            postman,
            CfClient::new("https://example/{handle}/{from}/{count}"),
            cf,
            store,
            Duration::from_secs(3600),
            Duration::from_secs(300),
        );

        monitor
            .on_sub_alert(
                CfSubStatus {
                    id: 1,
                    verdict: "TESTING".into(),
                    time_consumed_millis: 0,
                    memory_consumed_bytes: 0,
                    passed_test_count: 0,
                },
                12_345,
            )
            .await;

        let state = monitor.state.lock().await;
        assert!(state.status_map.contains_key(&1));
        assert_eq!(state.latest_stop_decision_millis, 12_345);
    }

    #[tokio::test]
    async fn reconcile_writes_changed_rows_only() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let submissions = flux_store::SubmissionStore::new(db.clone());
        let (store, cf_store) = store_and_cf(&db);

        submissions
            .insert_submission("s1".into(), "alice".into(), "p1".into(), None, serde_json::json!({}))
            .await
            .unwrap();
        cf_store
            .insert_cf_submission(CfSubmission {
                submission_id: "s1".into(),
                cf_sub_id: 7,
                verdict: "TESTING".into(),
                time_consumed_millis: 0,
                memory_consumed_bytes: 0,
                passed_test_count: 0,
            })
            .await
            .unwrap();

        let postman = Postman::new();
        let monitor = BotMonitor::new(
            "tourist",
            "bot_manager",
            postman,
            CfClient::new("https://example/{handle}/{from}/{count}"),
            cf_store,
            store,
            Duration::from_secs(3600),
            Duration::from_secs(300),
        );

        monitor
            .on_sub_alert(
                CfSubStatus {
                    id: 7,
                    verdict: "OK".into(),
                    time_consumed_millis: 15,
                    memory_consumed_bytes: 1000,
                    passed_test_count: 3,
                },
                0,
            )
            .await;

        let changed = monitor.reconcile().await;
        assert!(changed);

        let updated = submissions.get_submission("s1").await.unwrap();
        assert_eq!(updated.state, "OK");
    }
}
