//! Bot manager (§4.9): the single canonical owner of bot→worker
//! distribution, and the inventory of per-bot monitors.
//!
//! A second, parallel distribution ledger with near-duplicate sticky
//! placement logic is a known failure mode in systems like this one (and a
//! round-robin index that advances twice per call is a common bug hiding in
//! that duplication). There is exactly one distribution map here.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flux_kernel::{FluxError, Result};
use flux_store::transaction::Store as TxStore;
use flux_store::{BotStore, CfSubmissionStore};
use futures::FutureExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bot_monitor::{bot_monitor_mail_id, BotMonitor};
use crate::cf_client::CfClient;
use crate::mail::{Mail, MailBody, MailId, PRIORITY_CONTROL, PRIORITY_FAILURE};
use crate::mailbox::Mailbox;
use crate::postman::{MailClient, Postman};

const IDLE_SLEEP: Duration = Duration::from_millis(100);
const COOKIE_UPDATE_TIMEOUT: Duration = Duration::from_secs(5);
pub const BOT_MANAGER_MAIL_ID: &str = "bot_manager";

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

struct WorkerEntry {
    bots: Vec<String>,
    round_robin: usize,
    last_used_bot: Option<String>,
}

struct BotManagerState {
    monitors: HashMap<String, Arc<BotMonitor>>,
    distribution: HashMap<MailId, WorkerEntry>,
}

pub struct BotManager {
    master_mail_id: MailId,
    postman: Postman,
    cf: CfClient,
    cf_submissions: CfSubmissionStore,
    bots: BotStore,
    store: TxStore,
    monitor_tick: Duration,
    monitor_stop_grace: Duration,
    mailbox: Arc<Mailbox>,
    state: AsyncMutex<BotManagerState>,
}

impl BotManager {
    pub fn new(
        master_mail_id: impl Into<MailId>,
        postman: Postman,
        cf: CfClient,
        cf_submissions: CfSubmissionStore,
        bots: BotStore,
        store: TxStore,
        monitor_tick: Duration,
        monitor_stop_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            master_mail_id: master_mail_id.into(),
            postman,
            cf,
            cf_submissions,
            bots,
            store,
            monitor_tick,
            monitor_stop_grace,
            mailbox: Arc::new(Mailbox::new()),
            state: AsyncMutex::new(BotManagerState {
                monitors: HashMap::new(),
                distribution: HashMap::new(),
            }),
        })
    }

    pub fn mail_id(&self) -> &str {
        BOT_MANAGER_MAIL_ID
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        self.postman
            .register(BOT_MANAGER_MAIL_ID, self.clone())
            .expect("bot manager mail id already registered");
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self: Arc<Self>) {
        loop {
            let Some(mail) = self.mailbox.pop() else {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            };

            let this = self.clone();
            let outcome = AssertUnwindSafe(this.dispatch(mail)).catch_unwind().await;
            if let Err(panic) = outcome {
                error!(cause = %panic_message(panic), "bot manager dispatch panicked, continuing");
                self.postman.route(Mail::new(
                    BOT_MANAGER_MAIL_ID,
                    self.master_mail_id.clone(),
                    MailBody::ComponentFailed { cause: "bot manager dispatch panicked".into() },
                    PRIORITY_FAILURE,
                ));
            }
        }
    }

    async fn dispatch(self: Arc<Self>, mail: Mail) {
        match mail.body {
            MailBody::RefreshBots { bots, workers } => self.refresh(bots, workers).await,
            MailBody::MonitorStopped { bot_name } => self.on_monitor_stopped(bot_name).await,
            MailBody::CorruptedBot { bot_name } => self.on_corrupted_bot(bot_name).await,
            MailBody::InvalidMailClient(id) => self.on_invalid_mail_client(id).await,
            other => debug!(?other, "bot manager dropped unexpected mail body"),
        }
    }

    /// `RefreshBots{bots, workers}`: the whole three-step algorithm runs
    /// under the state lock so a concurrent refresh can't interleave with
    /// this one.
    async fn refresh(&self, bots: Vec<String>, workers: Vec<MailId>) {
        let now = now_millis();
        let mut state = self.state.lock().await;

        let bot_set: std::collections::HashSet<&String> = bots.iter().collect();
        for (name, monitor) in state.monitors.iter() {
            let body = if bot_set.contains(name) {
                MailBody::KeepAlive(now)
            } else {
                MailBody::Stop(now)
            };
            self.postman.route(Mail::new(BOT_MANAGER_MAIL_ID, monitor.mail_id().to_string(), body, PRIORITY_CONTROL));
        }

        for name in &bots {
            if state.monitors.contains_key(name) {
                continue;
            }
            let monitor = BotMonitor::new(
                name.clone(),
                BOT_MANAGER_MAIL_ID,
                self.postman.clone(),
                self.cf.clone(),
                self.cf_submissions.clone(),
                self.store.clone(),
                self.monitor_tick,
                self.monitor_stop_grace,
            );
            if self.postman.register(monitor.mail_id().to_string(), monitor.clone()).is_ok() {
                monitor.clone().start();
                info!(bot = %name, "created bot monitor");
                state.monitors.insert(name.clone(), monitor);
            }
        }

        self.redistribute(&mut state, &bots, &workers);

        self.postman.route(Mail::new(
            BOT_MANAGER_MAIL_ID,
            self.master_mail_id.clone(),
            MailBody::RefreshBotsResult { bots, workers },
            PRIORITY_CONTROL,
        ));
    }

    fn redistribute(&self, state: &mut BotManagerState, bots: &[String], workers: &[MailId]) {
        if workers.is_empty() {
            state.distribution.clear();
            return;
        }
        if bots.is_empty() {
            state.distribution = workers
                .iter()
                .cloned()
                .map(|w| (w, WorkerEntry { bots: Vec::new(), round_robin: 0, last_used_bot: None }))
                .collect();
            return;
        }

        let per_worker = bots.len().div_ceil(workers.len());
        let mut pool: Vec<String> = bots.to_vec();
        let mut next = HashMap::new();

        for worker in workers {
            let mut assigned = Vec::new();
            let sticky = state
                .distribution
                .get(worker)
                .and_then(|e| e.last_used_bot.clone())
                .filter(|b| pool.contains(b));

            if let Some(bot) = sticky {
                pool.retain(|b| b != &bot);
                assigned.push(bot);
            }
            while assigned.len() < per_worker {
                if pool.is_empty() {
                    break;
                }
                assigned.push(pool.remove(0));
            }

            let last_used_bot = assigned.first().cloned();
            next.insert(worker.clone(), WorkerEntry { bots: assigned, round_robin: 0, last_used_bot });
        }

        state.distribution = next;
    }

    async fn on_monitor_stopped(&self, bot_name: String) {
        let mut state = self.state.lock().await;
        state.monitors.remove(&bot_name);
        for entry in state.distribution.values_mut() {
            entry.bots.retain(|b| b != &bot_name);
        }
        self.postman.unregister(&bot_monitor_mail_id(&bot_name));
    }

    async fn on_corrupted_bot(&self, bot_name: String) {
        let now = now_millis();
        let mut state = self.state.lock().await;
        for entry in state.distribution.values_mut() {
            entry.bots.retain(|b| b != &bot_name);
        }
        if let Some(monitor) = state.monitors.get(&bot_name) {
            self.postman.route(Mail::new(
                BOT_MANAGER_MAIL_ID,
                monitor.mail_id().to_string(),
                MailBody::Stop(now),
                PRIORITY_CONTROL,
            ));
        }
    }

    async fn on_invalid_mail_client(&self, id: MailId) {
        if let Some(bot_name) = id.strip_prefix("bot_monitor:") {
            let state = self.state.lock().await;
            if let Some(monitor) = state.monitors.get(bot_name) {
                let _ = self.postman.register(id, monitor.clone());
            }
        }
    }

    /// `GetBot(workerId)`: advances round-robin, returns that bot. Direct
    /// async call rather than mail — the Worker Adapter already holds this
    /// manager as an `Arc`, and every submission needs an immediate answer.
    pub async fn get_bot(&self, worker_id: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        let entry = state
            .distribution
            .get_mut(worker_id)
            .ok_or_else(|| FluxError::NotFound { entity: "worker", id: worker_id.to_string() })?;

        if entry.bots.is_empty() {
            return Err(FluxError::InvalidRequest(format!("no bots available for worker {worker_id}")));
        }

        let bot = entry.bots[entry.round_robin % entry.bots.len()].clone();
        entry.round_robin = (entry.round_robin + 1) % entry.bots.len();
        entry.last_used_bot = Some(bot.clone());
        Ok(bot)
    }

    pub async fn get_cookies(&self, bot_name: &str) -> Result<HashMap<String, String>> {
        self.bots.get_cookies(bot_name.to_string()).await.map_err(FluxError::from)
    }

    /// The Worker Adapter's pre-submit baseline: the highest site
    /// submission id this bot's monitor has cached.
    pub async fn latest_known_submission_id(&self, bot_name: &str) -> Result<i64> {
        let state = self.state.lock().await;
        let monitor = state
            .monitors
            .get(bot_name)
            .ok_or_else(|| FluxError::NotFound { entity: "bot", id: bot_name.to_string() })?
            .clone();
        drop(state);
        Ok(monitor.latest_known_id().await)
    }

    /// The Worker Adapter's post-submit poll: a fresh single-entry listing
    /// fetch for this bot's latest site submission.
    pub async fn poll_latest_submission(&self, bot_name: &str) -> Result<Option<crate::cf_client::CfSubStatus>> {
        let state = self.state.lock().await;
        let monitor = state
            .monitors
            .get(bot_name)
            .ok_or_else(|| FluxError::NotFound { entity: "bot", id: bot_name.to_string() })?
            .clone();
        drop(state);
        Ok(monitor.get_latest_submission().await)
    }

    pub async fn update_cookies(&self, bot_name: &str, cookies: HashMap<String, String>) -> Result<()> {
        tokio::time::timeout(COOKIE_UPDATE_TIMEOUT, self.bots.update_cookies(bot_name.to_string(), cookies))
            .await
            .map_err(|_| FluxError::Internal(format!("update_cookies timed out for bot {bot_name}")))?
            .map_err(FluxError::from)
    }
}

impl MailClient for BotManager {
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

    async fn harness() -> Arc<BotManager> {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        BotManager::new(
            "master",
            Postman::new(),
            CfClient::new("https://example/{handle}/{from}/{count}"),
            CfSubmissionStore::new(db.clone()),
            BotStore::new(db.clone()),
            TxStore::new(db),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn refresh_with_more_bots_than_workers_assigns_ceil_per_worker() {
        let manager = harness().await;
        let bots = vec!["b1".into(), "b2".into(), "b3".into()];
        let workers = vec!["w1".into(), "w2".into()];
        manager.refresh(bots, workers).await;

        let state = manager.state.lock().await;
        assert_eq!(state.distribution.len(), 2);
        let total: usize = state.distribution.values().map(|e| e.bots.len()).sum();
        assert_eq!(total, 3);
        assert!(state.distribution.values().all(|e| e.bots.len() <= 2));
    }

    #[tokio::test]
    async fn sticky_placement_keeps_last_used_bot_on_same_worker() {
        let manager = harness().await;
        manager.refresh(vec!["b1".into(), "b2".into()], vec!["w1".into()]).await;
        {
            let mut state = manager.state.lock().await;
            state.distribution.get_mut("w1").unwrap().last_used_bot = Some("b2".into());
        }
        manager.refresh(vec!["b1".into(), "b2".into(), "b3".into()], vec!["w1".into(), "w2".into()]).await;

        let state = manager.state.lock().await;
        assert_eq!(state.distribution.get("w1").unwrap().bots[0], "b2");
    }

    #[tokio::test]
    async fn get_bot_round_robins_and_rejects_unknown_worker() {
        let manager = harness().await;
        manager.refresh(vec!["b1".into(), "b2".into()], vec!["w1".into()]).await;

        let first = manager.get_bot("w1").await.unwrap();
        let second = manager.get_bot("w1").await.unwrap();
        assert_ne!(first, second);

        let err = manager.get_bot("ghost").await.unwrap_err();
        assert!(matches!(err, FluxError::NotFound { .. }));
    }

    #[tokio::test]
    async fn zero_workers_clears_distribution() {
        let manager = harness().await;
        manager.refresh(vec!["b1".into()], vec!["w1".into()]).await;
        manager.refresh(vec!["b1".into()], vec![]).await;

        let state = manager.state.lock().await;
        assert!(state.distribution.is_empty());
    }
}
