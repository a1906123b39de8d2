//! Load monitor (§4.11): submission-rate and submission-duration EWMAs,
//! reported to Master on a fixed cadence for elasticity decisions.
//!
//! Three independent tasks share one `Mutex`-guarded state block, matching
//! the scheduler's own "one lock, a handful of cooperating loops" shape.

use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::mail::{Mail, MailBody, MailId, PRIORITY_LOAD_REPORT};
use crate::postman::Postman;

/// EWMA rate coefficients: new average gets 45% weight, the fresh count 55%.
const RATE_OLD_WEIGHT: f64 = 0.45;
const RATE_NEW_WEIGHT: f64 = 0.55;
/// Duration EWMA time constant.
const DURATION_TAU_MILLIS: f64 = 15_000.0;
const DURATION_DELTA_FLOOR_MILLIS: f64 = 5.0;

struct State {
    /// Arrival timestamps (millis) within the last rate window, oldest first.
    arrivals: BinaryHeap<Reverse<i64>>,
    avg_load: f64,
    avg_sub_t_millis: f64,
    last_sample_millis: Option<i64>,
}

pub struct LoadMonitor {
    master_mail_id: MailId,
    postman: Postman,
    state: AsyncMutex<State>,
    rate_tick: Duration,
    duration_settle: Duration,
    report_tick: Duration,
    rate_window_millis: i64,
}

impl LoadMonitor {
    pub fn new(
        master_mail_id: impl Into<MailId>,
        postman: Postman,
        rate_tick: Duration,
        report_tick: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            master_mail_id: master_mail_id.into(),
            postman,
            state: AsyncMutex::new(State {
                arrivals: BinaryHeap::new(),
                avg_load: 0.0,
                avg_sub_t_millis: 0.0,
                last_sample_millis: None,
            }),
            rate_tick,
            duration_settle: Duration::from_millis(5),
            report_tick,
            rate_window_millis: rate_tick.as_millis() as i64,
        })
    }

    /// Records a submission arrival (a `CfSubRequest` was handed to a
    /// worker), contributing to the next rate tick's count.
    pub async fn record_arrival(&self, now_millis: i64) {
        self.state.lock().await.arrivals.push(Reverse(now_millis));
    }

    /// Records a completed submission's duration, feeding the duration EWMA.
    pub async fn record_duration(&self, duration_millis: i64, sample_time_millis: i64) {
        let mut state = self.state.lock().await;
        let delta = match state.last_sample_millis {
            Some(prev) => (sample_time_millis - prev) as f64,
            None => DURATION_TAU_MILLIS,
        };
        let delta = if delta <= 0.0 { DURATION_DELTA_FLOOR_MILLIS } else { delta };
        let alpha = (-delta / DURATION_TAU_MILLIS).exp();
        state.avg_sub_t_millis = alpha * state.avg_sub_t_millis + (1.0 - alpha) * duration_millis as f64;
        state.last_sample_millis = Some(sample_time_millis);
    }

    pub fn start(self: Arc<Self>, now_millis: impl Fn() -> i64 + Send + Sync + 'static) -> [JoinHandle<()>; 2] {
        let now_millis = Arc::new(now_millis);
        let rate_task = {
            let this = self.clone();
            let now_millis = now_millis.clone();
            tokio::spawn(async move { this.run_rate_tick(now_millis).await })
        };
        let report_task = {
            let this = self.clone();
            tokio::spawn(async move { this.run_report_tick().await })
        };
        [rate_task, report_task]
    }

    async fn run_rate_tick(self: Arc<Self>, now_millis: Arc<dyn Fn() -> i64 + Send + Sync>) {
        loop {
            tokio::time::sleep(self.rate_tick).await;
            let now = now_millis();
            let window_start = now - self.rate_window_millis;

            let mut state = self.state.lock().await;
            while let Some(Reverse(oldest)) = state.arrivals.peek() {
                if *oldest < window_start {
                    state.arrivals.pop();
                } else {
                    break;
                }
            }
            let current_count = state.arrivals.len() as f64;
            state.avg_load = RATE_OLD_WEIGHT * state.avg_load + RATE_NEW_WEIGHT * current_count;
            debug!(avg_load = state.avg_load, "load monitor rate tick");
        }
    }

    async fn run_report_tick(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.report_tick).await;
            let (avg_load, avg_sub_t_millis) = {
                let state = self.state.lock().await;
                (state.avg_load, state.avg_sub_t_millis)
            };
            self.postman.route(Mail::new(
                "load_monitor",
                self.master_mail_id.clone(),
                MailBody::LoadReport(crate::mail::LoadReport {
                    avg_load,
                    avg_sub_t_millis,
                }),
                PRIORITY_LOAD_REPORT,
            ));
        }
    }

    #[cfg(test)]
    async fn snapshot(&self) -> (f64, f64) {
        let state = self.state.lock().await;
        (state.avg_load, state.avg_sub_t_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use crate::postman::MailClient;

    struct Recorder {
        received: StdMutex<Vec<Mail>>,
    }
    impl MailClient for Recorder {
        fn receive(&self, mail: Mail) {
            self.received.lock().unwrap().push(mail);
        }
    }

    #[tokio::test]
    async fn rate_ewma_counts_within_window_only() {
        let postman = Postman::new();
        let master = Arc::new(Recorder { received: StdMutex::new(Vec::new()) });
        postman.register("master", master.clone()).unwrap();

        let monitor = LoadMonitor::new("master", postman, Duration::from_millis(30), Duration::from_secs(3600));
        monitor.record_arrival(1_000).await;
        monitor.record_arrival(1_500).await;
        monitor.record_arrival(900_000).await; // far outside the window once ticked at a later "now"

        let clock = std::sync::Arc::new(std::sync::atomic::AtomicI64::new(1_600));
        let clock_clone = clock.clone();
        monitor.clone().start(move || clock_clone.load(std::sync::atomic::Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let (avg_load, _) = monitor.snapshot().await;
        assert!(avg_load > 0.0);
        let _ = clock;
    }

    #[tokio::test]
    async fn duration_ewma_moves_toward_new_sample() {
        let postman = Postman::new();
        let monitor = LoadMonitor::new("master", postman, Duration::from_secs(3600), Duration::from_secs(3600));

        monitor.record_duration(1_000, 0).await;
        monitor.record_duration(1_000, 15_000).await;
        let (_, avg_sub_t) = monitor.snapshot().await;
        assert!(avg_sub_t > 0.0);
    }

    #[tokio::test]
    async fn report_tick_posts_load_report_to_master() {
        let postman = Postman::new();
        let master = Arc::new(Recorder { received: StdMutex::new(Vec::new()) });
        postman.register("master", master.clone()).unwrap();

        let monitor = LoadMonitor::new("master", postman, Duration::from_secs(3600), Duration::from_millis(20));
        monitor.clone().start(|| 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let received = master.received.lock().unwrap();
        assert!(received.iter().any(|m| matches!(m.body, MailBody::LoadReport(_))));
    }
}
