//! Layered configuration: defaults → optional TOML file → environment
//! variable overrides, in the manner of the teacher's `load_bot_config`.

use std::time::Duration;

/// Every tunable the scheduler, store, and dispatch pipeline need at
/// startup.
#[derive(Debug, Clone)]
pub struct FluxConfig {
    /// SQLite database file path.
    pub db_path: String,

    /// Scheduler's fixed resource budget.
    pub scheduler_cpu_budget: u32,
    pub scheduler_memory_budget: u32,
    /// Scheduler's task-queue channel capacity.
    pub scheduler_queue_capacity: usize,

    /// Manager's DB-poll interval.
    pub manager_poll_interval: Duration,

    /// Load Monitor's EWMA tick periods.
    pub load_rate_tick: Duration,
    pub load_duration_tick: Duration,
    pub load_report_tick: Duration,

    /// Bot Monitor's tick interval and how long past `endLife` it waits
    /// before reporting itself stopped.
    pub bot_monitor_tick: Duration,
    pub bot_monitor_stop_grace: Duration,

    /// Master's own bot-list refresh cadence.
    pub master_bot_refresh_interval: Duration,
    /// Resources reserved per worker child process.
    pub worker_cpu_reservation: u32,
    pub worker_memory_reservation: u32,
    /// Readiness-poll cadence and overall cap while waiting for a newly
    /// launched worker to write its rendezvous file.
    pub worker_readiness_poll_interval: Duration,
    pub worker_readiness_poll_cap: Duration,

    /// The third-party site's submission-listing query URL template
    /// (`{handle}`, `{from}`, `{count}` placeholders).
    pub site_query_url_template: String,

    /// Path to the nyx worker binary, and any extra args to pass it.
    pub worker_binary_path: String,
    pub worker_binary_args: Vec<String>,

    /// Worker TCP dial/read/write deadlines.
    pub worker_dial_timeout: Duration,
    pub worker_read_timeout: Duration,
    pub worker_write_timeout: Duration,

    /// Root directory for rendezvous files and solution scratch files.
    pub scratch_dir: String,
}

impl Default for FluxConfig {
    fn default() -> Self {
        Self {
            db_path: "data/flux.db".to_string(),
            scheduler_cpu_budget: 800,
            scheduler_memory_budget: 8000,
            scheduler_queue_capacity: 256,
            manager_poll_interval: Duration::from_secs(5),
            load_rate_tick: Duration::from_secs(60),
            load_duration_tick: Duration::from_millis(5),
            load_report_tick: Duration::from_secs(30),
            bot_monitor_tick: Duration::from_secs(5),
            bot_monitor_stop_grace: Duration::from_secs(300),
            master_bot_refresh_interval: Duration::from_secs(30),
            worker_cpu_reservation: 180,
            worker_memory_reservation: 800,
            worker_readiness_poll_interval: Duration::from_secs(5),
            worker_readiness_poll_cap: Duration::from_secs(60),
            site_query_url_template:
                "https://codeforces.com/api/user.status?handle={handle}&from={from}&count={count}"
                    .to_string(),
            worker_binary_path: "./nyx-worker".to_string(),
            worker_binary_args: Vec::new(),
            worker_dial_timeout: Duration::from_secs(5),
            worker_read_timeout: Duration::from_secs(90),
            worker_write_timeout: Duration::from_secs(5),
            scratch_dir: "/tmp/flux".to_string(),
        }
    }
}

impl FluxConfig {
    /// Loads config layered: built-in defaults, then an optional TOML file
    /// at `path` (missing file is not an error), then `FLUX_*` environment
    /// variable overrides.
    pub fn load(path: impl AsRef<std::path::Path>) -> Self {
        let mut config = Self::default();
        config.apply_toml_file(path.as_ref());
        config.apply_env();
        config
    }

    fn apply_toml_file(&mut self, path: &std::path::Path) {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return,
        };
        let table: toml::Table = match content.parse() {
            Ok(t) => t,
            Err(_) => return,
        };

        macro_rules! str_field {
            ($field:ident) => {
                if let Some(v) = table.get(stringify!($field)).and_then(|v| v.as_str()) {
                    self.$field = v.to_string();
                }
            };
        }
        macro_rules! u32_field {
            ($field:ident) => {
                if let Some(v) = table.get(stringify!($field)).and_then(|v| v.as_integer()) {
                    self.$field = v.max(0) as u32;
                }
            };
        }
        macro_rules! secs_field {
            ($field:ident) => {
                if let Some(v) = table.get(stringify!($field)).and_then(|v| v.as_integer()) {
                    self.$field = Duration::from_secs(v.max(0) as u64);
                }
            };
        }

        str_field!(db_path);
        u32_field!(scheduler_cpu_budget);
        u32_field!(scheduler_memory_budget);
        if let Some(v) = table.get("scheduler_queue_capacity").and_then(|v| v.as_integer()) {
            self.scheduler_queue_capacity = v.max(0) as usize;
        }
        secs_field!(manager_poll_interval);
        secs_field!(load_rate_tick);
        secs_field!(load_report_tick);
        secs_field!(bot_monitor_tick);
        secs_field!(bot_monitor_stop_grace);
        secs_field!(master_bot_refresh_interval);
        u32_field!(worker_cpu_reservation);
        u32_field!(worker_memory_reservation);
        secs_field!(worker_readiness_poll_interval);
        secs_field!(worker_readiness_poll_cap);
        str_field!(site_query_url_template);
        str_field!(worker_binary_path);
        secs_field!(worker_dial_timeout);
        secs_field!(worker_read_timeout);
        secs_field!(worker_write_timeout);
        str_field!(scratch_dir);

        if let Some(args) = table.get("worker_binary_args").and_then(|v| v.as_array()) {
            self.worker_binary_args = args
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("FLUX_DB_PATH") {
            self.db_path = v;
        }
        if let Ok(v) = std::env::var("FLUX_SCHEDULER_CPU_BUDGET") {
            if let Ok(v) = v.parse() {
                self.scheduler_cpu_budget = v;
            }
        }
        if let Ok(v) = std::env::var("FLUX_SCHEDULER_MEMORY_BUDGET") {
            if let Ok(v) = v.parse() {
                self.scheduler_memory_budget = v;
            }
        }
        if let Ok(v) = std::env::var("FLUX_MANAGER_POLL_INTERVAL_SECS") {
            if let Ok(v) = v.parse::<u64>() {
                self.manager_poll_interval = Duration::from_secs(v);
            }
        }
        if let Ok(v) = std::env::var("FLUX_WORKER_BINARY_PATH") {
            self.worker_binary_path = v;
        }
        if let Ok(v) = std::env::var("FLUX_SCRATCH_DIR") {
            self.scratch_dir = v;
        }
        if let Ok(v) = std::env::var("FLUX_SITE_QUERY_URL_TEMPLATE") {
            self.site_query_url_template = v;
        }
    }
}
