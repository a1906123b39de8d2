//! flux: resource-aware submission evaluation core.
//!
//! Wires the scheduler, the store, and every Nyx actor together, then runs
//! until a shutdown signal arrives. See [`cli`] for the subcommands.

mod cli;
mod problem_gateway;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Commands};
use flux_kernel::{Resources, Scheduler};
use flux_nyx::{
    AlwaysAllowPractice, BotManager, CallerContext, CfClient, Claims, FluxConfig, LoadMonitor,
    Manager, Master, NoContestsOngoing, Postman, Submit, SubmissionStatusManager, MASTER_MAIL_ID,
};
use flux_store::transaction::Store as TxStore;
use flux_store::{BotStore, CfSubmissionStore, Database, SubmissionStore};
use problem_gateway::IdentityProblemGateway;
use tracing_subscriber::EnvFilter;

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => cmd_serve(&cli.config).await,
        Commands::Status => cmd_status(&cli.config).await,
        Commands::Migrate => cmd_migrate(&cli.config).await,
        Commands::Submit { user, problem, contest, language, file } => {
            cmd_submit(&cli.config, user, problem, contest, language, file).await
        }
    }
}

struct Pipeline {
    manager: Arc<Manager>,
    master: Arc<Master>,
    bot_manager: Arc<BotManager>,
    load_monitor: Arc<LoadMonitor>,
    submit: Submit,
}

/// Builds every long-lived component and registers the statically-known
/// actors with the Postman, but does not start any background loop yet.
async fn build_pipeline(config: &FluxConfig) -> anyhow::Result<Pipeline> {
    if let Some(parent) = Path::new(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open_and_migrate(config.db_path.clone()).await?;

    let submissions = SubmissionStore::new(db.clone());
    let cf_submissions = CfSubmissionStore::new(db.clone());
    let bots = BotStore::new(db.clone());
    let tx_store = TxStore::new(db.clone());

    let postman = Postman::new();
    let scheduler = Arc::new(Scheduler::new(
        Resources::new(config.scheduler_cpu_budget, config.scheduler_memory_budget),
        config.scheduler_queue_capacity,
    ));
    scheduler.start();

    let contests = Arc::new(NoContestsOngoing);
    let problems = Arc::new(IdentityProblemGateway);
    let status = SubmissionStatusManager::new(submissions.clone(), cf_submissions.clone(), contests.clone());

    let load_monitor = LoadMonitor::new(
        MASTER_MAIL_ID,
        postman.clone(),
        config.load_rate_tick,
        config.load_report_tick,
    );

    let bot_manager = BotManager::new(
        MASTER_MAIL_ID,
        postman.clone(),
        CfClient::new(config.site_query_url_template.clone()),
        cf_submissions,
        bots.clone(),
        tx_store.clone(),
        config.bot_monitor_tick,
        config.bot_monitor_stop_grace,
    );

    let master = Master::new(
        postman.clone(),
        scheduler,
        bot_manager.clone(),
        load_monitor.clone(),
        bots,
        config.worker_binary_path.clone(),
        config.worker_binary_args.clone(),
        config.scratch_dir.clone(),
        Resources::new(config.worker_cpu_reservation, config.worker_memory_reservation),
        config.worker_dial_timeout,
        config.worker_read_timeout,
        config.worker_write_timeout,
        config.worker_readiness_poll_interval,
        config.worker_readiness_poll_cap,
        config.master_bot_refresh_interval,
    );

    let manager = Manager::new(
        MASTER_MAIL_ID,
        postman.clone(),
        status,
        tx_store,
        submissions.clone(),
        problems.clone(),
        config.manager_poll_interval,
    );

    let submit = Submit::new(submissions, problems, contests, Arc::new(AlwaysAllowPractice), postman);

    Ok(Pipeline { manager, master, bot_manager, load_monitor, submit })
}

async fn cmd_serve(config_path: &str) -> anyhow::Result<()> {
    init_tracing("info");
    let config = FluxConfig::load(config_path);
    let pipeline = build_pipeline(&config).await?;

    pipeline.master.clone().start();
    pipeline.bot_manager.clone().start();
    pipeline.load_monitor.clone().start(now_millis);
    pipeline.manager.clone().start();

    tracing::info!("flux is running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping");
    pipeline.manager.stop();

    Ok(())
}

async fn cmd_status(config_path: &str) -> anyhow::Result<()> {
    init_tracing("warn");
    let config = FluxConfig::load(config_path);

    println!();
    println!("  Flux Status");
    println!("  ===========");
    println!();

    let db_path = Path::new(&config.db_path);
    if db_path.exists() {
        println!("  Store:            OK ({})", config.db_path);
    } else {
        println!("  Store:            MISSING (run `flux migrate`)");
    }

    let worker_path = Path::new(&config.worker_binary_path);
    if worker_path.exists() {
        println!("  Worker binary:    OK ({})", config.worker_binary_path);
    } else {
        println!("  Worker binary:    MISSING ({})", config.worker_binary_path);
    }

    println!(
        "  Scheduler budget: {} cpu / {} memory",
        config.scheduler_cpu_budget, config.scheduler_memory_budget
    );
    println!();

    Ok(())
}

async fn cmd_migrate(config_path: &str) -> anyhow::Result<()> {
    init_tracing("info");
    let config = FluxConfig::load(config_path);
    if let Some(parent) = Path::new(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _db = Database::open_and_migrate(config.db_path.clone()).await?;
    println!("store migrated: {}", config.db_path);
    Ok(())
}

async fn cmd_submit(
    config_path: &str,
    user: String,
    problem: String,
    contest: Option<String>,
    language: String,
    file: String,
) -> anyhow::Result<()> {
    init_tracing("info");
    let config = FluxConfig::load(config_path);

    if !Path::new(&config.db_path).exists() {
        eprintln!("store not found at {} (run `flux migrate` first)", config.db_path);
        std::process::exit(1);
    }

    let pipeline = build_pipeline(&config).await?;
    let source = std::fs::read_to_string(&file)?;

    let mut solution = std::collections::HashMap::new();
    solution.insert("language".to_string(), language);
    solution.insert("source".to_string(), source);

    let ctx = CallerContext::External(Claims { subject: user });
    let outcome = pipeline.submit.submit(&ctx, problem, contest, solution).await?;
    println!("submission accepted: {}", outcome.submission_id);

    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}
