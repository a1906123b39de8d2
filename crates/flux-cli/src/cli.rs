//! CLI argument definitions for flux.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use clap::{Parser, Subcommand};

/// flux -- submission evaluation core and third-party-site dispatch pipeline.
#[derive(Parser)]
#[command(
    name = "flux",
    version,
    about = "Submission evaluation core: resource-aware scheduler plus the Nyx dispatch pipeline"
)]
pub struct Cli {
    /// Path to a TOML configuration file. Missing is not an error; built-in
    /// defaults and `FLUX_*` environment variables still apply.
    #[arg(long, global = true, default_value = "flux.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open and migrate the store, wire every actor together, and run until
    /// a shutdown signal arrives.
    Serve,

    /// Show configuration and store status without starting the dispatch
    /// pipeline.
    Status,

    /// Apply pending schema migrations and exit.
    Migrate,

    /// Submit a solution directly against the store, bypassing the HTTP
    /// boundary -- for smoke-testing a running deployment.
    Submit {
        /// Submitting user's identity.
        #[arg(long)]
        user: String,

        /// Problem identifier.
        #[arg(long)]
        problem: String,

        /// Contest identifier, if submitting within a contest.
        #[arg(long)]
        contest: Option<String>,

        /// Source language (e.g. `cpp17`, `java`, `python3`).
        #[arg(long)]
        language: String,

        /// Path to the solution source file.
        #[arg(long)]
        file: String,
    },
}
