//! # flux-store
//!
//! Typed, SQLite-backed persistence for the submission evaluation core.
//!
//! Provides a `Database` wrapper (WAL mode, mmap, a blocking `Connection`
//! behind a `Mutex`, every public operation routed through
//! `tokio::task::spawn_blocking`), a versioned migration engine, and three
//! typed stores over the `submissions`, `cf_submissions`, and `bots`
//! tables. [`transaction::Store`] bundles the cross-table operations
//! (linking a Codeforces result while advancing submission state; a bot
//! monitor's reconciliation batch) that must commit atomically.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  SubmissionStore / CfSubmissionStore /     │
//! │  BotStore            (typed queries)       │
//! ├───────────────────────────────────────────┤
//! │  transaction::Store   (cross-table atomics)│
//! ├───────────────────────────────────────────┤
//! │  Database (rusqlite WAL + mmap)            │
//! │  Migrations (versioned, transactional)     │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use flux_store::{Database, SubmissionStore, CfSubmissionStore, BotStore, transaction::Store};
//!
//! let db = Database::open_and_migrate("data/flux.db").await?;
//! let submissions = SubmissionStore::new(db.clone());
//! let cf_submissions = CfSubmissionStore::new(db.clone());
//! let bots = BotStore::new(db.clone());
//! let store = Store::new(db);
//! ```

pub mod bot_store;
pub mod cf_submission_store;
pub mod db;
pub mod error;
pub mod migration;
pub mod submission_store;
pub mod transaction;

// ── re-exports ───────────────────────────────────────────────────────

pub use bot_store::{Bot, BotStore};
pub use cf_submission_store::{CfSubmission, CfSubmissionStore};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use submission_store::{
    is_flux, is_legal_transition, is_sink, normalize_verdict, Submission, SubmissionStore,
    FLUX_FAILED, FLUX_QUEUED, SINK_STATES,
};
pub use transaction::Store;
