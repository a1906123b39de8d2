//! Submission dispatch pipeline: the actor mesh that carries a queued
//! submission from `flux_queued` to a sink verdict.
//!
//! [`Postman`] is the name-based mailbox router every actor registers
//! with. [`Manager`] polls for unwatched submissions and spawns a
//! [`Watcher`] per submission; [`Master`] owns the worker fleet and
//! forwards submissions to whichever [`slave::WorkerAdapter`] has the
//! fewest in-flight requests; [`BotManager`] and [`BotMonitor`] own the
//! pool of third-party site accounts workers submit through and keep the
//! store reconciled with what the site reports; [`LoadMonitor`] feeds
//! Master's elasticity decisions.

pub mod bot_manager;
pub mod bot_monitor;
pub mod cf_client;
pub mod config;
pub mod intake;
pub mod load_monitor;
pub mod mail;
pub mod mailbox;
pub mod manager;
pub mod master;
pub mod postman;
pub mod slave;
pub mod status_manager;
pub mod watcher;

pub use bot_manager::{BotManager, BOT_MANAGER_MAIL_ID};
pub use bot_monitor::{bot_monitor_mail_id, BotMonitor};
pub use cf_client::{CfClient, CfClientError, CfSubStatus};
pub use config::FluxConfig;
pub use intake::{AlwaysAllowPractice, IntakeError, PracticeGateway, Submit, SubmitOutcome};
pub use load_monitor::LoadMonitor;
pub use mail::{Mail, MailBody, MailId};
pub use mailbox::Mailbox;
pub use manager::{Manager, MANAGER_MAIL_ID};
pub use master::{Master, MASTER_MAIL_ID};
pub use postman::{MailClient, Postman, PostmanError, POSTMAN_ID};
pub use slave::WorkerAdapter;
pub use status_manager::{
    CallerContext, Claims, ContestGateway, EvaluatedSubmission, NoContestsOngoing,
    SubmissionStatusManager,
};
pub use watcher::{watcher_mail_id, ProblemGateway, Watcher};
