//! Crate-wide error taxonomy.
//!
//! [`FluxError`] is the single error type shared by every crate in the
//! workspace. Storage and transport adapters convert their own error types
//! into it at the crate boundary (see `flux-store::error::StoreError`'s
//! `From` impl) so call sites match on a concrete variant instead of an
//! opaque string.

use uuid::Uuid;

/// Unified error type for the Flux submission evaluation core.
#[derive(Debug, thiserror::Error)]
pub enum FluxError {
    /// Unexpected internal failure; not actionable by the caller.
    #[error("internal error: {0}")]
    Internal(String),

    /// The caller's request failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The referenced entity does not exist.
    #[error("not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    /// The caller is not authorized to perform the requested action.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A bulk operation completed for some but not all of its targets.
    #[error("partial result: {0}")]
    PartialResult(String),

    /// The entity being created already exists (unique-constraint violation).
    #[error("entity already exists: {0}")]
    EntityAlreadyExists(String),

    /// The email delivery service has been stopped.
    #[error("email service stopped")]
    EmailServiceStopped,

    /// A verification token has expired.
    #[error("verification token expired")]
    VerificationTokenExpired,

    /// A verification token is malformed or cannot be decoded.
    #[error("corrupted verification token")]
    CorruptedVerification,

    /// A downstream HTTP call returned an unexpected response.
    #[error("http response error: {0}")]
    HttpResponse(String),

    /// The third-party site rejected or failed a submission.
    #[error("submission failed: {0}")]
    SubmissionFailed(String),

    /// The scheduler could not launch a task after exhausting retries.
    #[error("task launch error: {task_id}: {reason}")]
    TaskLaunchError { task_id: Uuid, reason: String },

    /// A task failed to terminate after a SIGTERM grace window.
    #[error("task {task_id} did not terminate after SIGTERM")]
    TaskSigterm { task_id: Uuid },

    /// A task had to be force-killed (SIGKILL).
    #[error("task {task_id} was force-killed")]
    TaskKill { task_id: Uuid },

    /// A long-lived component failed to start.
    #[error("component start error: {component}: {reason}")]
    ComponentStart { component: String, reason: String },

    /// A background monitor failed to start.
    #[error("monitor start error: {monitor}: {reason}")]
    MonitorStart { monitor: String, reason: String },

    /// Internal-bug sentinel: a process handle's `wait` was invoked twice.
    #[error("wait already called for task {task_id}")]
    WaitAlreadyCalled { task_id: Uuid },
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, FluxError>;
