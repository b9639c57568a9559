//! Crate-wide error type.
//!
//! A single typed enum covers every error kind the core can raise: one
//! `thiserror`-derived enum with a machine-readable `code()` accessor plus a
//! human-readable message, rather than a scatter of `anyhow::Error` call sites.

/// All errors raised by the auto-tune and RLHF engines, categorized by kind.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TuneError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("tuner is already running")]
    AlreadyRunning,

    #[error("required collaborator not configured: {0}")]
    NotConfigured(String),

    #[error("sweep runner failed: {0}")]
    RunnerFailure(String),

    #[error("label deadline expired")]
    LabelDeadlineExpired,

    #[error("sweep deadline exceeded")]
    SweepDeadlineExceeded,

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("persistence error: {0}")]
    PersistenceError(String),
}

impl TuneError {
    /// Stable machine-readable code, for callers that want to match on error
    /// kind without parsing the display string.
    pub fn code(&self) -> &'static str {
        match self {
            TuneError::InvalidRequest(_) => "INVALID_REQUEST",
            TuneError::AlreadyRunning => "ALREADY_RUNNING",
            TuneError::NotConfigured(_) => "NOT_CONFIGURED",
            TuneError::RunnerFailure(_) => "RUNNER_FAILURE",
            TuneError::LabelDeadlineExpired => "LABEL_DEADLINE_EXPIRED",
            TuneError::SweepDeadlineExceeded => "SWEEP_DEADLINE_EXCEEDED",
            TuneError::Cancelled(_) => "CANCELLED",
            TuneError::PersistenceError(_) => "PERSISTENCE_ERROR",
        }
    }
}
