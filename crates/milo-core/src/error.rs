//! Unified error types for Milo report dispatch.

use thiserror::Error;

/// Result type alias using MiloError.
pub type Result<T> = std::result::Result<T, MiloError>;

/// Which step of a delivery an error (or a timeout) happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Connect,
    Authenticate,
    Send,
    Render,
}

impl std::fmt::Display for DispatchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchPhase::Connect => write!(f, "connect"),
            DispatchPhase::Authenticate => write!(f, "authenticate"),
            DispatchPhase::Send => write!(f, "send"),
            DispatchPhase::Render => write!(f, "render"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MiloError {
    // Transport errors
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Timeout during {phase} after {secs}s")]
    Timeout { phase: DispatchPhase, secs: u64 },

    // Content errors
    #[error("Render error: {0}")]
    Render(String),

    // Scheduling errors
    #[error("Scheduler tick error: {0}")]
    SchedulerTick(String),

    #[error("Dispatch already in progress for report '{0}'")]
    DispatchInProgress(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MiloError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn send(msg: impl Into<String>) -> Self {
        Self::Send(msg.into())
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn timeout(phase: DispatchPhase, limit: std::time::Duration) -> Self {
        Self::Timeout {
            phase,
            secs: limit.as_secs(),
        }
    }

    /// Whether this error aborts a whole batch rather than a single recipient.
    /// Timeouts are classified by the phase they happened in.
    pub fn is_fatal_to_batch(&self) -> bool {
        match self {
            MiloError::Connection(_) | MiloError::Auth(_) | MiloError::Config(_) => true,
            MiloError::Timeout { phase, .. } => {
                matches!(phase, DispatchPhase::Connect | DispatchPhase::Authenticate)
            }
            _ => false,
        }
    }
}
