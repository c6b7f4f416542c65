//! Engine supervision errors.
//!
//! Callers switch on these: `NotReady`, `HarnessNotStarted` and
//! `NoReadyInstance` are retryable conditions, the superblock and
//! never-started variants abort the current operation.

use std::path::PathBuf;

use thiserror::Error;

use strata_core::{ContextError, Rank};
use strata_drpc::DrpcError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine instance {0} is not ready")]
    NotReady(u32),

    #[error("engine harness not started")]
    HarnessNotStarted,

    #[error("engine harness already started")]
    HarnessStarted,

    #[error("no engine instance is ready")]
    NoReadyInstance,

    #[error("rank {rank} is started; stop it before resetting format")]
    InstanceStarted { rank: Rank },

    #[error("superblock not found at {} after format", .0.display())]
    SuperblockNotFound(PathBuf),

    #[error("invalid superblock at {}: {msg}", .path.display())]
    InvalidSuperblock { path: PathBuf, msg: String },

    #[error("superblock rank {existing} cannot change to {requested}")]
    RankMismatch { existing: Rank, requested: Rank },

    #[error("engine instance {0} was never started")]
    NeverStarted(u32),

    #[error("engine instance {0} has no rank")]
    NoRank(u32),

    #[error("engine instance {0} control loop is not running")]
    LoopStopped(u32),

    #[error("engine instance {0} control loop is already running")]
    LoopRunning(u32),

    #[error("engine exited before announcing readiness: {0}")]
    ExitedBeforeReady(String),

    #[error("failed to launch engine: {0}")]
    Launch(#[source] std::io::Error),

    #[error("engine process is not running")]
    ProcessNotRunning,

    #[error("failed to signal engine process: {0}")]
    Signal(#[source] std::io::Error),

    #[error("empty log masks in config")]
    EmptyLogMasks,

    #[error("join failed: {0}")]
    Join(String),

    #[error("{event} callback failed: {msg}")]
    Callback { event: &'static str, msg: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Drpc(DrpcError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    /// The context error, if the operation ended because its context finished.
    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            EngineError::Context(err) => Some(*err),
            EngineError::Drpc(err) => err.context_error(),
            _ => None,
        }
    }
}

// Context expiry inside a dRPC call surfaces as `EngineError::Context`.
impl From<DrpcError> for EngineError {
    fn from(err: DrpcError) -> Self {
        match err {
            DrpcError::Context(ctx) => EngineError::Context(ctx),
            other => EngineError::Drpc(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drpc_context_error_is_unwrapped() {
        let err = EngineError::from(DrpcError::Context(ContextError::Canceled));
        assert!(matches!(err, EngineError::Context(ContextError::Canceled)));
        assert_eq!(err.to_string(), "context canceled");
    }

    #[test]
    fn drpc_errors_keep_their_message() {
        let err = EngineError::from(DrpcError::NoResponse);
        assert_eq!(err.to_string(), "no response");
        assert_eq!(err.context_error(), None);
    }

    #[test]
    fn log_mask_message() {
        assert_eq!(EngineError::EmptyLogMasks.to_string(), "empty log masks in config");
    }
}
