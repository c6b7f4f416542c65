//! dRPC error taxonomy.
//!
//! Callers switch on these variants: `DataPlaneNotStarted` means the
//! engine has not created its socket yet, `Transport` is a temporary
//! connection problem, the remaining variants are protocol violations or
//! remote failures. Context expiry is carried through unchanged.

use std::path::PathBuf;

use thiserror::Error;

use strata_core::ContextError;

use crate::message::{Method, Status};

pub type DrpcResult<T> = Result<T, DrpcError>;

#[derive(Debug, Error)]
pub enum DrpcError {
    #[error("data plane not started (no socket at {})", .0.display())]
    DataPlaneNotStarted(PathBuf),

    #[error("dRPC transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error("no response")]
    NoResponse,

    #[error("bad status: {0}")]
    BadStatus(Status),

    #[error("unknown response status {0}")]
    UnknownStatus(i32),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("{method} failed with remote status {status}")]
    Remote { method: Method, status: i32 },

    #[error("no handler registered for {0}")]
    UnknownMethod(Method),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl DrpcError {
    /// The context error, if the call ended because its context finished.
    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            DrpcError::Context(err) => Some(*err),
            _ => None,
        }
    }
}
