//! Error types for cluster operations.

use thiserror::Error;
use uuid::Uuid;

use strata_core::{ContextError, MemberResult, Rank, RankSet};
use strata_state::StateError;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("request may list hosts or ranks, not both")]
    HostsAndRanks,

    #[error("request method not set")]
    MissingMethod,

    #[error("full system request must not list hosts or ranks")]
    FullSystemFiltered,

    #[error("rank {0} is not a system member")]
    UnknownRank(Rank),

    #[error("rank {rank} belongs to uuid {existing}")]
    RankInUse { rank: Rank, existing: Uuid },

    #[error("uuid {uuid} already joined as rank {existing}, not rank {requested}")]
    RankMismatch {
        uuid: Uuid,
        existing: Rank,
        requested: Rank,
    },

    #[error("no free rank left")]
    NoFreeRank,

    #[error("prep shutdown failed on ranks {ranks}; stop aborted")]
    StopFailed {
        ranks: RankSet,
        results: Vec<MemberResult>,
    },

    /// The host could not be reached or did not answer in time.
    #[error("host {addr}: {msg}")]
    Transport { addr: String, msg: String },

    /// The host answered with an error.
    #[error("host {addr} returned error: {msg}")]
    Remote { addr: String, msg: String },

    #[error("encode request: {0}")]
    Encode(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl ClusterError {
    pub fn transport(addr: &str, err: impl std::fmt::Display) -> Self {
        ClusterError::Transport {
            addr: addr.to_string(),
            msg: err.to_string(),
        }
    }

    pub fn remote(addr: &str, msg: impl Into<String>) -> Self {
        ClusterError::Remote {
            addr: addr.to_string(),
            msg: msg.into(),
        }
    }

    /// Errors rejected before anything was dispatched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ClusterError::HostsAndRanks
                | ClusterError::MissingMethod
                | ClusterError::FullSystemFiltered
                | ClusterError::UnknownRank(_)
                | ClusterError::RankInUse { .. }
                | ClusterError::RankMismatch { .. }
        )
    }
}
