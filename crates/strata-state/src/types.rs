//! Persisted member record.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use strata_core::{MemberResult, MemberState, Rank};

/// One rank's entry in the system membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub rank: Rank,
    /// Engine identity from its superblock.
    pub uuid: Uuid,
    /// Control address of the owning host (`host:port`).
    pub addr: String,
    /// Engine fabric URI.
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub fault_domain: String,
    pub state: MemberState,
    /// Last error or status message.
    #[serde(default)]
    pub info: String,
    /// Incremented each time the rank (re)joins.
    #[serde(default)]
    pub incarnation: u64,
}

impl Member {
    pub fn new(rank: Rank, uuid: Uuid, addr: impl Into<String>, state: MemberState) -> Self {
        Self {
            rank,
            uuid,
            addr: addr.into(),
            uri: String::new(),
            fault_domain: String::new(),
            state,
            info: String::new(),
            incarnation: 0,
        }
    }

    /// Snapshot as a result record, e.g. for membership queries.
    pub fn to_result(&self) -> MemberResult {
        MemberResult {
            rank: self.rank,
            state: self.state,
            errored: false,
            msg: self.info.clone(),
            addr: self.addr.clone(),
        }
    }
}
