//! Shared types for member state and the cluster rank RPC surface.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::rank::{Rank, RankSet};

/// Externally reported state of a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    #[default]
    Unknown,
    /// Local storage is not formatted; waiting for an administrator.
    AwaitFormat,
    /// Process launched, setup handshake not finished.
    Starting,
    /// Setup handshake finished on the local node.
    Ready,
    /// Registered with the system membership.
    Joined,
    /// Stop requested, process still running.
    Stopping,
    Stopped,
    /// Removed from the group by the system.
    Excluded,
    /// Removed from the group by an administrator.
    AdminExcluded,
    /// Process exited with an error or a control call failed.
    Errored,
    /// The owning host did not answer.
    Unresponsive,
}

impl MemberState {
    pub const ALL: [MemberState; 11] = [
        MemberState::Unknown,
        MemberState::AwaitFormat,
        MemberState::Starting,
        MemberState::Ready,
        MemberState::Joined,
        MemberState::Stopping,
        MemberState::Stopped,
        MemberState::Excluded,
        MemberState::AdminExcluded,
        MemberState::Errored,
        MemberState::Unresponsive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemberState::Unknown => "Unknown",
            MemberState::AwaitFormat => "AwaitFormat",
            MemberState::Starting => "Starting",
            MemberState::Ready => "Ready",
            MemberState::Joined => "Joined",
            MemberState::Stopping => "Stopping",
            MemberState::Stopped => "Stopped",
            MemberState::Excluded => "Excluded",
            MemberState::AdminExcluded => "AdminExcluded",
            MemberState::Errored => "Errored",
            MemberState::Unresponsive => "Unresponsive",
        }
    }

    /// States in which the engine process is not running.
    pub fn is_down(&self) -> bool {
        matches!(
            self,
            MemberState::Stopped
                | MemberState::Errored
                | MemberState::Excluded
                | MemberState::AdminExcluded
                | MemberState::AwaitFormat
        )
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts the display name or its snake_case form, case-insensitively.
impl FromStr for MemberState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s.trim().chars().filter(|c| *c != '_').collect();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| format!("unknown member state {s:?}"))
    }
}

/// Per-rank outcome of one cluster operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberResult {
    pub rank: Rank,
    pub state: MemberState,
    #[serde(default)]
    pub errored: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub addr: String,
}

impl MemberResult {
    pub fn new(rank: Rank, state: MemberState) -> Self {
        Self {
            rank,
            state,
            errored: false,
            msg: String::new(),
            addr: String::new(),
        }
    }

    pub fn errored(rank: Rank, state: MemberState, msg: impl Into<String>) -> Self {
        Self {
            rank,
            state,
            errored: true,
            msg: msg.into(),
            addr: String::new(),
        }
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }
}

/// Cluster-wide rank operations dispatched by the fan-out coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankMethod {
    PingRanks,
    PrepShutdownRanks,
    StopRanks,
    StartRanks,
    ResetFormatRanks,
}

impl RankMethod {
    pub const ALL: [RankMethod; 5] = [
        RankMethod::PingRanks,
        RankMethod::PrepShutdownRanks,
        RankMethod::StopRanks,
        RankMethod::StartRanks,
        RankMethod::ResetFormatRanks,
    ];

    /// Route segment under the node control API (`/ranks/{segment}`).
    pub fn path_segment(&self) -> &'static str {
        match self {
            RankMethod::PingRanks => "ping",
            RankMethod::PrepShutdownRanks => "prep-shutdown",
            RankMethod::StopRanks => "stop",
            RankMethod::StartRanks => "start",
            RankMethod::ResetFormatRanks => "reset-format",
        }
    }

    pub fn from_path_segment(segment: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.path_segment() == segment)
    }

    /// Whether errored results still advance member state.
    pub fn update_on_fail(&self) -> bool {
        matches!(self, RankMethod::StopRanks | RankMethod::PrepShutdownRanks)
    }
}

impl fmt::Display for RankMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RankMethod::PingRanks => "PingRanks",
            RankMethod::PrepShutdownRanks => "PrepShutdownRanks",
            RankMethod::StopRanks => "StopRanks",
            RankMethod::StartRanks => "StartRanks",
            RankMethod::ResetFormatRanks => "ResetFormatRanks",
        };
        f.write_str(name)
    }
}

/// Per-host request carrying the subset of ranks owned by that host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RanksReq {
    pub ranks: RankSet,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RanksResp {
    pub results: Vec<MemberResult>,
}

/// Engine log mask update for the ranks on one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMasksReq {
    #[serde(default)]
    pub ranks: RankSet,
    #[serde(default)]
    pub masks: String,
    #[serde(default)]
    pub subsystems: String,
    /// Restore each engine's configured mask instead of applying `masks`.
    #[serde(default)]
    pub reset_masks: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMapEntry {
    pub rank: Rank,
    pub uri: String,
    #[serde(default)]
    pub incarnation: u64,
}

/// Rank-to-URI map pushed to engines whenever membership changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMap {
    pub version: u64,
    pub members: Vec<GroupMapEntry>,
}
