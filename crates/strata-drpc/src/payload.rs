//! Typed request and reply bodies.
//!
//! Every request type names its method and may declare a retry policy for
//! specific remote status codes. Engine replies carry a signed status
//! (`0` success, negative error numbers otherwise).

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::message::Method;

/// Engine is busy; retry later.
pub const ERR_BUSY: i32 = -1012;
/// Group map version mismatch; retry once the engine catches up.
pub const ERR_GRPVER: i32 = -1016;
/// Transient engine-side failure.
pub const ERR_AGAIN: i32 = -1026;

/// Remote status codes that cause a resubmit, and the wait between tries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_on: Vec<i32>,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn should_retry(&self, status: i32) -> bool {
        self.retry_on.contains(&status)
    }
}

/// Reply types expose the engine's status code.
pub trait RemoteStatus {
    fn status(&self) -> i32;
}

pub trait DrpcRequest: Serialize + Send + Sync {
    const METHOD: Method;
    type Reply: DeserializeOwned + RemoteStatus + Send;

    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

/// Generic engine reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineResp {
    pub status: i32,
}

impl RemoteStatus for EngineResp {
    fn status(&self) -> i32 {
        self.status
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRankReq {
    pub rank: u32,
    pub map_version: u64,
}

impl DrpcRequest for SetRankReq {
    const METHOD: Method = Method::SetRank;
    type Reply = EngineResp;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetUpReq {}

impl DrpcRequest for SetUpReq {
    const METHOD: Method = Method::SetUp;
    type Reply = EngineResp;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepShutdownReq {
    pub rank: u32,
}

impl DrpcRequest for PrepShutdownReq {
    const METHOD: Method = Method::PrepShutdown;
    type Reply = EngineResp;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRankReq {
    pub rank: u32,
}

impl DrpcRequest for PingRankReq {
    const METHOD: Method = Method::PingRank;
    type Reply = EngineResp;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub rank: u32,
    pub uri: String,
    pub incarnation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupUpdateReq {
    pub members: Vec<GroupMember>,
    pub map_version: u64,
}

impl DrpcRequest for GroupUpdateReq {
    const METHOD: Method = Method::GroupUpdate;
    type Reply = EngineResp;

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(RetryPolicy {
            retry_on: vec![ERR_BUSY, ERR_AGAIN, ERR_GRPVER],
            backoff: Duration::from_millis(250),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetLogMasksReq {
    pub masks: String,
    #[serde(default)]
    pub subsystems: String,
}

impl DrpcRequest for SetLogMasksReq {
    const METHOD: Method = Method::SetLogMasks;
    type Reply = EngineResp;
}

/// Sent by a freshly launched engine once its own dRPC socket is listening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyReadyReq {
    pub instance_idx: u32,
    pub drpc_socket: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub incarnation: u64,
}

impl DrpcRequest for NotifyReadyReq {
    const METHOD: Method = Method::NotifyReady;
    type Reply = EngineResp;
}
