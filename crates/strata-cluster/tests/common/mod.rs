//! Scripted host transport and a seeded membership.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use uuid::Uuid;

use strata_cluster::{
    ClusterError, ClusterResult, Coordinator, EventBus, HostInvoker, JoinRequest, Membership,
};
use strata_core::{
    Context, GroupMap, MemberResult, MemberState, Rank, RankMethod, RanksReq, RanksResp,
};
use strata_state::StateStore;

pub const HOST_A: &str = "a:10001";
pub const HOST_B: &str = "b:10001";

pub enum Outcome {
    Reply(Vec<MemberResult>),
    Unreachable,
    Remote(&'static str),
    Hang,
}

type Script = Box<dyn Fn(RankMethod, &RanksReq) -> Outcome + Send + Sync>;

/// Hosts answer from their script, or report the method's success state
/// for every requested rank.
#[derive(Default)]
pub struct FakeHosts {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<(String, RankMethod, RanksReq)>>,
    pushed: Mutex<Vec<(String, u64)>>,
}

impl FakeHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(
        mut self,
        addr: &str,
        f: impl Fn(RankMethod, &RanksReq) -> Outcome + Send + Sync + 'static,
    ) -> Self {
        self.scripts.insert(addr.to_string(), Box::new(f));
        self
    }

    pub fn calls(&self) -> Vec<(String, RankMethod, RanksReq)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn pushed(&self) -> Vec<(String, u64)> {
        self.pushed.lock().unwrap().clone()
    }
}

pub fn success_state(method: RankMethod) -> MemberState {
    match method {
        RankMethod::PingRanks => MemberState::Joined,
        RankMethod::PrepShutdownRanks => MemberState::Stopping,
        RankMethod::StopRanks => MemberState::Stopped,
        RankMethod::StartRanks => MemberState::Ready,
        RankMethod::ResetFormatRanks => MemberState::AwaitFormat,
    }
}

pub fn all_succeed(method: RankMethod, req: &RanksReq) -> Vec<MemberResult> {
    req.ranks
        .iter()
        .map(|rank| MemberResult::new(rank, success_state(method)))
        .collect()
}

impl HostInvoker for FakeHosts {
    fn invoke<'a>(
        &'a self,
        ctx: &'a Context,
        addr: &'a str,
        method: RankMethod,
        req: &'a RanksReq,
    ) -> BoxFuture<'a, ClusterResult<RanksResp>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((addr.to_string(), method, req.clone()));
            let outcome = match self.scripts.get(addr) {
                Some(script) => script(method, req),
                None => Outcome::Reply(all_succeed(method, req)),
            };
            match outcome {
                Outcome::Reply(results) => Ok(RanksResp { results }),
                Outcome::Unreachable => Err(ClusterError::transport(addr, "connection refused")),
                Outcome::Remote(msg) => Err(ClusterError::remote(addr, msg)),
                Outcome::Hang => Err(ClusterError::Context(ctx.done().await)),
            }
        })
    }

    fn group_update<'a>(
        &'a self,
        _ctx: &'a Context,
        addr: &'a str,
        map: &'a GroupMap,
    ) -> BoxFuture<'a, ClusterResult<()>> {
        Box::pin(async move {
            self.pushed.lock().unwrap().push((addr.to_string(), map.version));
            Ok(())
        })
    }
}

/// Ranks 0-1 on host A, 2-3 on host B, all joined.
pub async fn seeded_membership() -> Arc<Membership> {
    let membership = Arc::new(Membership::new(StateStore::open_in_memory().unwrap()));
    for (addr, rank) in [(HOST_A, 0), (HOST_A, 1), (HOST_B, 2), (HOST_B, 3)] {
        membership
            .join(&JoinRequest {
                uuid: Uuid::new_v4(),
                rank: Some(Rank::new(rank)),
                addr: addr.to_string(),
                fault_domain: String::new(),
                uri: format!("tcp://{addr}/{rank}"),
            })
            .await
            .unwrap();
    }
    membership
}

pub async fn coordinator(hosts: Arc<FakeHosts>, host_timeout: Duration) -> Coordinator {
    Coordinator::new(seeded_membership().await, hosts, EventBus::new(), host_timeout)
}

pub fn states(results: &[MemberResult]) -> Vec<(u32, MemberState)> {
    results.iter().map(|r| (r.rank.get(), r.state)).collect()
}
