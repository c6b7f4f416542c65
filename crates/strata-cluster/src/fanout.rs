//! Rank fan-out coordinator.
//!
//! One cluster operation becomes one RPC per host carrying that host's
//! ranks, dispatched in parallel. Hosts that cannot be reached have their
//! ranks reported `Unresponsive`; the merged, deduplicated results are
//! written back to the membership before they are returned.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use strata_core::{
    Context, GroupMap, HostSet, MemberResult, MemberState, Rank, RankMethod, RankSet, RanksReq,
    RanksResp,
};

use crate::error::{ClusterError, ClusterResult};
use crate::events::{ClusterEvent, EventBus};
use crate::membership::Membership;

/// Per-host transport used by the coordinator.
pub trait HostInvoker: Send + Sync {
    /// Run a rank operation on the host at `addr`.
    fn invoke<'a>(
        &'a self,
        ctx: &'a Context,
        addr: &'a str,
        method: RankMethod,
        req: &'a RanksReq,
    ) -> BoxFuture<'a, ClusterResult<RanksResp>>;

    /// Push a group map to the engines on the host at `addr`.
    fn group_update<'a>(
        &'a self,
        ctx: &'a Context,
        addr: &'a str,
        map: &'a GroupMap,
    ) -> BoxFuture<'a, ClusterResult<()>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutRequest {
    #[serde(default)]
    pub method: Option<RankMethod>,
    #[serde(default)]
    pub hosts: HostSet,
    #[serde(default)]
    pub ranks: RankSet,
    #[serde(default)]
    pub force: bool,
    /// Target every member; no host or rank list may be given.
    #[serde(default)]
    pub full_system: bool,
}

impl FanoutRequest {
    pub fn new(method: RankMethod) -> Self {
        Self {
            method: Some(method),
            ..Self::default()
        }
    }

    pub fn with_ranks(mut self, ranks: RankSet) -> Self {
        self.ranks = ranks;
        self
    }

    pub fn with_hosts(mut self, hosts: HostSet) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    fn validate(&self) -> ClusterResult<RankMethod> {
        let method = self.method.ok_or(ClusterError::MissingMethod)?;
        if !self.hosts.is_empty() && !self.ranks.is_empty() {
            return Err(ClusterError::HostsAndRanks);
        }
        if self.full_system && !(self.hosts.is_empty() && self.ranks.is_empty()) {
            return Err(ClusterError::FullSystemFiltered);
        }
        Ok(method)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutResponse {
    pub results: Vec<MemberResult>,
    #[serde(default)]
    pub absent_ranks: RankSet,
    #[serde(default)]
    pub absent_hosts: HostSet,
}

impl FanoutResponse {
    pub fn errored_ranks(&self) -> RankSet {
        self.results.iter().filter(|r| r.errored).map(|r| r.rank).collect()
    }
}

pub struct Coordinator {
    membership: Arc<Membership>,
    invoker: Arc<dyn HostInvoker>,
    events: EventBus,
    host_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        membership: Arc<Membership>,
        invoker: Arc<dyn HostInvoker>,
        events: EventBus,
        host_timeout: Duration,
    ) -> Self {
        Self {
            membership,
            invoker,
            events,
            host_timeout,
        }
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run one rank operation across the hosts owning the requested ranks.
    ///
    /// Only validation and the caller's own context expiring fail the
    /// call; host failures are reported per rank.
    pub async fn fanout(
        &self,
        ctx: &Context,
        req: &FanoutRequest,
    ) -> ClusterResult<FanoutResponse> {
        let method = req.validate()?;
        let resolved = self.membership.resolve_ranks(&req.hosts, &req.ranks).await?;
        let by_host = self.membership.rank_hosts(&resolved.hit).await?;
        debug!(
            %method,
            hosts = by_host.len(),
            ranks = %resolved.hit,
            full_system = req.full_system,
            "fanning out"
        );

        let calls = by_host.iter().map(|(addr, ranks)| async move {
            let host_ctx = ctx.with_timeout(self.host_timeout);
            let host_req = RanksReq {
                ranks: ranks.clone(),
                force: req.force,
            };
            let outcome = self.invoker.invoke(&host_ctx, addr, method, &host_req).await;
            (addr, ranks, outcome)
        });
        let outcomes = join_all(calls).await;
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        let mut results = Vec::with_capacity(resolved.hit.len());
        for (addr, ranks, outcome) in outcomes {
            match outcome {
                Ok(resp) => {
                    let mut missing = ranks.clone();
                    for result in resp.results {
                        if !resolved.hit.contains(result.rank) {
                            debug!(
                                %addr,
                                rank = %result.rank,
                                "result for untargeted rank dropped"
                            );
                            continue;
                        }
                        missing.remove(result.rank);
                        results.push(if result.addr.is_empty() {
                            result.with_addr(addr)
                        } else {
                            result
                        });
                    }
                    if !missing.is_empty() {
                        warn!(%addr, ranks = %missing, "host returned no result for ranks");
                        results.extend(host_failure(
                            addr,
                            &missing,
                            MemberState::Unresponsive,
                            "no result from host",
                        ));
                    }
                }
                Err(e) => {
                    let state = match e {
                        ClusterError::Remote { .. } => MemberState::Errored,
                        _ => MemberState::Unresponsive,
                    };
                    warn!(%addr, %method, %ranks, error = %e, "host call failed");
                    results.extend(host_failure(addr, ranks, state, &e.to_string()));
                }
            }
        }

        let results = dedup(results);
        self.membership
            .update_member_states(&results, method.update_on_fail())
            .await?;
        info!(
            %method,
            results = results.len(),
            absent_ranks = %resolved.absent_ranks,
            absent_hosts = %resolved.absent_hosts,
            "fan-out complete"
        );

        Ok(FanoutResponse {
            results,
            absent_ranks: resolved.absent_ranks,
            absent_hosts: resolved.absent_hosts,
        })
    }

    /// Graceful stop in two phases: prep shutdown, then stop.
    ///
    /// If any rank fails to prepare and `force` is not set, the stop is
    /// aborted and a `StopFailed` event is published.
    pub async fn system_stop(
        &self,
        ctx: &Context,
        req: &FanoutRequest,
    ) -> ClusterResult<FanoutResponse> {
        let mut prep = req.clone();
        prep.method = Some(RankMethod::PrepShutdownRanks);
        let prepared = self.fanout(ctx, &prep).await?;

        let failed = prepared.errored_ranks();
        if !failed.is_empty() {
            if !req.force {
                let err = ClusterError::StopFailed {
                    ranks: failed.clone(),
                    results: prepared.results,
                };
                self.events.publish(ClusterEvent::StopFailed {
                    ranks: failed,
                    msg: err.to_string(),
                });
                return Err(err);
            }
            warn!(ranks = %failed, "prep shutdown failed; forcing stop");
        }

        let mut stop = req.clone();
        stop.method = Some(RankMethod::StopRanks);
        self.fanout(ctx, &stop).await
    }

    /// Send the current group map to every member host. Returns the
    /// number of hosts that accepted it.
    pub async fn push_group_map(&self, ctx: &Context) -> ClusterResult<usize> {
        let map = self.membership.group_map().await?;
        let hosts = self.membership.host_list(&RankSet::new()).await?;
        let map = &map;

        let pushes = hosts.iter().map(|addr| async move {
            let host_ctx = ctx.with_timeout(self.host_timeout);
            (addr, self.invoker.group_update(&host_ctx, addr, map).await)
        });
        let mut accepted = 0;
        for (addr, outcome) in join_all(pushes).await {
            match outcome {
                Ok(()) => accepted += 1,
                Err(e) => warn!(%addr, version = map.version, error = %e, "group map push failed"),
            }
        }
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        debug!(version = map.version, hosts = hosts.len(), accepted, "group map pushed");
        Ok(accepted)
    }
}

fn host_failure<'a>(
    addr: &'a str,
    ranks: &'a RankSet,
    state: MemberState,
    msg: &'a str,
) -> impl Iterator<Item = MemberResult> + 'a {
    ranks
        .iter()
        .map(move |rank| MemberResult::errored(rank, state, msg).with_addr(addr))
}

/// One result per rank in rank order; the first result seen for a rank wins.
fn dedup(results: Vec<MemberResult>) -> Vec<MemberResult> {
    let mut by_rank: BTreeMap<Rank, MemberResult> = BTreeMap::new();
    for result in results {
        match by_rank.get(&result.rank) {
            Some(kept) => {
                if kept != &result {
                    warn!(
                        rank = %result.rank,
                        kept = %kept.state,
                        dropped = %result.state,
                        "conflicting results for rank; keeping first"
                    );
                }
            }
            None => {
                by_rank.insert(result.rank, result);
            }
        }
    }
    by_rank.into_values().collect()
}
