//! Engine callbacks that reach the system membership.
//!
//! On an access point the membership is in-process; elsewhere it is
//! reached over HTTP, trying each access point in configured order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use strata_cluster::{
    ClusterError, ClusterEvent, Coordinator, HttpInvoker, JoinRequest, JoinResponse,
};
use strata_core::{Context, Rank};
use strata_engine::{
    EngineError, EngineResult, ExitFn, InstanceExit, JoinArgs, JoinFn, JoinReply, callback,
};

pub struct ClusterLink {
    /// This node's control address, recorded with every member it joins.
    addr: String,
    fault_domain: String,
    access_points: Vec<String>,
    local: Option<Arc<Coordinator>>,
    invoker: HttpInvoker,
    timeout: Duration,
    /// Membership incarnation of each rank joined from this node.
    incarnations: Mutex<HashMap<Rank, u64>>,
}

impl ClusterLink {
    pub fn new(
        addr: String,
        fault_domain: String,
        access_points: Vec<String>,
        local: Option<Arc<Coordinator>>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            addr,
            fault_domain,
            access_points,
            local,
            invoker: HttpInvoker::new(),
            timeout,
            incarnations: Mutex::new(HashMap::new()),
        })
    }

    pub fn join_fn(self: &Arc<Self>) -> JoinFn {
        let link = Arc::clone(self);
        callback(move |args: JoinArgs| {
            let link = Arc::clone(&link);
            async move { link.join(args).await }
        })
    }

    pub fn exit_fn(self: &Arc<Self>) -> ExitFn {
        let link = Arc::clone(self);
        callback(move |exit: InstanceExit| {
            let link = Arc::clone(&link);
            async move { link.rank_down(exit).await }
        })
    }

    pub async fn join(&self, args: JoinArgs) -> EngineResult<JoinReply> {
        let req = JoinRequest {
            uuid: args.uuid,
            rank: args.rank,
            addr: self.addr.clone(),
            fault_domain: self.fault_domain.clone(),
            uri: args.uri,
        };
        let resp = match &self.local {
            Some(coordinator) => {
                let resp = coordinator
                    .membership()
                    .join(&req)
                    .await
                    .map_err(|e| EngineError::Join(e.to_string()))?;
                let coordinator = Arc::clone(coordinator);
                let timeout = self.timeout;
                tokio::spawn(async move {
                    let ctx = Context::background().with_timeout(timeout);
                    if let Err(e) = coordinator.push_group_map(&ctx).await {
                        warn!(error = %e, "group map push after join failed");
                    }
                });
                resp
            }
            None => self.remote_join(&req).await?,
        };

        self.incarnations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resp.rank, resp.incarnation);
        Ok(JoinReply {
            rank: resp.rank,
            map_version: resp.map_version,
        })
    }

    async fn remote_join(&self, req: &JoinRequest) -> EngineResult<JoinResponse> {
        let ctx = Context::background().with_timeout(self.timeout);
        let mut last = None;
        for ap in &self.access_points {
            match self.invoker.join(&ctx, ap, req).await {
                Ok(resp) => return Ok(resp),
                Err(ClusterError::Context(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(access_point = %ap, error = %e, "join attempt failed");
                    last = Some(e);
                }
            }
        }
        Err(EngineError::Join(match last {
            Some(e) => e.to_string(),
            None => "no access points configured".to_string(),
        }))
    }

    /// Report the exit of a ranked engine. Failures to deliver are logged;
    /// they never fail the exit handling.
    pub async fn rank_down(&self, exit: InstanceExit) -> EngineResult<()> {
        let Some(rank) = exit.rank else {
            return Ok(());
        };
        let incarnation = self
            .incarnations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&rank)
            .copied()
            .unwrap_or_default();
        let event = ClusterEvent::RankDown {
            rank,
            incarnation,
            exit: exit.exit.to_string(),
        };

        if let Some(coordinator) = &self.local {
            coordinator.events().publish(event);
            return Ok(());
        }
        let ctx = Context::background().with_timeout(self.timeout);
        for ap in &self.access_points {
            match self.invoker.publish(&ctx, ap, &event).await {
                Ok(_) => {
                    debug!(%rank, access_point = %ap, "rank down reported");
                    return Ok(());
                }
                Err(e) => {
                    warn!(%rank, access_point = %ap, error = %e, "failed to report rank down")
                }
            }
        }
        Ok(())
    }
}
