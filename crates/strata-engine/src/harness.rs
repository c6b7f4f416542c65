//! Engine harness — the node-local owner of all engine instances.
//!
//! The harness starts every instance's control loop, routes readiness
//! announcements from engines to their instances, and offers
//! first-available dRPC dispatch for calls that any engine can answer.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use strata_core::{Context, GroupMap, RankSet};
use strata_drpc::server::BoxFuture;
use strata_drpc::{
    DrpcRequest, DrpcServer, EngineResp, GroupMember, GroupUpdateReq, HandlerFn, Method,
    NotifyReadyReq, Response, handler, reply,
};

use crate::error::{EngineError, EngineResult};
use crate::instance::EngineInstance;

/// Invoked with the error of a failed first-available dRPC call.
pub type DrpcFailureFn = Arc<dyn Fn(String) -> BoxFuture<()> + Send + Sync>;

#[derive(Default)]
pub struct EngineHarness {
    instances: RwLock<Vec<Arc<EngineInstance>>>,
    started: AtomicBool,
    failure_handlers: RwLock<Vec<DrpcFailureFn>>,
}

impl EngineHarness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance. Instances are kept in index order.
    pub async fn add_instance(
        &self,
        instance: EngineInstance,
    ) -> EngineResult<Arc<EngineInstance>> {
        if self.is_started() {
            return Err(EngineError::HarnessStarted);
        }
        let instance = Arc::new(instance);
        let mut instances = self.instances.write().await;
        instances.push(Arc::clone(&instance));
        instances.sort_by_key(|i| i.index());
        Ok(instance)
    }

    pub async fn instances(&self) -> Vec<Arc<EngineInstance>> {
        self.instances.read().await.clone()
    }

    pub async fn instance(&self, idx: u32) -> Option<Arc<EngineInstance>> {
        self.instances
            .read()
            .await
            .iter()
            .find(|i| i.index() == idx)
            .cloned()
    }

    /// Instances whose rank is in `ranks`; an empty set selects every instance.
    pub async fn filter_instances_by_rank_set(&self, ranks: &RankSet) -> Vec<Arc<EngineInstance>> {
        let instances = self.instances().await;
        if ranks.is_empty() {
            return instances;
        }
        let mut matched = Vec::new();
        for instance in instances {
            if let Some(rank) = instance.rank().await {
                if ranks.contains(rank) {
                    matched.push(instance);
                }
            }
        }
        matched
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Ranks of instances that finished the setup handshake.
    pub async fn ready_ranks(&self) -> RankSet {
        let mut ranks = RankSet::new();
        for instance in self.instances().await {
            if !instance.is_ready() {
                continue;
            }
            if let Some(rank) = instance.rank().await {
                ranks.insert(rank);
            }
        }
        ranks
    }

    pub async fn on_drpc_failure(&self, f: DrpcFailureFn) {
        self.failure_handlers.write().await.push(f);
    }

    /// Send a call to the first ready instance. Instances that are not
    /// ready are skipped; the first real failure is returned and reported
    /// to the failure handlers.
    pub async fn call_drpc(
        &self,
        ctx: &Context,
        method: Method,
        body: Vec<u8>,
    ) -> EngineResult<Response> {
        self.first_available(|instance| {
            let body = body.clone();
            async move { instance.call_drpc(ctx, method, body).await }
        })
        .await
    }

    /// Typed variant of [`call_drpc`](Self::call_drpc).
    pub async fn request<R: DrpcRequest>(&self, ctx: &Context, req: &R) -> EngineResult<R::Reply> {
        self.first_available(|instance| async move { instance.request(ctx, req).await })
            .await
    }

    async fn first_available<T, F, Fut>(&self, mut call: F) -> EngineResult<T>
    where
        F: FnMut(Arc<EngineInstance>) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        if !self.is_started() {
            return Err(EngineError::HarnessNotStarted);
        }
        for instance in self.instances().await {
            match call(instance).await {
                Ok(value) => return Ok(value),
                Err(EngineError::NotReady(idx)) => {
                    debug!(instance = idx, "instance not ready; trying next");
                }
                Err(e) => {
                    if e.context_error().is_none() {
                        self.report_failure(&e).await;
                    }
                    return Err(e);
                }
            }
        }
        Err(EngineError::NoReadyInstance)
    }

    async fn report_failure(&self, err: &EngineError) {
        let handlers = self.failure_handlers.read().await.clone();
        warn!(error = %err, handlers = handlers.len(), "dRPC call failed");
        for f in handlers {
            f(err.to_string()).await;
        }
    }

    /// Push a new group map to the engines.
    pub async fn group_update(&self, ctx: &Context, map: &GroupMap) -> EngineResult<()> {
        let req = GroupUpdateReq {
            members: map
                .members
                .iter()
                .map(|m| GroupMember {
                    rank: m.rank.get(),
                    uri: m.uri.clone(),
                    incarnation: m.incarnation,
                })
                .collect(),
            map_version: map.version,
        };
        self.request(ctx, &req).await?;
        debug!(version = map.version, members = map.members.len(), "group map pushed");
        Ok(())
    }

    /// Run every instance's control loop, request a start for each, and
    /// block until `ctx` is done.
    pub async fn start(&self, ctx: &Context) -> EngineResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::HarnessStarted);
        }
        let instances = self.instances().await;

        let mut loops = JoinSet::new();
        for instance in &instances {
            loops.spawn(Arc::clone(instance).run(ctx.clone()));
        }
        for instance in &instances {
            if let Err(e) = instance.request_start(ctx).await {
                warn!(instance = instance.index(), error = %e, "initial start request failed");
            }
        }
        info!(instances = instances.len(), "engine harness started");

        let reason = ctx.done().await;
        debug!(%reason, "engine harness stopping");
        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "instance control loop failed"),
                Err(e) => error!(error = %e, "instance control loop panicked"),
            }
        }

        self.started.store(false, Ordering::SeqCst);
        info!("engine harness stopped");
        Ok(())
    }

    /// dRPC handler that routes `NotifyReady` to the announcing instance.
    pub fn notify_ready_handler(self: &Arc<Self>) -> HandlerFn {
        let harness = Arc::clone(self);
        handler(move |body| {
            let harness = Arc::clone(&harness);
            async move {
                let req: NotifyReadyReq =
                    serde_json::from_slice(&body).map_err(|e| format!("decode NotifyReady: {e}"))?;
                let instance = harness
                    .instance(req.instance_idx)
                    .await
                    .ok_or_else(|| format!("no engine instance {}", req.instance_idx))?;
                instance.notify_ready(req).map_err(|e| e.to_string())?;
                reply(&EngineResp::default())
            }
        })
    }

    /// The control process's own dRPC server with the harness handlers.
    pub fn drpc_server(self: &Arc<Self>, socket: impl Into<std::path::PathBuf>) -> DrpcServer {
        DrpcServer::new(socket).with_handler(Method::NotifyReady, self.notify_ready_handler())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ScmStorage;
    use crate::testing::FakeRunner;

    fn instance(dir: &std::path::Path, idx: u32) -> EngineInstance {
        EngineInstance::new(
            idx,
            ScmStorage::new(dir.join(format!("scm{idx}")), "strata"),
            FakeRunner::new(),
            dir.join("strata_server.sock"),
        )
    }

    #[tokio::test]
    async fn calls_before_start_fail() {
        let harness = EngineHarness::new();
        let err = harness
            .call_drpc(&Context::background(), Method::PingRank, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::HarnessNotStarted));
    }

    #[tokio::test]
    async fn empty_filter_selects_all() {
        let dir = tempfile::tempdir().unwrap();
        let harness = EngineHarness::new();
        harness.add_instance(instance(dir.path(), 1)).await.unwrap();
        harness.add_instance(instance(dir.path(), 0)).await.unwrap();

        let all = harness.filter_instances_by_rank_set(&RankSet::new()).await;
        let indexes: Vec<u32> = all.iter().map(|i| i.index()).collect();
        assert_eq!(indexes, vec![0, 1]);

        // No instance has a rank yet.
        let ranks: RankSet = "0".parse().unwrap();
        assert!(harness.filter_instances_by_rank_set(&ranks).await.is_empty());
        assert!(harness.ready_ranks().await.is_empty());
    }

    #[tokio::test]
    async fn no_ready_instance() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Arc::new(EngineHarness::new());
        harness.add_instance(instance(dir.path(), 0)).await.unwrap();

        let ctx = Context::background().with_cancel();
        let running = {
            let harness = Arc::clone(&harness);
            let ctx = ctx.clone();
            tokio::spawn(async move { harness.start(&ctx).await })
        };
        let h = &harness;
        crate::poll::poll_until(&ctx, std::time::Duration::from_millis(5), || async move {
            h.is_started()
        })
        .await
        .unwrap();

        let err = harness
            .call_drpc(&Context::background(), Method::PingRank, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoReadyInstance));
        assert!(matches!(
            harness.add_instance(instance(dir.path(), 1)).await,
            Err(EngineError::HarnessStarted)
        ));

        ctx.cancel();
        running.await.unwrap().unwrap();
        assert!(!harness.is_started());
    }

    #[tokio::test]
    async fn notify_ready_for_unknown_instance_fails() {
        let harness = Arc::new(EngineHarness::new());
        let handler = harness.notify_ready_handler();
        let body = serde_json::to_vec(&NotifyReadyReq {
            instance_idx: 9,
            drpc_socket: "/tmp/engine9.sock".into(),
            uri: String::new(),
            incarnation: 0,
        })
        .unwrap();
        let err = handler(body).await.unwrap_err();
        assert!(err.contains("no engine instance 9"), "{err}");
    }
}
