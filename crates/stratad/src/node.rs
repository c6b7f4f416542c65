//! Node assembly: engines, the local dRPC server, the control API and,
//! on access points, the membership service.
//!
//! Startup order:
//! 1. Open the membership store (access points only)
//! 2. Build one engine instance per configured engine
//! 3. Listen on the control process dRPC socket
//! 4. Start the engine harness
//! 5. Serve the control API until ctrl-c

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tracing::{error, info, warn};

use strata_cluster::{
    Coordinator, EventBus, HttpInvoker, Membership, NodeState, SystemState, node_router,
    system_router,
};
use strata_core::{Context, Rank, ServerConfig};
use strata_engine::{
    EngineHarness, EngineInstance, ProcessRunner, RankControl, ScmStorage, callback,
};
use strata_state::StateStore;

use crate::link::ClusterLink;

pub struct Node {
    config: ServerConfig,
    harness: Arc<EngineHarness>,
    control: Arc<RankControl>,
    coordinator: Option<Arc<Coordinator>>,
    timeout: Duration,
}

impl Node {
    pub async fn build(config: ServerConfig) -> anyhow::Result<Self> {
        let timeout = config.control_timeout()?;
        let poll_interval = config.poll_interval()?;

        let coordinator = if config.is_access_point() {
            std::fs::create_dir_all(&config.data_dir)?;
            let db_path = config.data_dir.join("membership.redb");
            let store = StateStore::open(&db_path)?;
            info!(path = ?db_path, "membership store opened");
            Some(Arc::new(Coordinator::new(
                Arc::new(Membership::new(store)),
                Arc::new(HttpInvoker::new()),
                EventBus::new(),
                timeout,
            )))
        } else {
            None
        };

        let link = ClusterLink::new(
            config.control_addr(),
            config.fault_domain.clone().unwrap_or_default(),
            config.access_points.clone(),
            coordinator.clone(),
            timeout,
        );

        let harness = Arc::new(EngineHarness::new());
        for (idx, engine) in config.engines.iter().enumerate() {
            let idx = idx as u32;
            let instance = EngineInstance::new(
                idx,
                ScmStorage::new(&engine.scm_mount, config.name.as_str()),
                Arc::new(ProcessRunner::new(engine.clone())),
                config.server_socket(),
            )
            .with_config_rank(engine.rank.map(Rank::new))
            .with_log_mask(engine.log_mask.as_str())
            .with_join(link.join_fn())
            .with_on_exit(link.exit_fn())
            .with_on_await_format(callback(|idx: u32| async move {
                info!(instance = idx, "storage unformatted; awaiting POST /storage/format");
                Ok(())
            }));
            harness.add_instance(instance).await?;
        }
        harness
            .on_drpc_failure(callback(|msg: String| async move {
                warn!(error = %msg, "dRPC failure; requesting leadership step-down");
            }))
            .await;

        Ok(Self {
            control: Arc::new(RankControl::new(Arc::clone(&harness), poll_interval)),
            config,
            harness,
            coordinator,
            timeout,
        })
    }

    /// Control API for this node. Access points also serve the system API.
    pub fn router(&self) -> Router {
        let router = node_router(NodeState {
            control: Arc::clone(&self.control),
            timeout: self.timeout,
        });
        match &self.coordinator {
            Some(coordinator) => router.merge(system_router(SystemState {
                coordinator: Arc::clone(coordinator),
                timeout: self.timeout * 2,
            })),
            None => router,
        }
    }

    pub async fn run(self, ctx: Context) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.config.socket_dir)?;
        let listener = self.harness.drpc_server(self.config.server_socket()).listen()?;
        info!(socket = ?listener.socket_path(), "dRPC server listening");
        let drpc_handle = tokio::spawn(listener.serve(ctx.clone()));

        let events_handle = self.coordinator.as_ref().map(|coordinator| {
            let coordinator = Arc::clone(coordinator);
            let ctx = ctx.clone();
            let events = coordinator.events().subscribe();
            tokio::spawn(async move {
                coordinator.membership().run_events(&ctx, events).await;
            })
        });

        let harness = Arc::clone(&self.harness);
        let harness_ctx = ctx.clone();
        let harness_handle = tokio::spawn(async move {
            if let Err(e) = harness.start(&harness_ctx).await {
                error!(error = %e, "engine harness failed");
            }
        });

        let api_addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = tokio::net::TcpListener::bind(api_addr).await?;
        info!(
            %api_addr,
            access_point = self.coordinator.is_some(),
            engines = self.config.engines.len(),
            "control API listening"
        );
        let shutdown = ctx.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.done().await;
            })
            .await?;

        ctx.cancel();
        let _ = harness_handle.await;
        let _ = drpc_handle.await;
        if let Some(handle) = events_handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// Build the node and run it until ctrl-c.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    info!(name = %config.name, addr = %config.control_addr(), "stratad starting");
    let node = Node::build(config).await?;

    let ctx = Context::background().with_cancel();
    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
        }
        signal_ctx.cancel();
    });

    node.run(ctx).await?;
    info!("stratad stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn config(dir: &std::path::Path, access_point: bool) -> ServerConfig {
        let access_points = if access_point { "127.0.0.1:10001" } else { "10.9.9.9:10001" };
        let content = format!(
            r#"
name = "test"
socket_dir = "{dir}/run"
data_dir = "{dir}/data"
access_points = ["{access_points}"]

[[engines]]
binary = "/bin/true"
scm_mount = "{dir}/scm0"
"#,
            dir = dir.display()
        );
        ServerConfig::from_toml(&content).unwrap()
    }

    async fn members_status(node: &Node) -> StatusCode {
        let req = Request::builder().uri("/system/members").body(Body::empty()).unwrap();
        node.router().oneshot(req).await.unwrap().status()
    }

    #[tokio::test]
    async fn access_point_serves_system_api() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::build(config(dir.path(), true)).await.unwrap();
        assert!(node.coordinator.is_some());
        assert!(dir.path().join("data/membership.redb").exists());
        assert_eq!(members_status(&node).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn other_nodes_serve_only_node_api() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::build(config(dir.path(), false)).await.unwrap();
        assert!(node.coordinator.is_none());
        assert_eq!(members_status(&node).await, StatusCode::NOT_FOUND);
        assert_eq!(node.harness.instances().await.len(), 1);
    }

    #[tokio::test]
    async fn run_stops_when_canceled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), false);
        config.port = 0;
        let node = Node::build(config).await.unwrap();

        let ctx = Context::background().with_cancel();
        let run = tokio::spawn(node.run(ctx.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
