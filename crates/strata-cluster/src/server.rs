//! HTTP control API.
//!
//! The node router exposes the local rank operations of one host; the
//! system router (access points only) exposes membership and the
//! cluster-wide operations built on the fan-out coordinator.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/ranks/{ping,prep-shutdown,stop,start,reset-format}` | Local rank operation |
//! | POST | `/engine/log-masks` | Set engine log masks |
//! | POST | `/engine/group-update` | Push a group map to the engines |
//! | POST | `/storage/format` | Format unformatted engine storage |
//! | POST | `/system/{query,start,stop,reset-format}` | Cluster-wide rank operation |
//! | POST | `/system/join` | Join an engine to the system |
//! | POST | `/system/exclude` | Exclude ranks, or clear their exclusion |
//! | POST | `/system/event` | Publish a cluster event |
//! | GET | `/system/members` | List members, optionally filtered by state |

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use strata_core::{
    Context, GroupMap, HostSet, LogMasksReq, MemberState, RankMethod, RankSet, RanksReq,
};
use strata_engine::{EngineError, RankControl};

use crate::error::ClusterError;
use crate::events::{ClusterEvent, EventBus};
use crate::fanout::{Coordinator, FanoutRequest};
use crate::membership::{JoinRequest, Membership};

/// Response wrapper shared by every route and decoded by the client.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

// ── Node API ───────────────────────────────────────────────────

#[derive(Clone)]
pub struct NodeState {
    pub control: Arc<RankControl>,
    /// Deadline for one local operation.
    pub timeout: Duration,
}

impl NodeState {
    fn context(&self) -> Context {
        Context::background().with_timeout(self.timeout)
    }
}

pub fn node_router(state: NodeState) -> Router {
    Router::new()
        .route("/ranks/{method}", post(rank_operation))
        .route("/engine/log-masks", post(set_log_masks))
        .route("/engine/group-update", post(group_update))
        .route("/storage/format", post(format_storage))
        .with_state(state)
}

fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        _ if err.context_error().is_some() => StatusCode::GATEWAY_TIMEOUT,
        EngineError::InstanceStarted { .. } => StatusCode::CONFLICT,
        EngineError::EmptyLogMasks => StatusCode::BAD_REQUEST,
        EngineError::HarnessNotStarted | EngineError::NoReadyInstance => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// POST /ranks/{method}
async fn rank_operation(
    State(state): State<NodeState>,
    Path(segment): Path<String>,
    Json(req): Json<RanksReq>,
) -> impl IntoResponse {
    let Some(method) = RankMethod::from_path_segment(&segment) else {
        return error_response(
            &format!("unknown rank operation {segment:?}"),
            StatusCode::NOT_FOUND,
        );
    };
    debug!(%method, ranks = %req.ranks, force = req.force, "rank operation requested");
    match state.control.handle(&state.context(), method, &req).await {
        Ok(resp) => ApiResponse::ok(resp).into_response(),
        Err(e) => {
            warn!(%method, error = %e, "rank operation failed");
            error_response(&e.to_string(), engine_status(&e))
        }
    }
}

/// POST /engine/log-masks
async fn set_log_masks(
    State(state): State<NodeState>,
    Json(req): Json<LogMasksReq>,
) -> impl IntoResponse {
    match state.control.set_engine_log_masks(&state.context(), &req).await {
        Ok(resp) => ApiResponse::ok(resp).into_response(),
        Err(e) => error_response(&e.to_string(), engine_status(&e)),
    }
}

/// POST /engine/group-update
async fn group_update(
    State(state): State<NodeState>,
    Json(map): Json<GroupMap>,
) -> impl IntoResponse {
    match state.control.group_update(&state.context(), &map).await {
        Ok(()) => ApiResponse::ok(map.version).into_response(),
        Err(e) => error_response(&e.to_string(), engine_status(&e)),
    }
}

/// POST /storage/format
///
/// Formats every engine storage that is not formatted yet, releasing
/// engines waiting for it. Returns the formatted instance indexes.
async fn format_storage(State(state): State<NodeState>) -> impl IntoResponse {
    let mut formatted = Vec::new();
    for instance in state.control.harness().instances().await {
        if instance.storage().is_formatted() {
            continue;
        }
        if let Err(e) = instance.storage().format() {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR);
        }
        formatted.push(instance.index());
    }
    info!(?formatted, "engine storage formatted");
    ApiResponse::ok(formatted).into_response()
}

// ── System API ─────────────────────────────────────────────────

#[derive(Clone)]
pub struct SystemState {
    pub coordinator: Arc<Coordinator>,
    /// Deadline for one cluster-wide operation.
    pub timeout: Duration,
}

impl SystemState {
    fn membership(&self) -> &Arc<Membership> {
        self.coordinator.membership()
    }

    fn events(&self) -> &EventBus {
        self.coordinator.events()
    }
}

pub fn system_router(state: SystemState) -> Router {
    Router::new()
        .route("/system/query", post(system_query))
        .route("/system/start", post(system_start))
        .route("/system/stop", post(system_stop))
        .route("/system/reset-format", post(system_reset_format))
        .route("/system/join", post(system_join))
        .route("/system/exclude", post(system_exclude))
        .route("/system/event", post(system_event))
        .route("/system/members", get(list_members))
        .with_state(state)
}

/// Target selection for a cluster-wide operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemReq {
    #[serde(default)]
    pub hosts: HostSet,
    #[serde(default)]
    pub ranks: RankSet,
    #[serde(default)]
    pub force: bool,
}

impl SystemReq {
    fn fanout(&self, method: RankMethod) -> FanoutRequest {
        FanoutRequest {
            method: Some(method),
            hosts: self.hosts.clone(),
            ranks: self.ranks.clone(),
            force: self.force,
            full_system: self.hosts.is_empty() && self.ranks.is_empty(),
        }
    }
}

fn cluster_status(err: &ClusterError) -> StatusCode {
    match err {
        ClusterError::Context(_) => StatusCode::GATEWAY_TIMEOUT,
        ClusterError::StopFailed { .. } => StatusCode::CONFLICT,
        e if e.is_validation() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn cluster_error(err: ClusterError) -> axum::response::Response {
    let status = cluster_status(&err);
    let msg = err.to_string();
    warn!(error = %msg, %status, "system request failed");
    match err {
        // Keep the per-rank detail of an aborted stop.
        ClusterError::StopFailed { results, .. } => (
            status,
            Json(ApiResponse {
                success: false,
                data: Some(results),
                error: Some(msg),
            }),
        )
            .into_response(),
        _ => error_response(&msg, status),
    }
}

async fn run_fanout(state: &SystemState, req: FanoutRequest) -> axum::response::Response {
    let ctx = Context::background().with_timeout(state.timeout);
    match state.coordinator.fanout(&ctx, &req).await {
        Ok(resp) => ApiResponse::ok(resp).into_response(),
        Err(e) => cluster_error(e),
    }
}

/// POST /system/query
async fn system_query(
    State(state): State<SystemState>,
    Json(req): Json<SystemReq>,
) -> impl IntoResponse {
    run_fanout(&state, req.fanout(RankMethod::PingRanks)).await
}

/// POST /system/start
async fn system_start(
    State(state): State<SystemState>,
    Json(req): Json<SystemReq>,
) -> impl IntoResponse {
    run_fanout(&state, req.fanout(RankMethod::StartRanks)).await
}

/// POST /system/reset-format
async fn system_reset_format(
    State(state): State<SystemState>,
    Json(req): Json<SystemReq>,
) -> impl IntoResponse {
    run_fanout(&state, req.fanout(RankMethod::ResetFormatRanks)).await
}

/// POST /system/stop
async fn system_stop(
    State(state): State<SystemState>,
    Json(req): Json<SystemReq>,
) -> impl IntoResponse {
    let ctx = Context::background().with_timeout(state.timeout);
    match state
        .coordinator
        .system_stop(&ctx, &req.fanout(RankMethod::StopRanks))
        .await
    {
        Ok(resp) => ApiResponse::ok(resp).into_response(),
        Err(e) => cluster_error(e),
    }
}

/// POST /system/join
///
/// A successful join is followed by a group map push in the background.
async fn system_join(
    State(state): State<SystemState>,
    Json(req): Json<JoinRequest>,
) -> impl IntoResponse {
    match state.membership().join(&req).await {
        Ok(resp) => {
            let coordinator = Arc::clone(&state.coordinator);
            let timeout = state.timeout;
            tokio::spawn(async move {
                let ctx = Context::background().with_timeout(timeout);
                if let Err(e) = coordinator.push_group_map(&ctx).await {
                    warn!(error = %e, "group map push after join failed");
                }
            });
            ApiResponse::ok(resp).into_response()
        }
        Err(e) => cluster_error(e),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExcludeReq {
    pub ranks: RankSet,
    /// Clear an earlier exclusion instead.
    #[serde(default)]
    pub clear: bool,
}

/// POST /system/exclude
async fn system_exclude(
    State(state): State<SystemState>,
    Json(req): Json<ExcludeReq>,
) -> impl IntoResponse {
    let outcome = if req.clear {
        state.membership().clear_excluded(&req.ranks).await
    } else {
        state.membership().exclude(&req.ranks).await
    };
    match outcome {
        Ok(version) => ApiResponse::ok(version).into_response(),
        Err(e) => cluster_error(e),
    }
}

/// POST /system/event
async fn system_event(
    State(state): State<SystemState>,
    Json(event): Json<ClusterEvent>,
) -> impl IntoResponse {
    let receivers = state.events().publish(event);
    ApiResponse::ok(receivers).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct MembersQuery {
    /// Comma-separated member states.
    #[serde(default)]
    pub states: Option<String>,
}

/// GET /system/members
async fn list_members(
    State(state): State<SystemState>,
    Query(query): Query<MembersQuery>,
) -> impl IntoResponse {
    let mut filter = Vec::new();
    for name in query.states.iter().flat_map(|s| s.split(',')).filter(|s| !s.trim().is_empty()) {
        match name.parse::<MemberState>() {
            Ok(s) => filter.push(s),
            Err(e) => return error_response(&e, StatusCode::BAD_REQUEST),
        }
    }
    match state.membership().members(&filter).await {
        Ok(members) => ApiResponse::ok(members).into_response(),
        Err(e) => cluster_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use strata_engine::testing::FakeRunner;
    use strata_engine::{EngineHarness, EngineInstance, ScmStorage};

    fn node() -> Router {
        node_router(NodeState {
            control: Arc::new(RankControl::new(
                Arc::new(EngineHarness::new()),
                Duration::from_millis(5),
            )),
            timeout: Duration::from_secs(1),
        })
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unknown_rank_operation_is_not_found() {
        let resp = node()
            .oneshot(post_json("/ranks/explode", r#"{"ranks":""}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn ping_without_engines_is_empty() {
        let resp = node()
            .oneshot(post_json("/ranks/ping", r#"{"ranks":""}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["results"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn group_update_before_start_is_unavailable() {
        let resp = node()
            .oneshot(post_json("/engine/group-update", r#"{"version":3,"members":[]}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn format_releases_unformatted_storage_once() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Arc::new(EngineHarness::new());
        let instance = harness
            .add_instance(EngineInstance::new(
                0,
                ScmStorage::new(dir.path().join("scm0"), "strata"),
                FakeRunner::new(),
                dir.path().join("strata_server.sock"),
            ))
            .await
            .unwrap();
        let router = node_router(NodeState {
            control: Arc::new(RankControl::new(harness, Duration::from_millis(5))),
            timeout: Duration::from_secs(1),
        });

        let resp = router
            .clone()
            .oneshot(post_json("/storage/format", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"], serde_json::json!([0]));
        assert!(instance.storage().is_formatted());

        let resp = router.oneshot(post_json("/storage/format", "")).await.unwrap();
        assert_eq!(body_json(resp).await["data"], serde_json::json!([]));
    }

    #[test]
    fn system_request_without_targets_is_full_system() {
        let req = SystemReq::default().fanout(RankMethod::StopRanks);
        assert!(req.full_system);
        let req = SystemReq {
            ranks: "1".parse().unwrap(),
            ..Default::default()
        }
        .fanout(RankMethod::StopRanks);
        assert!(!req.full_system);
    }
}
