//! HTTP client for the control API.
//!
//! One short-lived HTTP/1 connection per request. Connection failures and
//! node-side timeouts are transport errors; any other error answer is a
//! remote error.

use bytes::Bytes;
use futures::future::BoxFuture;
use http::StatusCode;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tracing::debug;

use strata_core::{Context, GroupMap, RankMethod, RanksReq, RanksResp};

use crate::error::{ClusterError, ClusterResult};
use crate::events::ClusterEvent;
use crate::fanout::HostInvoker;
use crate::membership::{JoinRequest, JoinResponse};
use crate::server::ApiResponse;

const CLIENT_AGENT: &str = "strata-cluster/0.1";

#[derive(Debug, Clone, Default)]
pub struct HttpInvoker;

impl HttpInvoker {
    pub fn new() -> Self {
        Self
    }

    /// POST `body` as JSON to `path` on `addr` and decode the `data` of
    /// the response envelope.
    pub async fn post<Req, Resp>(
        &self,
        ctx: &Context,
        addr: &str,
        path: &str,
        body: &Req,
    ) -> ClusterResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(body).map_err(|e| ClusterError::Encode(e.to_string()))?;
        ctx.run(exchange(addr, path, body)).await?
    }

    pub async fn join(
        &self,
        ctx: &Context,
        access_point: &str,
        req: &JoinRequest,
    ) -> ClusterResult<JoinResponse> {
        self.post(ctx, access_point, "/system/join", req).await
    }

    pub async fn publish(
        &self,
        ctx: &Context,
        access_point: &str,
        event: &ClusterEvent,
    ) -> ClusterResult<usize> {
        self.post(ctx, access_point, "/system/event", event).await
    }
}

impl HostInvoker for HttpInvoker {
    fn invoke<'a>(
        &'a self,
        ctx: &'a Context,
        addr: &'a str,
        method: RankMethod,
        req: &'a RanksReq,
    ) -> BoxFuture<'a, ClusterResult<RanksResp>> {
        Box::pin(async move {
            let path = format!("/ranks/{}", method.path_segment());
            self.post(ctx, addr, &path, req).await
        })
    }

    fn group_update<'a>(
        &'a self,
        ctx: &'a Context,
        addr: &'a str,
        map: &'a GroupMap,
    ) -> BoxFuture<'a, ClusterResult<()>> {
        Box::pin(async move {
            let _version: u64 = self.post(ctx, addr, "/engine/group-update", map).await?;
            Ok(())
        })
    }
}

async fn exchange<Resp: DeserializeOwned>(
    addr: &str,
    path: &str,
    body: Vec<u8>,
) -> ClusterResult<Resp> {
    let uri = format!("http://{addr}{path}");

    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ClusterError::transport(addr, e))?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ClusterError::transport(addr, e))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "control connection closed with error");
        }
    });

    let req = http::Request::builder()
        .method(http::Method::POST)
        .uri(&uri)
        .header(HOST, addr)
        .header(USER_AGENT, CLIENT_AGENT)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| ClusterError::Encode(e.to_string()))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| ClusterError::transport(addr, e))?;
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ClusterError::transport(addr, e))?
        .to_bytes();
    debug!(%uri, %status, len = bytes.len(), "control response received");

    decode(addr, status, &bytes)
}

fn decode<Resp: DeserializeOwned>(
    addr: &str,
    status: StatusCode,
    bytes: &[u8],
) -> ClusterResult<Resp> {
    let envelope: ApiResponse<serde_json::Value> = serde_json::from_slice(bytes)
        .map_err(|e| ClusterError::remote(addr, format!("{status}: undecodable response: {e}")))?;

    if !status.is_success() || !envelope.success {
        let msg = envelope.error.unwrap_or_else(|| status.to_string());
        return Err(if status == StatusCode::GATEWAY_TIMEOUT {
            ClusterError::transport(addr, msg)
        } else {
            ClusterError::remote(addr, msg)
        });
    }
    let data = envelope.data.unwrap_or(serde_json::Value::Null);
    serde_json::from_value(data)
        .map_err(|e| ClusterError::remote(addr, format!("undecodable response data: {e}")))
}
