//! dRPC client bound to one engine socket.
//!
//! Each call holds the client's lock from connect to close, so at most one
//! call is in flight per engine no matter how many tasks share the client.
//! Calls to different engines use different clients and never contend.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use strata_core::Context;

use crate::error::{DrpcError, DrpcResult};
use crate::message::{Call, Method, Response, Status, WireResponse, encode_line};
use crate::payload::{DrpcRequest, RemoteStatus};

pub struct DrpcClient {
    socket: PathBuf,
    lock: Mutex<()>,
    sequence: AtomicU64,
}

impl DrpcClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            lock: Mutex::new(()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// Issue one call and return the validated response.
    ///
    /// Only a `SUCCESS` response is returned; anything else becomes an
    /// error. Context expiry is returned as `DrpcError::Context`.
    pub async fn call(&self, ctx: &Context, method: Method, body: Vec<u8>) -> DrpcResult<Response> {
        let _guard = ctx.run(self.lock.lock()).await?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let call = Call::new(method, sequence, body);

        let response = ctx.run(self.exchange(&call)).await??;
        validate(response)
    }

    /// Encode `req`, call its method, decode the reply, and resubmit while
    /// the engine answers with a status the request declares retryable.
    pub async fn request<R: DrpcRequest>(&self, ctx: &Context, req: &R) -> DrpcResult<R::Reply> {
        let body = serde_json::to_vec(req).map_err(|e| DrpcError::Malformed(e.to_string()))?;
        let policy = req.retry_policy();

        loop {
            let response = self.call(ctx, R::METHOD, body.clone()).await?;
            let reply: R::Reply = serde_json::from_slice(&response.body)
                .map_err(|e| DrpcError::Malformed(format!("{} reply: {e}", R::METHOD)))?;

            let status = reply.status();
            if status == 0 {
                return Ok(reply);
            }

            match &policy {
                Some(policy) if policy.should_retry(status) => {
                    debug!(
                        method = %R::METHOD,
                        status,
                        backoff = ?policy.backoff,
                        "retrying dRPC call"
                    );
                    ctx.sleep(policy.backoff).await?;
                }
                _ => {
                    return Err(DrpcError::Remote {
                        method: R::METHOD,
                        status,
                    });
                }
            }
        }
    }

    async fn exchange(&self, call: &Call) -> DrpcResult<Option<Response>> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|e| classify_connect(&self.socket, e))?;

        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(&encode_line(call)?)
            .await
            .map_err(DrpcError::Transport)?;
        writer.flush().await.map_err(DrpcError::Transport)?;

        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(DrpcError::Transport)?;

        // The response is already in hand; a failed close is only noise.
        if let Err(e) = writer.shutdown().await {
            warn!(socket = %self.socket.display(), error = %e, "failed to close dRPC connection");
        }

        if read == 0 || line.trim().is_empty() {
            return Ok(None);
        }

        let wire: WireResponse =
            serde_json::from_str(line.trim_end()).map_err(|e| DrpcError::Malformed(e.to_string()))?;
        let response = Response::try_from(wire)?;
        if response.sequence != call.sequence {
            return Err(DrpcError::Malformed(format!(
                "response sequence {} does not match call {}",
                response.sequence, call.sequence
            )));
        }
        Ok(Some(response))
    }
}

fn validate(response: Option<Response>) -> DrpcResult<Response> {
    let response = response.ok_or(DrpcError::NoResponse)?;
    if response.status != Status::Success {
        return Err(DrpcError::BadStatus(response.status));
    }
    Ok(response)
}

/// A missing socket means the engine never started listening; anything
/// else (e.g. refused while the engine is still coming up) is transient.
fn classify_connect(socket: &Path, err: std::io::Error) -> DrpcError {
    match err.kind() {
        ErrorKind::NotFound => DrpcError::DataPlaneNotStarted(socket.to_path_buf()),
        _ => DrpcError::Transport(err),
    }
}
