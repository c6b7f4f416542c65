//! dRPC socket server.
//!
//! The control process listens on its own socket for engine notifications
//! (`NotifyReady`); tests also use it to stand in for an engine. Each
//! connection is served by its own task and may carry several calls.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use strata_core::Context;

use crate::error::{DrpcError, DrpcResult};
use crate::message::{Call, Method, Response, WireResponse, encode_line};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Handles one method: request body in, reply body (or failure reason) out.
pub type HandlerFn = Arc<dyn Fn(Vec<u8>) -> BoxFuture<Result<Vec<u8>, String>> + Send + Sync>;

/// Wrap an async closure as a [`HandlerFn`].
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, String>> + Send + 'static,
{
    Arc::new(move |body| Box::pin(f(body)))
}

/// Serialize a reply body for a handler.
pub fn reply<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
    serde_json::to_vec(value).map_err(|e| e.to_string())
}

pub struct DrpcServer {
    socket: PathBuf,
    handlers: HashMap<Method, HandlerFn>,
}

impl DrpcServer {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, method: Method, handler: HandlerFn) {
        self.handlers.insert(method, handler);
    }

    pub fn with_handler(mut self, method: Method, handler: HandlerFn) -> Self {
        self.register(method, handler);
        self
    }

    /// Bind the socket, replacing a stale one left by a previous run.
    pub fn listen(self) -> DrpcResult<DrpcListener> {
        if self.socket.exists() {
            std::fs::remove_file(&self.socket).map_err(DrpcError::Transport)?;
        }
        let listener = UnixListener::bind(&self.socket).map_err(DrpcError::Transport)?;
        info!(
            socket = %self.socket.display(),
            methods = self.handlers.len(),
            "dRPC server listening"
        );
        Ok(DrpcListener {
            socket: self.socket,
            listener,
            handlers: Arc::new(self.handlers),
        })
    }
}

pub struct DrpcListener {
    socket: PathBuf,
    listener: UnixListener,
    handlers: Arc<HashMap<Method, HandlerFn>>,
}

impl DrpcListener {
    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// Accept connections until `ctx` is done, then remove the socket.
    pub async fn serve(self, ctx: Context) {
        loop {
            let accepted = match ctx.run(self.listener.accept()).await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            match accepted {
                Ok((stream, _)) => {
                    let handlers = Arc::clone(&self.handlers);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, handlers).await {
                            debug!(error = %e, "dRPC connection closed with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "dRPC accept failed");
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket) {
            debug!(socket = %self.socket.display(), error = %e, "failed to remove dRPC socket");
        }
        debug!(socket = %self.socket.display(), "dRPC server stopped");
    }
}

async fn serve_connection(
    stream: UnixStream,
    handlers: Arc<HashMap<Method, HandlerFn>>,
) -> DrpcResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await.map_err(DrpcError::Transport)?;
        if read == 0 {
            return Ok(());
        }

        let call: Call = match serde_json::from_str(line.trim_end()) {
            Ok(call) => call,
            Err(e) => {
                let resp = Response::failure(0, format!("malformed call: {e}"));
                writer
                    .write_all(&encode_line(&WireResponse::from(&resp))?)
                    .await
                    .map_err(DrpcError::Transport)?;
                return Err(DrpcError::Malformed(e.to_string()));
            }
        };

        let resp = dispatch(&handlers, call).await;
        writer
            .write_all(&encode_line(&WireResponse::from(&resp))?)
            .await
            .map_err(DrpcError::Transport)?;
    }
}

async fn dispatch(handlers: &HashMap<Method, HandlerFn>, call: Call) -> Response {
    let Some(handler) = handlers.get(&call.method) else {
        warn!(method = %call.method, "no dRPC handler registered");
        return Response::failure(call.sequence, DrpcError::UnknownMethod(call.method).to_string());
    };
    if call.module != call.method.module() {
        return Response::failure(
            call.sequence,
            format!("method {} does not belong to module {:?}", call.method, call.module),
        );
    }

    match handler(call.body).await {
        Ok(body) => Response::success(call.sequence, body),
        Err(reason) => {
            debug!(method = %call.method, %reason, "dRPC handler failed");
            Response::failure(call.sequence, reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Status;

    #[tokio::test]
    async fn dispatch_unknown_method_fails() {
        let handlers = HashMap::new();
        let resp = dispatch(&handlers, Call::new(Method::SetUp, 3, vec![])).await;
        assert_eq!(resp.status, Status::Failure);
        assert_eq!(resp.sequence, 3);
    }

    #[tokio::test]
    async fn dispatch_runs_handler() {
        let mut handlers = HashMap::new();
        handlers.insert(
            Method::PingRank,
            handler(|body| async move { Ok(body.into_iter().rev().collect()) }),
        );
        let resp = dispatch(&handlers, Call::new(Method::PingRank, 1, vec![1, 2])).await;
        assert_eq!(resp.status, Status::Success);
        assert_eq!(resp.body, vec![2, 1]);
    }

    #[tokio::test]
    async fn listen_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srv.sock");
        std::fs::write(&path, b"stale").unwrap();
        let listener = DrpcServer::new(&path).listen().unwrap();
        assert_eq!(listener.socket_path(), path.as_path());
    }
}
