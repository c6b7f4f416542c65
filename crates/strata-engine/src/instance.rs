//! Engine instance — lifecycle state machine for one supervised engine.
//!
//! Each instance runs one control loop (see [`EngineInstance::run`]). A
//! start request drives it through:
//!
//! ```text
//! await format ─▶ load superblock ─▶ launch ─▶ NotifyReady ─▶ join
//!     ─▶ SetRank ─▶ SetUp ─▶ ready ─▶ (running) ─▶ exit
//! ```
//!
//! Every step runs inside the loop task, so the handshake for one instance
//! is strictly sequential. Externally visible state is derived from
//! independent flags rather than stored; readers poll it (see
//! [`crate::poll`]).
//!
//! Extension points are ordered callback lists registered before the loop
//! starts. The first callback error aborts the rest of that event and is
//! returned to the step that raised it.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use strata_core::{Context, ContextError, MemberResult, MemberState, Rank};
use strata_drpc::server::BoxFuture;
use strata_drpc::{DrpcClient, DrpcRequest, Method, NotifyReadyReq, Response, SetRankReq, SetUpReq};

use crate::error::{EngineError, EngineResult};
use crate::runner::{EngineExit, EngineRunner, LaunchEnv, Signal};
use crate::storage::ScmStorage;
use crate::superblock::Superblock;

/// How long to wait for a killed engine to be reaped on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Passed to on-ready callbacks once the setup handshake has finished.
#[derive(Debug, Clone)]
pub struct ReadyInfo {
    pub idx: u32,
    pub rank: Rank,
    pub uri: String,
    pub incarnation: u64,
}

/// Passed to on-exit callbacks whenever the engine process ends.
#[derive(Debug, Clone)]
pub struct InstanceExit {
    pub idx: u32,
    pub rank: Option<Rank>,
    pub incarnation: u64,
    pub exit: EngineExit,
}

#[derive(Debug, Clone)]
pub struct JoinArgs {
    pub idx: u32,
    pub uuid: Uuid,
    /// Rank already recorded in the superblock, if any.
    pub rank: Option<Rank>,
    pub uri: String,
    pub incarnation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinReply {
    pub rank: Rank,
    pub map_version: u64,
}

pub type ReadyFn = Arc<dyn Fn(ReadyInfo) -> BoxFuture<EngineResult<()>> + Send + Sync>;
pub type ExitFn = Arc<dyn Fn(InstanceExit) -> BoxFuture<EngineResult<()>> + Send + Sync>;
/// Storage events carry the instance index.
pub type StorageFn = Arc<dyn Fn(u32) -> BoxFuture<EngineResult<()>> + Send + Sync>;
pub type JoinFn = Arc<dyn Fn(JoinArgs) -> BoxFuture<EngineResult<JoinReply>> + Send + Sync>;

/// Wrap an async closure as one of the callback types above.
pub fn callback<A, T, F, Fut>(f: F) -> Arc<dyn Fn(A) -> BoxFuture<T> + Send + Sync>
where
    A: 'static,
    T: 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    Arc::new(move |arg| Box::pin(f(arg)))
}

#[derive(Default)]
struct Callbacks {
    on_ready: Vec<ReadyFn>,
    on_exit: Vec<ExitFn>,
    on_storage_ready: Vec<StorageFn>,
    on_await_format: Vec<StorageFn>,
    join: Option<JoinFn>,
}

/// Receivers owned by whichever task runs the control loop.
struct LoopInputs {
    start: mpsc::Receiver<()>,
    ready: mpsc::Receiver<NotifyReadyReq>,
}

#[derive(Default)]
struct RunState {
    /// A start is queued and the loop has not picked it up yet.
    start_pending: bool,
    /// The loop is inside one start-to-exit run.
    active: bool,
    /// A start arrived during the run; start again once it ends.
    restart_pending: bool,
}

pub struct EngineInstance {
    idx: u32,
    storage: ScmStorage,
    runner: Arc<dyn EngineRunner>,
    server_socket: PathBuf,
    config_rank: Option<Rank>,
    log_mask: String,

    started: AtomicBool,
    ready: AtomicBool,
    waiting_format: AtomicBool,
    waiting_drpc: AtomicBool,
    stopping: AtomicBool,
    ever_started: AtomicBool,
    incarnation: AtomicU64,

    run_state: StdMutex<RunState>,
    last_exit: RwLock<Option<EngineExit>>,
    superblock: RwLock<Option<Superblock>>,
    uri: RwLock<String>,
    drpc: RwLock<Option<Arc<DrpcClient>>>,

    start_tx: mpsc::Sender<()>,
    ready_tx: mpsc::Sender<NotifyReadyReq>,
    inputs: Mutex<Option<LoopInputs>>,
    callbacks: Callbacks,
}

impl EngineInstance {
    pub fn new(
        idx: u32,
        storage: ScmStorage,
        runner: Arc<dyn EngineRunner>,
        server_socket: impl Into<PathBuf>,
    ) -> Self {
        let (start_tx, start) = mpsc::channel(1);
        let (ready_tx, ready) = mpsc::channel(1);
        Self {
            idx,
            storage,
            runner,
            server_socket: server_socket.into(),
            config_rank: None,
            log_mask: String::new(),
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            waiting_format: AtomicBool::new(false),
            waiting_drpc: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            ever_started: AtomicBool::new(false),
            incarnation: AtomicU64::new(0),
            run_state: StdMutex::new(RunState::default()),
            last_exit: RwLock::new(None),
            superblock: RwLock::new(None),
            uri: RwLock::new(String::new()),
            drpc: RwLock::new(None),
            start_tx,
            ready_tx,
            inputs: Mutex::new(Some(LoopInputs { start, ready })),
            callbacks: Callbacks::default(),
        }
    }

    /// Rank assigned out of band; written to the superblock on first start.
    pub fn with_config_rank(mut self, rank: Option<Rank>) -> Self {
        self.config_rank = rank;
        self
    }

    pub fn with_log_mask(mut self, mask: impl Into<String>) -> Self {
        self.log_mask = mask.into();
        self
    }

    pub fn with_join(mut self, join: JoinFn) -> Self {
        self.callbacks.join = Some(join);
        self
    }

    pub fn with_on_ready(mut self, f: ReadyFn) -> Self {
        self.callbacks.on_ready.push(f);
        self
    }

    pub fn with_on_exit(mut self, f: ExitFn) -> Self {
        self.callbacks.on_exit.push(f);
        self
    }

    pub fn with_on_storage_ready(mut self, f: StorageFn) -> Self {
        self.callbacks.on_storage_ready.push(f);
        self
    }

    pub fn with_on_await_format(mut self, f: StorageFn) -> Self {
        self.callbacks.on_await_format.push(f);
        self
    }

    pub fn index(&self) -> u32 {
        self.idx
    }

    pub fn storage(&self) -> &ScmStorage {
        &self.storage
    }

    pub fn log_mask(&self) -> &str {
        &self.log_mask
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_awaiting_format(&self) -> bool {
        self.waiting_format.load(Ordering::SeqCst)
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::SeqCst)
    }

    pub async fn rank(&self) -> Option<Rank> {
        self.superblock.read().await.as_ref().and_then(Superblock::valid_rank)
    }

    pub async fn uri(&self) -> String {
        self.uri.read().await.clone()
    }

    pub async fn last_exit(&self) -> Option<EngineExit> {
        self.last_exit.read().await.clone()
    }

    /// State derived from the instance flags.
    pub async fn local_state(&self) -> (MemberState, String) {
        if self.is_awaiting_format() {
            return (MemberState::AwaitFormat, String::new());
        }
        if !self.is_started() {
            let stop_requested = self.stopping.load(Ordering::SeqCst);
            return match self.last_exit().await {
                Some(exit) if !exit.is_clean() && !stop_requested => {
                    (MemberState::Errored, exit.to_string())
                }
                _ => (MemberState::Stopped, String::new()),
            };
        }
        if self.stopping.load(Ordering::SeqCst) {
            return (MemberState::Stopping, String::new());
        }
        if self.is_ready() {
            (MemberState::Ready, String::new())
        } else {
            (MemberState::Starting, String::new())
        }
    }

    /// Local state as a member result; unassigned instances report the nil rank.
    pub async fn local_result(&self) -> MemberResult {
        let rank = self.rank().await.unwrap_or(Rank::NIL);
        match self.local_state().await {
            (MemberState::Errored, msg) => MemberResult::errored(rank, MemberState::Errored, msg),
            (state, _) => MemberResult::new(rank, state),
        }
    }

    /// Ask the control loop to start the engine.
    ///
    /// Returns once the request is accepted, not once the engine is up. A
    /// request that arrives while a run is in progress is coalesced into a
    /// single restart after that run ends.
    pub async fn request_start(&self, ctx: &Context) -> EngineResult<()> {
        {
            let mut state = self.run_state();
            if state.active {
                if !state.restart_pending {
                    debug!(instance = self.idx, "start coalesced into restart");
                }
                state.restart_pending = true;
                return Ok(());
            }
            if state.start_pending {
                debug!(instance = self.idx, "start already queued");
                return Ok(());
            }
            state.start_pending = true;
        }
        let sent = match ctx.run(self.start_tx.send(())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(EngineError::LoopStopped(self.idx)),
            Err(e) => Err(e.into()),
        };
        if sent.is_err() {
            self.run_state().start_pending = false;
        }
        sent
    }

    /// Stop the running engine and start it again.
    pub async fn restart(&self, ctx: &Context) -> EngineResult<()> {
        if !self.ever_started.load(Ordering::SeqCst) {
            return Err(EngineError::NeverStarted(self.idx));
        }
        {
            let mut state = self.run_state();
            if state.active {
                state.restart_pending = true;
                drop(state);
                return self.signal(Signal::Terminate);
            }
        }
        self.request_start(ctx).await
    }

    /// Deliver `signal` to the engine process. Does not wait for it to exit.
    /// A restart queued during the current run is dropped.
    pub fn stop(&self, signal: Signal) -> EngineResult<()> {
        self.run_state().restart_pending = false;
        self.signal(signal)
    }

    fn signal(&self, signal: Signal) -> EngineResult<()> {
        if !self.is_started() {
            return Ok(());
        }
        self.stopping.store(true, Ordering::SeqCst);
        match self.runner.signal(signal) {
            Ok(()) | Err(EngineError::ProcessNotRunning) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn run_state(&self) -> MutexGuard<'_, RunState> {
        self.run_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Discard the superblock and the format marker. Only valid while the
    /// engine is not started; the next start waits for a new format.
    pub async fn remove_superblock(&self) -> EngineResult<()> {
        if self.is_started() {
            let rank = self.rank().await.unwrap_or(Rank::NIL);
            return Err(EngineError::InstanceStarted { rank });
        }
        self.storage.reset()?;
        *self.superblock.write().await = None;
        info!(instance = self.idx, "superblock removed");
        Ok(())
    }

    /// Route a readiness announcement from the engine to the control loop.
    pub fn notify_ready(&self, req: NotifyReadyReq) -> EngineResult<()> {
        if !self.waiting_drpc.load(Ordering::SeqCst) {
            warn!(instance = self.idx, "unexpected NotifyReady");
        }
        if let Err(e) = self.ready_tx.try_send(req) {
            warn!(instance = self.idx, error = %e, "dropping NotifyReady");
        }
        Ok(())
    }

    async fn drpc_client(&self) -> EngineResult<Arc<DrpcClient>> {
        if !self.is_ready() {
            return Err(EngineError::NotReady(self.idx));
        }
        self.drpc
            .read()
            .await
            .clone()
            .ok_or(EngineError::NotReady(self.idx))
    }

    /// Raw dRPC call; fails with `NotReady` unless the handshake has finished.
    pub async fn call_drpc(
        &self,
        ctx: &Context,
        method: Method,
        body: Vec<u8>,
    ) -> EngineResult<Response> {
        let client = self.drpc_client().await?;
        Ok(client.call(ctx, method, body).await?)
    }

    pub async fn request<R: DrpcRequest>(&self, ctx: &Context, req: &R) -> EngineResult<R::Reply> {
        let client = self.drpc_client().await?;
        Ok(client.request(ctx, req).await?)
    }

    /// The control loop. Runs until `ctx` is done; a running engine is
    /// killed on the way out.
    pub async fn run(self: Arc<Self>, ctx: Context) -> EngineResult<()> {
        let mut inputs = self
            .inputs
            .lock()
            .await
            .take()
            .ok_or(EngineError::LoopRunning(self.idx))?;
        debug!(instance = self.idx, "control loop started");

        loop {
            match ctx.run(inputs.start.recv()).await {
                Ok(Some(())) => {}
                Ok(None) | Err(_) => break,
            }

            {
                let mut state = self.run_state();
                state.start_pending = false;
                state.active = true;
            }
            let result = self.run_once(&ctx, &mut inputs.ready).await;
            let restart = {
                let mut state = self.run_state();
                state.active = false;
                let restart = std::mem::take(&mut state.restart_pending);
                state.start_pending |= restart;
                restart
            };

            if let Err(e) = result {
                if ctx.err().is_some() {
                    break;
                }
                error!(instance = self.idx, error = %e, "engine run failed");
                *self.last_exit.write().await = Some(EngineExit::Failed(e.to_string()));
            }
            if restart {
                info!(instance = self.idx, "restarting engine");
                let _ = self.start_tx.try_send(());
            }
        }

        while inputs.start.try_recv().is_ok() {}
        *self.run_state() = RunState::default();
        *self.inputs.lock().await = Some(inputs);
        debug!(instance = self.idx, "control loop stopped");
        Ok(())
    }

    async fn run_once(
        &self,
        ctx: &Context,
        ready_rx: &mut mpsc::Receiver<NotifyReadyReq>,
    ) -> EngineResult<()> {
        self.await_storage(ctx).await?;
        self.load_superblock().await?;

        while ready_rx.try_recv().is_ok() {}
        let env = LaunchEnv {
            instance_idx: self.idx,
            server_socket: self.server_socket.clone(),
        };
        let mut exit_rx = self.runner.start(&env)?;

        let incarnation = self.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_exit.write().await = None;
        self.stopping.store(false, Ordering::SeqCst);
        self.waiting_drpc.store(true, Ordering::SeqCst);
        self.ever_started.store(true, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        info!(instance = self.idx, incarnation, "engine starting");

        enum Launch {
            Ready(Option<NotifyReadyReq>),
            Exited(EngineExit),
            Done(ContextError),
        }

        let launch = tokio::select! {
            biased;
            exit = &mut exit_rx => Launch::Exited(lost_exit(exit)),
            notify = ready_rx.recv() => Launch::Ready(notify),
            err = ctx.done() => Launch::Done(err),
        };

        let mut startup_err = None;
        match launch {
            Launch::Exited(exit) => {
                self.handle_exit(exit.clone()).await?;
                return Err(EngineError::ExitedBeforeReady(exit.to_string()));
            }
            Launch::Done(err) => {
                self.shutdown_process(exit_rx).await;
                return Err(err.into());
            }
            Launch::Ready(None) => {
                startup_err = Some(EngineError::LoopStopped(self.idx));
            }
            Launch::Ready(Some(notify)) => {
                if let Err(e) = self.finish_startup(ctx, notify, incarnation).await {
                    startup_err = Some(e);
                }
            }
        }

        if let Some(e) = &startup_err {
            error!(instance = self.idx, error = %e, "engine setup failed; killing process");
            self.stopping.store(true, Ordering::SeqCst);
            if let Err(e) = self.runner.signal(Signal::Kill) {
                debug!(instance = self.idx, error = %e, "kill after failed setup");
            }
        }

        let exit = tokio::select! {
            exit = &mut exit_rx => Ok(lost_exit(exit)),
            err = ctx.done() => Err(err),
        };
        match exit {
            Ok(exit) => self.handle_exit(exit).await?,
            Err(err) => {
                self.shutdown_process(exit_rx).await;
                return Err(err.into());
            }
        }

        match startup_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn await_storage(&self, ctx: &Context) -> EngineResult<()> {
        if !self.storage.is_formatted() {
            self.waiting_format.store(true, Ordering::SeqCst);
            info!(
                instance = self.idx,
                mount = %self.storage.mount().display(),
                "storage not formatted; awaiting format"
            );

            let waited = async {
                for f in &self.callbacks.on_await_format {
                    f(self.idx).await.map_err(|e| callback_err("await-format", e))?;
                }
                self.storage.wait_formatted(ctx).await?;
                Ok::<_, EngineError>(())
            }
            .await;
            self.waiting_format.store(false, Ordering::SeqCst);
            waited?;
        }

        for f in &self.callbacks.on_storage_ready {
            f(self.idx).await.map_err(|e| callback_err("storage-ready", e))?;
        }
        Ok(())
    }

    async fn load_superblock(&self) -> EngineResult<()> {
        let mount = self.storage.mount();
        let mut sb = Superblock::read(mount)?.ok_or_else(|| self.missing_superblock())?;

        if let Some(rank) = self.config_rank {
            if sb.set_rank(rank)? {
                sb.write(mount)?;
                info!(instance = self.idx, %rank, "rank set from configuration");
            }
        }
        *self.superblock.write().await = Some(sb);
        Ok(())
    }

    fn missing_superblock(&self) -> EngineError {
        EngineError::SuperblockNotFound(Superblock::path(self.storage.mount()))
    }

    async fn finish_startup(
        &self,
        ctx: &Context,
        notify: NotifyReadyReq,
        incarnation: u64,
    ) -> EngineResult<()> {
        self.waiting_drpc.store(false, Ordering::SeqCst);
        debug!(instance = self.idx, socket = %notify.drpc_socket, "engine announced dRPC socket");

        let client = Arc::new(DrpcClient::new(&notify.drpc_socket));
        *self.drpc.write().await = Some(Arc::clone(&client));
        *self.uri.write().await = notify.uri.clone();

        let (rank, map_version) = self.resolve_rank(&notify.uri, incarnation).await?;
        client
            .request(ctx, &SetRankReq {
                rank: rank.get(),
                map_version,
            })
            .await?;
        client.request(ctx, &SetUpReq {}).await?;

        self.ready.store(true, Ordering::SeqCst);
        info!(instance = self.idx, %rank, incarnation, "engine ready");

        let info = ReadyInfo {
            idx: self.idx,
            rank,
            uri: notify.uri,
            incarnation,
        };
        for f in &self.callbacks.on_ready {
            if let Err(e) = f(info.clone()).await {
                self.ready.store(false, Ordering::SeqCst);
                return Err(callback_err("ready", e));
            }
        }
        Ok(())
    }

    /// Confirm or obtain the rank through the join collaborator. No lock is
    /// held while the join is in flight.
    async fn resolve_rank(&self, uri: &str, incarnation: u64) -> EngineResult<(Rank, u64)> {
        let (uuid, current) = {
            let guard = self.superblock.read().await;
            let sb = guard
                .as_ref()
                .ok_or_else(|| self.missing_superblock())?;
            (sb.uuid, sb.valid_rank())
        };

        let Some(join) = &self.callbacks.join else {
            let rank = current.ok_or(EngineError::NoRank(self.idx))?;
            return Ok((rank, 0));
        };

        let reply = join(JoinArgs {
            idx: self.idx,
            uuid,
            rank: current,
            uri: uri.to_string(),
            incarnation,
        })
        .await?;

        let mut guard = self.superblock.write().await;
        let sb = guard
            .as_mut()
            .ok_or_else(|| self.missing_superblock())?;
        if sb.set_rank(reply.rank)? {
            sb.write(self.storage.mount())?;
            info!(instance = self.idx, rank = %reply.rank, "rank assigned by join");
        }
        Ok((reply.rank, reply.map_version))
    }

    async fn handle_exit(&self, exit: EngineExit) -> EngineResult<()> {
        let rank = self.rank().await;
        self.ready.store(false, Ordering::SeqCst);
        self.waiting_drpc.store(false, Ordering::SeqCst);
        *self.last_exit.write().await = Some(exit.clone());
        warn!(
            instance = self.idx,
            rank = ?rank.map(|r| r.get()),
            %exit,
            "engine exited"
        );

        let event = InstanceExit {
            idx: self.idx,
            rank,
            incarnation: self.incarnation(),
            exit,
        };
        let mut result = Ok(());
        for f in &self.callbacks.on_exit {
            if let Err(e) = f(event.clone()).await {
                result = Err(callback_err("exit", e));
                break;
            }
        }

        if let Some(client) = self.drpc.write().await.take() {
            if let Err(e) = std::fs::remove_file(client.socket_path()) {
                debug!(instance = self.idx, error = %e, "engine socket not removed");
            }
        }
        self.started.store(false, Ordering::SeqCst);
        result
    }

    async fn shutdown_process(&self, exit_rx: oneshot::Receiver<EngineExit>) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = self.runner.signal(Signal::Kill) {
            debug!(instance = self.idx, error = %e, "kill on shutdown");
        }
        let exit = match tokio::time::timeout(SHUTDOWN_GRACE, exit_rx).await {
            Ok(exit) => lost_exit(exit),
            Err(_) => EngineExit::Failed("engine did not exit after kill".to_string()),
        };
        if let Err(e) = self.handle_exit(exit).await {
            warn!(instance = self.idx, error = %e, "exit handling failed during shutdown");
        }
    }
}

fn lost_exit(exit: Result<EngineExit, oneshot::error::RecvError>) -> EngineExit {
    exit.unwrap_or_else(|_| {
        EngineExit::Failed("engine runner dropped the exit channel".to_string())
    })
}

fn callback_err(event: &'static str, err: EngineError) -> EngineError {
    match err {
        EngineError::Callback { .. } | EngineError::Context(_) => err,
        other => EngineError::Callback {
            event,
            msg: other.to_string(),
        },
    }
}
