//! Test doubles for engine supervision.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::error::{EngineError, EngineResult};
use crate::runner::{EngineExit, EngineRunner, LaunchEnv, Signal};

type StartHook = Box<dyn Fn(&LaunchEnv) + Send + Sync>;

/// Runner that launches nothing. Signals end the fake process immediately;
/// an optional hook runs on every launch (e.g. to announce readiness).
#[derive(Default)]
pub struct FakeRunner {
    exit_tx: Mutex<Option<oneshot::Sender<EngineExit>>>,
    signals: Mutex<Vec<Signal>>,
    launches: AtomicUsize,
    on_start: Option<StartHook>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_hook(hook: impl Fn(&LaunchEnv) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            on_start: Some(Box::new(hook)),
            ..Self::default()
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// End the fake process as if it exited on its own.
    pub fn exit(&self, exit: EngineExit) -> bool {
        let tx = self.exit_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        tx.is_some_and(|tx| tx.send(exit).is_ok())
    }
}

impl EngineRunner for FakeRunner {
    fn start(&self, env: &LaunchEnv) -> EngineResult<oneshot::Receiver<EngineExit>> {
        let (tx, rx) = oneshot::channel();
        *self.exit_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.on_start {
            hook(env);
        }
        Ok(rx)
    }

    fn signal(&self, signal: Signal) -> EngineResult<()> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner).push(signal);
        if self.exit(EngineExit::Signaled(signal.as_raw())) {
            Ok(())
        } else {
            Err(EngineError::ProcessNotRunning)
        }
    }

    fn is_running(&self) -> bool {
        self.exit_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}
