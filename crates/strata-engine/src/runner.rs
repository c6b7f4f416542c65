//! Engine process runner.
//!
//! [`EngineRunner`] is the seam between the instance state machine and the
//! operating system. [`ProcessRunner`] launches the configured binary with
//! `tokio::process` and delivers signals with `kill(2)`. Tests substitute
//! their own runner.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use strata_core::EngineConfig;

use crate::error::{EngineError, EngineResult};

pub const ENV_SERVER_SOCKET: &str = "STRATA_SERVER_SOCKET";
pub const ENV_INSTANCE_IDX: &str = "STRATA_INSTANCE_IDX";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful shutdown.
    Interrupt,
    Terminate,
    /// Immediate termination, no handshake.
    Kill,
}

impl Signal {
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// How an engine process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineExit {
    Exited(i32),
    Signaled(i32),
    /// The runner lost track of the process.
    Failed(String),
}

impl EngineExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, EngineExit::Exited(0))
    }
}

impl fmt::Display for EngineExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineExit::Exited(code) => write!(f, "exited with status {code}"),
            EngineExit::Signaled(sig) => write!(f, "killed by signal {sig}"),
            EngineExit::Failed(msg) => write!(f, "{msg}"),
        }
    }
}

/// Launch parameters the control process passes to every engine.
#[derive(Debug, Clone)]
pub struct LaunchEnv {
    pub instance_idx: u32,
    pub server_socket: PathBuf,
}

pub trait EngineRunner: Send + Sync {
    /// Launch the process. The receiver resolves when it exits.
    fn start(&self, env: &LaunchEnv) -> EngineResult<oneshot::Receiver<EngineExit>>;

    /// Deliver `signal` without waiting for the outcome.
    fn signal(&self, signal: Signal) -> EngineResult<()>;

    fn is_running(&self) -> bool;
}

/// Runs the engine binary from [`EngineConfig`] as a child process.
pub struct ProcessRunner {
    config: EngineConfig,
    /// 0 while no child is running.
    pid: Arc<AtomicU32>,
}

impl ProcessRunner {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            pid: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl EngineRunner for ProcessRunner {
    fn start(&self, env: &LaunchEnv) -> EngineResult<oneshot::Receiver<EngineExit>> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .env(ENV_SERVER_SOCKET, &env.server_socket)
            .env(ENV_INSTANCE_IDX, env.instance_idx.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(EngineError::Launch)?;
        let pid = child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);
        info!(
            instance = env.instance_idx,
            pid,
            binary = %self.config.binary.display(),
            "engine process launched"
        );

        let (exit_tx, exit_rx) = oneshot::channel();
        let pid_slot = Arc::clone(&self.pid);
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => match (status.code(), unix_signal(&status)) {
                    (Some(code), _) => EngineExit::Exited(code),
                    (None, Some(sig)) => EngineExit::Signaled(sig),
                    (None, None) => EngineExit::Failed(format!("unknown exit status {status}")),
                },
                Err(e) => EngineExit::Failed(format!("failed to wait for engine: {e}")),
            };
            pid_slot.store(0, Ordering::SeqCst);
            debug!(pid, %exit, "engine process reaped");
            let _ = exit_tx.send(exit);
        });

        Ok(exit_rx)
    }

    fn signal(&self, signal: Signal) -> EngineResult<()> {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return Err(EngineError::ProcessNotRunning);
        }
        let pid = libc::pid_t::try_from(pid).map_err(|_| EngineError::ProcessNotRunning)?;

        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, signal.as_raw()) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Err(EngineError::ProcessNotRunning);
            }
            warn!(pid, ?signal, error = %err, "failed to signal engine process");
            return Err(EngineError::Signal(err));
        }
        debug!(pid, ?signal, "signal delivered to engine process");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.pid.load(Ordering::SeqCst) != 0
    }
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(binary: &str, args: &[&str]) -> EngineConfig {
        EngineConfig {
            binary: binary.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            scm_mount: "/tmp".into(),
            rank: None,
            log_mask: String::new(),
        }
    }

    fn env() -> LaunchEnv {
        LaunchEnv {
            instance_idx: 0,
            server_socket: "/tmp/strata_server.sock".into(),
        }
    }

    #[test]
    fn signal_numbers() {
        assert_eq!(Signal::Interrupt.as_raw(), libc::SIGINT);
        assert_eq!(Signal::Kill.as_raw(), libc::SIGKILL);
    }

    #[test]
    fn signal_without_process_fails() {
        let runner = ProcessRunner::new(config("/bin/true", &[]));
        assert!(matches!(
            runner.signal(Signal::Terminate),
            Err(EngineError::ProcessNotRunning)
        ));
    }

    #[tokio::test]
    async fn reports_exit_code() {
        let runner = ProcessRunner::new(config("/bin/sh", &["-c", "exit 3"]));
        let exit = runner.start(&env()).unwrap().await.unwrap();
        assert_eq!(exit, EngineExit::Exited(3));
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn passes_launch_environment() {
        let runner = ProcessRunner::new(config(
            "/bin/sh",
            &["-c", "test \"$STRATA_INSTANCE_IDX\" = 0 && test -n \"$STRATA_SERVER_SOCKET\""],
        ));
        let exit = runner.start(&env()).unwrap().await.unwrap();
        assert!(exit.is_clean());
    }

    #[tokio::test]
    async fn kill_terminates_process() {
        let runner = ProcessRunner::new(config("/bin/sleep", &["30"]));
        let exit_rx = runner.start(&env()).unwrap();
        assert!(runner.is_running());
        runner.signal(Signal::Kill).unwrap();
        assert_eq!(exit_rx.await.unwrap(), EngineExit::Signaled(libc::SIGKILL));
    }

    #[test]
    fn missing_binary_fails_to_launch() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let runner = ProcessRunner::new(config("/nonexistent/strata_engine", &[]));
        let _guard = rt.enter();
        assert!(matches!(runner.start(&env()), Err(EngineError::Launch(_))));
    }
}
