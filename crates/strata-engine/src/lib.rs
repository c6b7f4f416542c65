//! strata-engine — supervision of the engine processes on one node.
//!
//! # Architecture
//!
//! ```text
//! RankControl ──▶ EngineHarness ──▶ EngineInstance ×N ──▶ EngineRunner
//!  (rank RPCs)     (owns loops,       (state machine,      (process,
//!                   NotifyReady)       superblock, dRPC)     signals)
//! ```
//!
//! - [`superblock`] — durable per-instance identity record
//! - [`storage`] — format marker and storage-ready notification
//! - [`runner`] — process launch and signal delivery
//! - [`instance`] — lifecycle state machine and callbacks
//! - [`harness`] — instance ownership and first-available dRPC
//! - [`ranks`] — node-side ping/prep-shutdown/stop/start/reset-format
//! - [`poll`] — convergence polling

pub mod error;
pub mod harness;
pub mod instance;
pub mod poll;
pub mod ranks;
pub mod runner;
pub mod storage;
pub mod superblock;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{EngineError, EngineResult};
pub use harness::{DrpcFailureFn, EngineHarness};
pub use instance::{
    EngineInstance, ExitFn, InstanceExit, JoinArgs, JoinFn, JoinReply, ReadyFn, ReadyInfo,
    StorageFn, callback,
};
pub use ranks::RankControl;
pub use runner::{EngineExit, EngineRunner, LaunchEnv, ProcessRunner, Signal};
pub use storage::ScmStorage;
pub use superblock::Superblock;
