//! strata-drpc — the private call protocol between the control process and
//! its engines.
//!
//! # Architecture
//!
//! ```text
//! control process                         engine process
//!   DrpcClient ──(engine socket)──────────▶ Mgmt handlers
//!     SetRank, SetUp, PrepShutdown, PingRank, GroupUpdate, SetLogMasks
//!
//!   DrpcServer ◀──(strata_server.sock)──── engine
//!     NotifyReady
//! ```
//!
//! Messages are one JSON object per line. Responses carry a two-valued
//! status; anything else is a protocol violation.

pub mod client;
pub mod error;
pub mod message;
pub mod payload;
pub mod server;

pub use client::DrpcClient;
pub use error::{DrpcError, DrpcResult};
pub use message::{Call, Method, Module, Response, Status};
pub use payload::*;
pub use server::{DrpcListener, DrpcServer, HandlerFn, handler, reply};
