//! strata-core — shared types for the Strata control plane.
//!
//! - [`rank`] — `Rank` and `RankSet` with `"0-3,6"` range strings
//! - [`hostlist`] — `HostSet` with `node[1-3]:10001` bracket notation
//! - [`context`] — cancellation and deadlines for blocking operations
//! - [`types`] — member states, per-rank results, rank RPC requests, group map
//! - [`config`] — strata.toml parsing and validation

pub mod config;
pub mod context;
pub mod hostlist;
pub mod rank;
pub mod types;

pub use config::{ConfigError, EngineConfig, ServerConfig};
pub use context::{Context, ContextError};
pub use hostlist::{HostParseError, HostSet};
pub use rank::{Rank, RankParseError, RankSet};
pub use types::*;
