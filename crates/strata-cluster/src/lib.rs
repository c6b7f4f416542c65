//! strata-cluster — system membership and cluster-wide rank operations.
//!
//! - [`membership`] — rank registry over the membership store: target
//!   resolution, result reconciliation, join, exclusion, group map
//! - [`fanout`] — per-host parallel dispatch, unresponsive synthesis,
//!   deduplication, and the two-phase system stop
//! - [`events`] — broadcast bus for rank exits and failed stops
//! - [`server`] — axum routers for the node and system control API
//! - [`transport`] — hyper client implementing [`fanout::HostInvoker`]

pub mod error;
pub mod events;
pub mod fanout;
pub mod membership;
pub mod server;
pub mod transport;

pub use error::{ClusterError, ClusterResult};
pub use events::{ClusterEvent, EventBus};
pub use fanout::{Coordinator, FanoutRequest, FanoutResponse, HostInvoker};
pub use membership::{JoinRequest, JoinResponse, Membership, Resolved};
pub use server::{
    ApiResponse, ExcludeReq, NodeState, SystemReq, SystemState, node_router, system_router,
};
pub use transport::HttpInvoker;
