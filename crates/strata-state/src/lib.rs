//! strata-state — persistent membership store for Strata.
//!
//! Backed by [redb](https://docs.rs/redb). Member records are
//! JSON-serialized into a table keyed by rank; every committed change
//! bumps a monotonically increasing data version, which engines use to
//! order group map updates.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::Member;
