//! Cluster event bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use strata_core::{Rank, RankSet};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    /// An engine with an assigned rank exited.
    RankDown {
        rank: Rank,
        incarnation: u64,
        exit: String,
    },
    /// A graceful stop was aborted after prep shutdown failed.
    StopFailed { ranks: RankSet, msg: String },
}

impl ClusterEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterEvent::RankDown { .. } => "rank_down",
            ClusterEvent::StopFailed { .. } => "stop_failed",
        }
    }
}

/// Fan-out of cluster events to every subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: ClusterEvent) -> usize {
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(n) => {
                debug!(kind, receivers = n, "cluster event published");
                n
            }
            Err(_) => {
                debug!(kind, "cluster event dropped; no subscribers");
                0
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
