use courier_core::ConsumeOptions;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the broker spreads tasks over the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Push tasks in strict rotation with no ack gating. Counts come out even,
    /// load does not: slow workers build a backlog while fast ones idle.
    RoundRobin,
    /// At most `prefetch` unacknowledged tasks per worker, acked after
    /// processing. Faster workers take proportionally more tasks.
    FairShare { prefetch: u16 },
}

impl DispatchPolicy {
    pub fn fair_share() -> Self {
        DispatchPolicy::FairShare { prefetch: 1 }
    }

    pub fn consume_options(&self) -> ConsumeOptions {
        match self {
            DispatchPolicy::RoundRobin => ConsumeOptions::auto_ack(),
            DispatchPolicy::FairShare { prefetch } => ConsumeOptions::manual((*prefetch).max(1)),
        }
    }

    pub fn acks_manually(&self) -> bool {
        matches!(self, DispatchPolicy::FairShare { .. })
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::fair_share()
    }
}

impl fmt::Display for DispatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchPolicy::RoundRobin => write!(f, "round-robin"),
            DispatchPolicy::FairShare { prefetch } => write!(f, "fair-share (prefetch {})", prefetch),
        }
    }
}
