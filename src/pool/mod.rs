//! Redundant connection set and failover.

mod backoff;
mod connection_set;
mod failover;

pub use backoff::{Backoff, BackoffPolicy};
pub use connection_set::{select_promotion_candidate, ConnectReport, ConnectionSet};
pub use failover::{FailoverController, FailoverState, ReplayReport};
