//! Event delivery: per-key ordering, duplicate suppression and listener fan-out.

mod pipeline;
mod recorder;

pub use pipeline::{ApplyDecision, CatchUpReport, DeliveryStats, EventPipeline, KeyState};
pub use recorder::EventRecorder;

use crate::types::DeliveredEvent;

/// Callback invoked for every event applied to local state.
///
/// Called from the delivery task; implementations should return quickly and
/// must not call back into the pipeline's apply methods.
pub trait SubscriptionListener: Send + Sync {
  fn on_event(&self, event: &DeliveredEvent);
}

impl<F> SubscriptionListener for F
where
  F: Fn(&DeliveredEvent) + Send + Sync,
{
  fn on_event(&self, event: &DeliveredEvent) {
    self(event)
  }
}
