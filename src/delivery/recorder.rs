use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;

use super::SubscriptionListener;
use crate::types::DeliveredEvent;

#[derive(Default)]
struct Recorded {
  events: Vec<DeliveredEvent>,
  last_values: HashMap<(String, String), Option<serde_json::Value>>,
}

/// Listener that keeps every delivered event for later inspection.
///
/// Handy for validating a session: how many events arrived, how often each
/// key was seen, and what value each key ended with.
#[derive(Default)]
pub struct EventRecorder {
  recorded: Mutex<Recorded>,
  notify: Notify,
}

impl EventRecorder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn count(&self) -> usize {
    self.recorded.lock().events.len()
  }

  pub fn count_for(&self, region: &str, key: &str) -> usize {
    self
      .recorded
      .lock()
      .events
      .iter()
      .filter(|e| e.region == region && e.key == key)
      .count()
  }

  pub fn events(&self) -> Vec<DeliveredEvent> {
    self.recorded.lock().events.clone()
  }

  pub fn events_for(&self, region: &str, key: &str) -> Vec<DeliveredEvent> {
    self
      .recorded
      .lock()
      .events
      .iter()
      .filter(|e| e.region == region && e.key == key)
      .cloned()
      .collect()
  }

  /// Value carried by the last event for a key. `Some(None)` means the last
  /// event was a destroy.
  pub fn last_value(&self, region: &str, key: &str) -> Option<Option<serde_json::Value>> {
    self
      .recorded
      .lock()
      .last_values
      .get(&(region.to_string(), key.to_string()))
      .cloned()
  }

  /// Number of distinct keys seen
  pub fn key_count(&self) -> usize {
    self.recorded.lock().last_values.len()
  }

  pub fn clear(&self) {
    let mut recorded = self.recorded.lock();
    recorded.events.clear();
    recorded.last_values.clear();
  }

  /// Wait until at least `count` events have been recorded. Returns false on
  /// timeout.
  pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
    let wait = async {
      loop {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.count() >= count {
          return;
        }
        notified.await;
      }
    };
    tokio::time::timeout(timeout, wait).await.is_ok()
  }
}

impl SubscriptionListener for EventRecorder {
  fn on_event(&self, event: &DeliveredEvent) {
    {
      let mut recorded = self.recorded.lock();
      recorded.last_values.insert(
        (event.region.clone(), event.key.clone()),
        event.value.clone(),
      );
      recorded.events.push(event.clone());
    }
    self.notify.notify_waiters();
  }
}
