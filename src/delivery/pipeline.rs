use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::SubscriptionListener;
use crate::interest::InterestRegistry;
use crate::types::{DeliveredEvent, DeliveryKind, EventOperation, RawEvent};

/// Local view of one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyState {
  /// Last delivered value; `None` after a destroy or while stale
  pub value: Option<serde_json::Value>,
  pub last_sequence: u64,
  pub durable: bool,
  /// Set after a revival for keys whose value was not carried across it
  pub stale: bool,
}

/// Outcome of offering one event to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyDecision {
  Applied,
  /// Sequence did not exceed the last applied one
  Duplicate { last_sequence: u64 },
  /// No registered interest covers the key
  NotInterested,
  /// Catch-up event for a key that is not durably registered
  SuppressedCatchUp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
  pub applied: u64,
  pub duplicates: u64,
  pub suppressed_catch_up: u64,
  pub not_interested: u64,
  pub catch_up_batches: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpReport {
  /// Events received before compaction
  pub received: usize,
  pub applied: usize,
  pub duplicates: usize,
  pub suppressed: usize,
}

/// The only component that mutates client-visible key state.
pub struct EventPipeline {
  registry: Arc<InterestRegistry>,
  // region -> key -> state
  keys: RwLock<HashMap<String, HashMap<String, KeyState>>>,
  listeners: RwLock<Vec<Arc<dyn SubscriptionListener>>>,
  stats: Mutex<DeliveryStats>,
  // Serializes apply + notify so listeners see each key in applied order
  serial: Mutex<()>,
}

impl EventPipeline {
  pub fn new(registry: Arc<InterestRegistry>) -> Self {
    Self {
      registry,
      keys: RwLock::new(HashMap::new()),
      listeners: RwLock::new(Vec::new()),
      stats: Mutex::new(DeliveryStats::default()),
      serial: Mutex::new(()),
    }
  }

  pub fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) {
    self.listeners.write().push(listener);
  }

  pub fn listener_count(&self) -> usize {
    self.listeners.read().len()
  }

  /// Apply one event and notify listeners if it changed local state.
  pub fn apply(&self, event: RawEvent, kind: DeliveryKind) -> ApplyDecision {
    let _serial = self.serial.lock();
    let Some(interest) = self.registry.snapshot().classify(&event.region, &event.key) else {
      self.stats.lock().not_interested += 1;
      tracing::trace!(region = %event.region, key = %event.key, "Event outside registered interests");
      return ApplyDecision::NotInterested;
    };
    let durable = interest.is_durable();

    if kind == DeliveryKind::CatchUp && !durable {
      self.stats.lock().suppressed_catch_up += 1;
      tracing::debug!(
        region = %event.region,
        key = %event.key,
        sequence = event.sequence,
        "Suppressed catch-up event for non-durable key"
      );
      return ApplyDecision::SuppressedCatchUp;
    }

    {
      let mut keys = self.keys.write();
      let region = keys.entry(event.region.clone()).or_default();
      if let Some(existing) = region.get(&event.key) {
        if event.sequence <= existing.last_sequence {
          let last_sequence = existing.last_sequence;
          drop(keys);
          self.stats.lock().duplicates += 1;
          tracing::debug!(
            region = %event.region,
            key = %event.key,
            sequence = event.sequence,
            last_sequence,
            "Duplicate event discarded"
          );
          return ApplyDecision::Duplicate { last_sequence };
        }
      }
      let value = match event.operation {
        EventOperation::Destroy => None,
        EventOperation::Create | EventOperation::Update => event.value.clone(),
      };
      region.insert(
        event.key.clone(),
        KeyState {
          value,
          last_sequence: event.sequence,
          durable,
          stale: false,
        },
      );
    }
    self.stats.lock().applied += 1;

    let delivered = DeliveredEvent::from_raw(event, durable, kind);
    let listeners = self.listeners.read().clone();
    for listener in &listeners {
      listener.on_event(&delivered);
    }
    ApplyDecision::Applied
  }

  /// Apply a catch-up batch. The batch is compacted to the latest event per
  /// key before delivery, so each durable key is observed at most once.
  pub fn apply_catch_up(&self, events: Vec<RawEvent>) -> CatchUpReport {
    let mut report = CatchUpReport {
      received: events.len(),
      ..Default::default()
    };
    let mut latest: BTreeMap<(String, String), RawEvent> = BTreeMap::new();
    for event in events {
      let slot = (event.region.clone(), event.key.clone());
      match latest.get(&slot) {
        Some(existing) if existing.sequence >= event.sequence => {}
        _ => {
          latest.insert(slot, event);
        }
      }
    }
    let mut batch: Vec<RawEvent> = latest.into_values().collect();
    batch.sort_by_key(|event| event.sequence);

    for event in batch {
      match self.apply(event, DeliveryKind::CatchUp) {
        ApplyDecision::Applied => report.applied += 1,
        ApplyDecision::Duplicate { .. } => report.duplicates += 1,
        ApplyDecision::SuppressedCatchUp | ApplyDecision::NotInterested => {
          report.suppressed += 1
        }
      }
    }
    self.stats.lock().catch_up_batches += 1;
    tracing::info!(
      received = report.received,
      applied = report.applied,
      duplicates = report.duplicates,
      suppressed = report.suppressed,
      "Catch-up delivery complete"
    );
    report
  }

  /// After a revival, values of non-durable keys are no longer trustworthy.
  pub fn mark_revived(&self) {
    let mut keys = self.keys.write();
    for state in keys.values_mut().flat_map(|region| region.values_mut()) {
      if !state.durable {
        state.value = None;
        state.stale = true;
      }
    }
  }

  /// A fresh session carries no guarantee for any key. Sequence counters are
  /// kept so late duplicates from the previous session are still rejected.
  pub fn reset_for_fresh_session(&self) {
    let mut keys = self.keys.write();
    for state in keys.values_mut().flat_map(|region| region.values_mut()) {
      state.stale = true;
      if !state.durable {
        state.value = None;
      }
    }
  }

  /// Forget keys of a destroyed region.
  pub fn clear_region(&self, region: &str) {
    self.keys.write().remove(region);
  }

  pub fn key_state(&self, region: &str, key: &str) -> Option<KeyState> {
    self.keys.read().get(region)?.get(key).cloned()
  }

  /// Current value of a key, if known and not stale.
  pub fn value(&self, region: &str, key: &str) -> Option<serde_json::Value> {
    self
      .key_state(region, key)
      .filter(|state| !state.stale)
      .and_then(|state| state.value)
  }

  pub fn stats(&self) -> DeliveryStats {
    *self.stats.lock()
  }
}
