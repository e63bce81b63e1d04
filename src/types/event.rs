use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cache operation carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOperation {
  Create,
  Update,
  Destroy,
}

impl std::fmt::Display for EventOperation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EventOperation::Create => write!(f, "create"),
      EventOperation::Update => write!(f, "update"),
      EventOperation::Destroy => write!(f, "destroy"),
    }
  }
}

/// An event as received from a server. Opaque beyond these fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
  pub region: String,
  pub key: String,
  pub operation: EventOperation,
  pub value: Option<serde_json::Value>,
  /// Per-key sequence number assigned by the server
  pub sequence: u64,
}

impl RawEvent {
  pub fn new(
    region: impl Into<String>,
    key: impl Into<String>,
    operation: EventOperation,
    value: Option<serde_json::Value>,
    sequence: u64,
  ) -> Self {
    Self {
      region: region.into(),
      key: key.into(),
      operation,
      value,
      sequence,
    }
  }
}

/// How an event reached the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryKind {
  /// Streamed while the session is live
  Live,
  /// Part of the compacted batch replayed after revival
  CatchUp,
}

/// An event applied to local state and handed to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredEvent {
  pub region: String,
  pub key: String,
  pub operation: EventOperation,
  pub value: Option<serde_json::Value>,
  pub durable: bool,
  pub kind: DeliveryKind,
  pub sequence: u64,
  pub applied_at: DateTime<Utc>,
}

impl DeliveredEvent {
  pub(crate) fn from_raw(event: RawEvent, durable: bool, kind: DeliveryKind) -> Self {
    Self {
      region: event.region,
      key: event.key,
      operation: event.operation,
      value: event.value,
      durable,
      kind,
      sequence: event.sequence,
      applied_at: Utc::now(),
    }
  }
}
