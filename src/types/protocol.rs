use serde::{Deserialize, Serialize};

use super::{InterestEntry, InterestPattern, RawEvent};

/// Messages sent from the client to a server over the WebSocket transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
  Hello {
    id: String,
    durable_client_id: String,
    durable_timeout_secs: u64,
  },
  Register {
    id: String,
    entry: InterestEntry,
  },
  Unregister {
    id: String,
    region: String,
    pattern: InterestPattern,
  },
  MakePrimary {
    id: String,
  },
  ReadyForEvents {
    id: String,
  },
  Ping {
    id: String,
  },
  Close {
    id: String,
    keep_alive: bool,
  },
}

impl ClientMessage {
  pub fn id(&self) -> &str {
    match self {
      Self::Hello { id, .. }
      | Self::Register { id, .. }
      | Self::Unregister { id, .. }
      | Self::MakePrimary { id }
      | Self::ReadyForEvents { id }
      | Self::Ping { id }
      | Self::Close { id, .. } => id,
    }
  }
}

/// Messages sent from a server to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
  Ack { id: String },
  Nack { id: String, reason: String },
  CatchUp { id: String, events: Vec<RawEvent> },
  Event { event: RawEvent },
  Pong { id: String },
  Error { id: String, error: String },
}

impl ServerMessage {
  pub fn ack(id: impl Into<String>) -> Self {
    Self::Ack { id: id.into() }
  }
  pub fn nack(id: impl Into<String>, reason: impl Into<String>) -> Self {
    Self::Nack {
      id: id.into(),
      reason: reason.into(),
    }
  }
  pub fn catch_up(id: impl Into<String>, events: Vec<RawEvent>) -> Self {
    Self::CatchUp {
      id: id.into(),
      events,
    }
  }
  pub fn event(event: RawEvent) -> Self {
    Self::Event { event }
  }
  pub fn pong(id: impl Into<String>) -> Self {
    Self::Pong { id: id.into() }
  }
  pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
    Self::Error {
      id: id.into(),
      error: error.into(),
    }
  }

  /// Correlation id of a reply; pushed events have none.
  pub fn reply_id(&self) -> Option<&str> {
    match self {
      Self::Event { .. } => None,
      Self::Ack { id }
      | Self::Nack { id, .. }
      | Self::CatchUp { id, .. }
      | Self::Pong { id }
      | Self::Error { id, .. } => Some(id),
    }
  }
}
