//! The cache transport the durable core drives.
//!
//! Serialization and the wire protocol belong to implementations; the core
//! only sees connection handles, acknowledgements and raw events.

mod memory;
#[cfg(feature = "ws")]
mod ws;

pub use memory::InMemoryGrid;
#[cfg(feature = "ws")]
pub use ws::WsTransport;

use async_trait::async_trait;
use std::fmt;

use crate::error::TransportError;
use crate::session::SessionIdentity;
use crate::types::{InterestEntry, InterestPattern, RawEvent};

/// Opaque handle to one open server connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
  pub id: u64,
  pub address: String,
}

impl fmt::Display for ConnectionHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.address, self.id)
  }
}

/// Server answer to a registration or unregistration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationAck {
  Ack,
  Nack(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
  /// Open a connection presenting the session identity.
  async fn open_connection(
    &self,
    address: &str,
    session: &SessionIdentity,
  ) -> Result<ConnectionHandle, TransportError>;

  async fn send_registration(
    &self,
    conn: &ConnectionHandle,
    entry: &InterestEntry,
  ) -> Result<RegistrationAck, TransportError>;

  async fn send_unregistration(
    &self,
    conn: &ConnectionHandle,
    region: &str,
    pattern: &InterestPattern,
  ) -> Result<RegistrationAck, TransportError>;

  /// Tell the server this connection now carries the event stream.
  async fn make_primary(&self, conn: &ConnectionHandle) -> Result<(), TransportError>;

  /// Declare readiness. Returns the retained catch-up batch; live events flow
  /// only after this call.
  async fn ready_for_events(&self, conn: &ConnectionHandle) -> Result<Vec<RawEvent>, TransportError>;

  /// Wait for the next events on a connection. An empty batch is allowed.
  async fn poll_events(&self, conn: &ConnectionHandle) -> Result<Vec<RawEvent>, TransportError>;

  async fn ping(&self, conn: &ConnectionHandle) -> Result<(), TransportError>;

  /// Graceful close. `keep_alive` asks the server to retain the durable queue.
  async fn close_connection(
    &self,
    conn: &ConnectionHandle,
    keep_alive: bool,
  ) -> Result<(), TransportError>;

  /// Drop a connection without telling the server anything.
  async fn abort_connection(&self, conn: &ConnectionHandle);
}
