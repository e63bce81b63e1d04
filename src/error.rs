//! Error taxonomy for the durable client.

use thiserror::Error;

use crate::revival::SessionPhase;

/// Errors raised by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
  #[error("failed to connect to {address}: {reason}")]
  ConnectFailed { address: String, reason: String },
  #[error("connection to {address} lost")]
  ConnectionLost { address: String },
  #[error("request to {address} timed out")]
  Timeout { address: String },
  #[error("protocol error: {0}")]
  Protocol(String),
  #[error("connection closed")]
  Closed,
}

/// Errors surfaced by the durable client API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurableError {
  /// No endpoint could be reached. Retryable.
  #[error("no reachable endpoint: {0}")]
  NotConnected(String),

  /// The interest pattern is malformed. Fatal to the call, not to the session.
  #[error("invalid interest pattern `{pattern}`: {reason}")]
  InvalidPattern { pattern: String, reason: String },

  /// Revival was attempted after the durable timeout elapsed. The client has
  /// fallen back to a fresh session; updates from the missed interval are lost.
  #[error("durable queue for `{client_id}` expired before revival")]
  RevivalExpired { client_id: String },

  /// Fewer secondaries than requested are available. Warning level.
  #[error("redundancy degraded: {available} of {requested} secondaries available")]
  RedundancyDegraded { requested: u32, available: usize },

  /// Primary was lost and no secondary could be promoted.
  #[error("no secondary available to promote after losing {failed_primary}")]
  PromotionFailed { failed_primary: String },

  #[error("a revival is already in progress")]
  RevivalInProgress,

  /// The server-side queue was discarded (explicit close or non-durable
  /// client); only a fresh `connect()` is possible.
  #[error("durable queue was discarded; reconnect with a fresh session")]
  RevivalUnavailable,

  #[error("cannot {operation} while session is {phase}")]
  InvalidState {
    phase: SessionPhase,
    operation: &'static str,
  },

  #[error("registration rejected by {address}: {reason}")]
  RegistrationRejected { address: String, reason: String },

  #[error("client is closed")]
  Closed,

  #[error("invalid configuration: {0}")]
  Config(String),

  #[error(transparent)]
  Transport(#[from] TransportError),
}

impl DurableError {
  /// Whether retrying the same call later may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Self::NotConnected(_)
        | Self::PromotionFailed { .. }
        | Self::RevivalInProgress
        | Self::Transport(_)
    )
  }

  /// Warning-level conditions the session keeps running through.
  pub fn is_warning(&self) -> bool {
    matches!(
      self,
      Self::RedundancyDegraded { .. } | Self::PromotionFailed { .. }
    )
  }
}
