//! Session state machine governing disconnect, queue retention and revival.
//!
//! The protocol is pure: callers pass in the current time and apply the
//! returned decisions. [`DurableClient`](crate::DurableClient) owns one
//! instance behind a lock and drives it from connect, disconnect and revive.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::DurableError;
use crate::session::MAX_DURABLE_TIMEOUT_SECS;

/// Why the client lost its connection to the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
  /// Explicit close asking the server to keep the queue
  KeepAlive,
  /// Explicit close abandoning durability
  Close,
  /// Client process died without closing
  Crash,
  NetworkPartition,
  /// The transport reported the connection gone
  TransportLost,
}

impl DisconnectCause {
  /// Only an explicit non-keep-alive close declares the queue abandoned.
  pub fn discards_queue(self) -> bool {
    matches!(self, Self::Close)
  }
}

impl std::fmt::Display for DisconnectCause {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      DisconnectCause::KeepAlive => write!(f, "keep-alive close"),
      DisconnectCause::Close => write!(f, "close"),
      DisconnectCause::Crash => write!(f, "crash"),
      DisconnectCause::NetworkPartition => write!(f, "network partition"),
      DisconnectCause::TransportLost => write!(f, "transport lost"),
    }
  }
}

/// What a connection attempt should expect from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviveMode {
  /// Reclaim the retained queue and apply its compacted catch-up batch
  CatchUp,
  /// Start over: no replay, current values arrive from live traffic
  FreshSession,
}

/// Full session state, including deadlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
  /// Never connected
  Idle,
  Live,
  QueueRetained {
    deadline: Instant,
  },
  QueueDiscarded,
  Reviving {
    mode: ReviveMode,
    deadline: Option<Instant>,
    from: SessionPhase,
  },
  Expired,
  Closed,
}

/// State discriminant, used in status reports and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
  Idle,
  Live,
  QueueRetained,
  QueueDiscarded,
  Reviving,
  Expired,
  Closed,
}

impl std::fmt::Display for SessionPhase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SessionPhase::Idle => write!(f, "idle"),
      SessionPhase::Live => write!(f, "live"),
      SessionPhase::QueueRetained => write!(f, "queue-retained"),
      SessionPhase::QueueDiscarded => write!(f, "queue-discarded"),
      SessionPhase::Reviving => write!(f, "reviving"),
      SessionPhase::Expired => write!(f, "expired"),
      SessionPhase::Closed => write!(f, "closed"),
    }
  }
}

impl SessionState {
  pub fn phase(&self) -> SessionPhase {
    match self {
      SessionState::Idle => SessionPhase::Idle,
      SessionState::Live => SessionPhase::Live,
      SessionState::QueueRetained { .. } => SessionPhase::QueueRetained,
      SessionState::QueueDiscarded => SessionPhase::QueueDiscarded,
      SessionState::Reviving { .. } => SessionPhase::Reviving,
      SessionState::Expired => SessionPhase::Expired,
      SessionState::Closed => SessionPhase::Closed,
    }
  }
}

pub struct RevivalProtocol {
  timeout: Duration,
  state: SessionState,
}

impl RevivalProtocol {
  /// Timeouts above [`MAX_DURABLE_TIMEOUT_SECS`] are clamped to it.
  pub fn new(timeout: Duration) -> Self {
    Self {
      timeout: timeout.min(Duration::from_secs(MAX_DURABLE_TIMEOUT_SECS)),
      state: SessionState::Idle,
    }
  }

  pub fn state(&self) -> &SessionState {
    &self.state
  }

  pub fn phase(&self) -> SessionPhase {
    self.state.phase()
  }

  pub fn is_durable(&self) -> bool {
    !self.timeout.is_zero()
  }

  /// Retention deadline, if one is running.
  pub fn deadline(&self) -> Option<Instant> {
    match self.state {
      SessionState::QueueRetained { deadline } => Some(deadline),
      SessionState::Reviving { deadline, .. } => deadline,
      _ => None,
    }
  }

  /// Apply deadline expiry. The queue is gone once `now` reaches the
  /// deadline. Returns true if the state changed.
  pub fn refresh(&mut self, now: Instant) -> bool {
    if let SessionState::QueueRetained { deadline } = self.state {
      if now >= deadline {
        tracing::info!("Durable queue expired");
        self.state = SessionState::Expired;
        return true;
      }
    }
    false
  }

  /// Record loss of the primary connection.
  pub fn on_transport_lost(&mut self, cause: DisconnectCause, now: Instant) -> SessionPhase {
    match self.state {
      SessionState::Live => {
        self.state = if cause.discards_queue() || !self.is_durable() {
          SessionState::QueueDiscarded
        } else {
          SessionState::QueueRetained {
            deadline: now + self.timeout,
          }
        };
        tracing::info!(cause = %cause, phase = %self.phase(), "Session disconnected");
      }
      SessionState::Reviving { .. } => {
        self.fail_revive(now);
      }
      // Retained or discarded queues are not affected by further drops
      _ => {}
    }
    self.phase()
  }

  /// Start an application-requested revival.
  pub fn begin_revive(&mut self, now: Instant) -> Result<ReviveMode, DurableError> {
    self.refresh(now);
    let mode = match &self.state {
      SessionState::QueueRetained { .. } => ReviveMode::CatchUp,
      SessionState::Expired => ReviveMode::FreshSession,
      SessionState::Reviving { .. } => return Err(DurableError::RevivalInProgress),
      SessionState::QueueDiscarded => return Err(DurableError::RevivalUnavailable),
      SessionState::Closed => return Err(DurableError::Closed),
      SessionState::Idle | SessionState::Live => {
        return Err(DurableError::InvalidState {
          phase: self.phase(),
          operation: "revive",
        })
      }
    };
    self.enter_reviving(mode);
    Ok(mode)
  }

  /// Start a connect. A durable client connecting from `Idle` may find a queue
  /// retained by an earlier process, so it takes whatever catch-up the server
  /// holds.
  pub fn begin_connect(&mut self, now: Instant) -> Result<ReviveMode, DurableError> {
    self.refresh(now);
    let mode = match &self.state {
      SessionState::Idle | SessionState::QueueRetained { .. } => ReviveMode::CatchUp,
      SessionState::QueueDiscarded | SessionState::Expired => ReviveMode::FreshSession,
      SessionState::Reviving { .. } => return Err(DurableError::RevivalInProgress),
      SessionState::Closed => return Err(DurableError::Closed),
      SessionState::Live => {
        return Err(DurableError::InvalidState {
          phase: SessionPhase::Live,
          operation: "connect",
        })
      }
    };
    self.enter_reviving(mode);
    Ok(mode)
  }

  fn enter_reviving(&mut self, mode: ReviveMode) {
    let from = self.phase();
    let deadline = self.deadline();
    self.state = SessionState::Reviving {
      mode,
      deadline,
      from,
    };
    tracing::debug!(?mode, from = %from, "Session reviving");
  }

  /// Finish a revival or connect; the session is live again.
  pub fn complete_revive(&mut self) -> Result<ReviveMode, DurableError> {
    match self.state {
      SessionState::Reviving { mode, .. } => {
        self.state = SessionState::Live;
        tracing::info!(?mode, "Session live");
        Ok(mode)
      }
      _ => Err(DurableError::InvalidState {
        phase: self.phase(),
        operation: "complete revival",
      }),
    }
  }

  /// Abandon an in-flight revival, restoring the state it started from.
  pub fn fail_revive(&mut self, now: Instant) -> SessionPhase {
    if let SessionState::Reviving { deadline, from, .. } = self.state {
      self.state = match (from, deadline) {
        (SessionPhase::QueueRetained, Some(deadline)) => SessionState::QueueRetained { deadline },
        (SessionPhase::Expired, _) => SessionState::Expired,
        (SessionPhase::QueueDiscarded, _) => SessionState::QueueDiscarded,
        _ => SessionState::Idle,
      };
      self.refresh(now);
      tracing::debug!(phase = %self.phase(), "Revival abandoned");
    }
    self.phase()
  }

  /// Force the session into `Expired`, e.g. when registration replay could
  /// not finish within the remaining durable timeout.
  pub fn force_expire(&mut self) {
    if self.state != SessionState::Closed && self.state != SessionState::Expired {
      tracing::warn!(from = %self.phase(), "Session forced to expired");
      self.state = SessionState::Expired;
    }
  }

  /// Terminal transition; cancels any deadline.
  pub fn close(&mut self) {
    self.state = SessionState::Closed;
  }
}
