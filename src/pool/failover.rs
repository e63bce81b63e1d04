use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::backoff::{Backoff, BackoffPolicy};
use super::connection_set::ConnectionSet;
use crate::error::{DurableError, TransportError};
use crate::interest::InterestRegistry;
use crate::transport::{ConnectionHandle, RegistrationAck, Transport};
use crate::types::InterestEntry;

/// Failover state of the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverState {
  /// Not connected by choice (before connect, after disconnect or close)
  Disconnected,
  Stable {
    primary: String,
    secondaries: Vec<String>,
  },
  Promoting {
    failed_primary: String,
  },
  /// No primary; endpoint discovery is retried on a backoff schedule
  Degraded {
    since: Instant,
    attempts: u32,
  },
}

impl FailoverState {
  pub fn is_stable(&self) -> bool {
    matches!(self, Self::Stable { .. })
  }

  pub fn is_degraded(&self) -> bool {
    matches!(self, Self::Degraded { .. })
  }

  pub fn primary(&self) -> Option<&str> {
    match self {
      Self::Stable { primary, .. } => Some(primary),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
  /// Registry version the replay was taken from
  pub version: u64,
  pub sent: usize,
  pub retries: u32,
  pub rejected: Vec<(InterestEntry, String)>,
}

/// Drives promotion after primary loss and replays the interest registry to
/// whichever endpoint becomes primary.
pub struct FailoverController {
  client_id: String,
  registry: Arc<InterestRegistry>,
  transport: Arc<dyn Transport>,
  policy: BackoffPolicy,
  state: RwLock<FailoverState>,
  discovery: Mutex<Backoff>,
}

impl FailoverController {
  pub fn new(
    client_id: impl Into<String>,
    registry: Arc<InterestRegistry>,
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
  ) -> Self {
    Self {
      client_id: client_id.into(),
      registry,
      transport,
      discovery: Mutex::new(Backoff::new(policy.clone())),
      policy,
      state: RwLock::new(FailoverState::Disconnected),
    }
  }

  pub fn state(&self) -> FailoverState {
    self.state.read().clone()
  }

  pub fn mark_stable(&self, primary: &ConnectionHandle, secondaries: &[ConnectionHandle]) {
    *self.state.write() = FailoverState::Stable {
      primary: primary.address.clone(),
      secondaries: secondaries.iter().map(|c| c.address.clone()).collect(),
    };
  }

  pub fn reset_backoff(&self) {
    self.discovery.lock().reset();
  }

  pub fn mark_disconnected(&self) {
    *self.state.write() = FailoverState::Disconnected;
    self.discovery.lock().reset();
  }

  /// Enter or stay in `Degraded`, counting the attempt.
  pub fn mark_degraded(&self, now: Instant) -> u32 {
    let mut state = self.state.write();
    let attempts = match &*state {
      FailoverState::Degraded { attempts, .. } => attempts + 1,
      _ => 1,
    };
    let since = match &*state {
      FailoverState::Degraded { since, .. } => *since,
      _ => now,
    };
    *state = FailoverState::Degraded { since, attempts };
    attempts
  }

  /// Delay before the next endpoint discovery attempt or redundancy refill.
  pub fn next_retry_delay(&self) -> Duration {
    self.discovery.lock().next_delay()
  }

  /// Promote a secondary and replay interests to it. A candidate that fails
  /// the replay is dropped and the next one is tried.
  pub async fn handle_primary_loss(
    &self,
    set: &ConnectionSet,
    failed_primary: &str,
  ) -> Result<ConnectionHandle, DurableError> {
    *self.state.write() = FailoverState::Promoting {
      failed_primary: failed_primary.to_string(),
    };
    tracing::warn!(
      client_id = %self.client_id,
      failed_primary = %failed_primary,
      "Primary lost, promoting secondary"
    );
    loop {
      let candidate = match set.promote(failed_primary).await {
        Ok(conn) => conn,
        Err(e) => {
          let attempts = self.mark_degraded(Instant::now());
          tracing::warn!(
            client_id = %self.client_id,
            failed_primary = %failed_primary,
            attempts,
            "No secondary available, session degraded"
          );
          return Err(e);
        }
      };
      match self.replay_interests(&candidate, None).await {
        Ok(report) => {
          tracing::info!(
            client_id = %self.client_id,
            address = %candidate.address,
            sent = report.sent,
            version = report.version,
            "Interests replayed to new primary"
          );
          return Ok(candidate);
        }
        Err(e) => {
          tracing::warn!(address = %candidate.address, error = %e, "Replay to promoted primary failed");
          self.transport.abort_connection(&candidate).await;
          set.mark_lost(&candidate);
        }
      }
    }
  }

  /// Send every registered interest to `conn`, in snapshot order.
  ///
  /// Transport errors are retried with backoff. With a deadline, retrying
  /// stops with `RevivalExpired` as soon as the next attempt would land at or
  /// past it; without one, after the policy's retry limit.
  pub async fn replay_interests(
    &self,
    conn: &ConnectionHandle,
    deadline: Option<Instant>,
  ) -> Result<ReplayReport, DurableError> {
    let snapshot = self.registry.snapshot();
    let mut report = ReplayReport {
      version: snapshot.version(),
      ..Default::default()
    };
    let mut backoff = Backoff::new(self.policy.clone());

    for entry in snapshot.entries() {
      loop {
        let error = match self.transport.send_registration(conn, &entry).await {
          Ok(RegistrationAck::Ack) => {
            report.sent += 1;
            break;
          }
          Ok(RegistrationAck::Nack(reason)) => {
            tracing::warn!(
              address = %conn.address,
              region = %entry.region,
              pattern = %entry.pattern.describe(),
              reason = %reason,
              "Registration rejected during replay"
            );
            report.rejected.push((entry.clone(), reason));
            break;
          }
          Err(e) => e,
        };
        if matches!(
          error,
          TransportError::ConnectionLost { .. } | TransportError::Closed
        ) {
          return Err(error.into());
        }
        let delay = backoff.next_delay();
        match deadline {
          Some(deadline) if Instant::now() + delay >= deadline => {
            tracing::warn!(
              client_id = %self.client_id,
              error = %error,
              "Registration replay ran out of durable timeout"
            );
            return Err(DurableError::RevivalExpired {
              client_id: self.client_id.clone(),
            });
          }
          None if backoff.exhausted() => return Err(error.into()),
          _ => {}
        }
        report.retries += 1;
        tracing::debug!(address = %conn.address, error = %error, ?delay, "Retrying registration");
        tokio::time::sleep(delay).await;
      }
    }
    let rejected: Vec<InterestEntry> = report.rejected.iter().map(|(e, _)| e.clone()).collect();
    self.registry.confirm_replayed(&snapshot, &rejected);
    Ok(report)
  }
}
