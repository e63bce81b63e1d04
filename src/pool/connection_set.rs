use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::DurableError;
use crate::session::SessionIdentity;
use crate::transport::{ConnectionHandle, Transport};
use crate::types::{EndpointRole, EndpointStatus};

#[derive(Debug, Clone)]
struct Member {
  address: String,
  role: EndpointRole,
  conn: Option<ConnectionHandle>,
  last_contact: Option<Instant>,
  failures: u32,
}

/// Result of establishing the connection set.
#[derive(Debug, Clone)]
pub struct ConnectReport {
  pub primary: ConnectionHandle,
  pub secondaries: Vec<ConnectionHandle>,
  /// Set when fewer secondaries than the redundancy level could be opened
  pub shortfall: Option<DurableError>,
}

/// Sole owner of endpoint connections: one primary and up to
/// `redundancy_level` secondaries, each on a distinct server.
///
/// Callers serialize mutating operations; state is never locked across an
/// await.
pub struct ConnectionSet {
  transport: Arc<dyn Transport>,
  session: SessionIdentity,
  members: RwLock<Vec<Member>>,
  ping_timeout: Duration,
}

impl ConnectionSet {
  pub fn new(transport: Arc<dyn Transport>, session: SessionIdentity, pool: &PoolConfig) -> Self {
    let mut members: Vec<Member> = Vec::new();
    for address in &pool.endpoints {
      if members.iter().any(|m| &m.address == address) {
        continue;
      }
      members.push(Member {
        address: address.clone(),
        role: EndpointRole::Unavailable,
        conn: None,
        last_contact: None,
        failures: 0,
      });
    }
    Self {
      transport,
      session,
      members: RwLock::new(members),
      ping_timeout: pool.ping_timeout(),
    }
  }

  pub fn redundancy_level(&self) -> u32 {
    self.session.redundancy_level()
  }

  pub fn primary(&self) -> Option<ConnectionHandle> {
    self
      .members
      .read()
      .iter()
      .find(|m| m.role == EndpointRole::Primary)
      .and_then(|m| m.conn.clone())
  }

  pub fn secondaries(&self) -> Vec<ConnectionHandle> {
    self
      .members
      .read()
      .iter()
      .filter(|m| m.role == EndpointRole::Secondary)
      .filter_map(|m| m.conn.clone())
      .collect()
  }

  pub fn connections(&self) -> Vec<ConnectionHandle> {
    self
      .members
      .read()
      .iter()
      .filter_map(|m| m.conn.clone())
      .collect()
  }

  pub fn statuses(&self) -> Vec<EndpointStatus> {
    self
      .members
      .read()
      .iter()
      .map(|m| EndpointStatus {
        address: m.address.clone(),
        role: m.role,
        last_contact: m.last_contact,
      })
      .collect()
  }

  fn update<F>(&self, address: &str, apply: F)
  where
    F: FnOnce(&mut Member),
  {
    if let Some(member) = self.members.write().iter_mut().find(|m| m.address == address) {
      apply(member);
    }
  }

  /// Open the primary on the first reachable endpoint, then fill secondaries
  /// best-effort.
  pub async fn connect(&self) -> Result<ConnectReport, DurableError> {
    self.abort_all().await;
    let candidates: Vec<String> = self.members.read().iter().map(|m| m.address.clone()).collect();
    if candidates.is_empty() {
      return Err(DurableError::NotConnected("no endpoints configured".into()));
    }

    let mut failures = Vec::new();
    let mut primary = None;
    for address in candidates {
      let conn = match self.transport.open_connection(&address, &self.session).await {
        Ok(conn) => conn,
        Err(e) => {
          tracing::debug!(address = %address, error = %e, "Endpoint unreachable");
          self.update(&address, |m| m.failures += 1);
          failures.push(e.to_string());
          continue;
        }
      };
      if let Err(e) = self.transport.make_primary(&conn).await {
        tracing::debug!(address = %address, error = %e, "Endpoint refused primary role");
        self.transport.abort_connection(&conn).await;
        failures.push(e.to_string());
        continue;
      }
      let now = Instant::now();
      self.update(&address, |m| {
        m.role = EndpointRole::Primary;
        m.conn = Some(conn.clone());
        m.last_contact = Some(now);
        m.failures = 0;
      });
      tracing::info!(
        client_id = %self.session.durable_client_id(),
        address = %address,
        "Primary connection established"
      );
      primary = Some(conn);
      break;
    }

    let Some(primary) = primary else {
      return Err(DurableError::NotConnected(failures.join("; ")));
    };
    let shortfall = self.fill_secondaries().await;
    Ok(ConnectReport {
      primary,
      secondaries: self.secondaries(),
      shortfall,
    })
  }

  /// Open secondaries on unused endpoints until the redundancy level is met.
  /// Returns the shortfall, if any; it is never fatal.
  pub async fn fill_secondaries(&self) -> Option<DurableError> {
    let requested = self.redundancy_level();
    let mut live = self.secondaries().len();
    let spare: Vec<String> = self
      .members
      .read()
      .iter()
      .filter(|m| m.conn.is_none())
      .map(|m| m.address.clone())
      .collect();

    for address in spare {
      if live >= requested as usize {
        break;
      }
      match self.transport.open_connection(&address, &self.session).await {
        Ok(conn) => {
          let now = Instant::now();
          self.update(&address, |m| {
            m.role = EndpointRole::Secondary;
            m.conn = Some(conn);
            m.last_contact = Some(now);
            m.failures = 0;
          });
          live += 1;
          tracing::debug!(address = %address, "Secondary connection established");
        }
        Err(e) => {
          self.update(&address, |m| m.failures += 1);
          tracing::debug!(address = %address, error = %e, "Secondary unreachable");
        }
      }
    }

    if live < requested as usize {
      let degraded = DurableError::RedundancyDegraded {
        requested,
        available: live,
      };
      tracing::warn!(
        client_id = %self.session.durable_client_id(),
        requested,
        available = live,
        "Redundancy level not met"
      );
      Some(degraded)
    } else {
      None
    }
  }

  /// Forget a connection after it failed. Returns the role it held, or None
  /// if it was already gone.
  pub fn mark_lost(&self, conn: &ConnectionHandle) -> Option<EndpointRole> {
    let mut members = self.members.write();
    let member = members
      .iter_mut()
      .find(|m| m.conn.as_ref().map(|c| c.id) == Some(conn.id))?;
    let role = member.role;
    member.role = EndpointRole::Unavailable;
    member.conn = None;
    member.failures += 1;
    Some(role)
  }

  /// Ping every open connection. Failed ones are aborted, marked lost and
  /// returned with the role they held.
  pub async fn check_liveness(&self) -> Vec<(ConnectionHandle, EndpointRole)> {
    let mut lost = Vec::new();
    for conn in self.connections() {
      let alive = matches!(
        tokio::time::timeout(self.ping_timeout, self.transport.ping(&conn)).await,
        Ok(Ok(()))
      );
      if alive {
        let now = Instant::now();
        self.update(&conn.address, |m| m.last_contact = Some(now));
        continue;
      }
      tracing::warn!(address = %conn.address, "Liveness check failed");
      self.transport.abort_connection(&conn).await;
      if let Some(role) = self.mark_lost(&conn) {
        lost.push((conn, role));
      }
    }
    lost
  }

  /// Promote the best secondary after the primary at `failed_primary` was
  /// lost. Secondaries that refuse are dropped and the next is tried.
  pub async fn promote(&self, failed_primary: &str) -> Result<ConnectionHandle, DurableError> {
    loop {
      let candidates: Vec<(ConnectionHandle, Option<Instant>)> = self
        .members
        .read()
        .iter()
        .filter(|m| m.role == EndpointRole::Secondary)
        .filter_map(|m| m.conn.clone().map(|c| (c, m.last_contact)))
        .collect();
      let ranked: Vec<(&str, Option<Instant>)> = candidates
        .iter()
        .map(|(c, contact)| (c.address.as_str(), *contact))
        .collect();
      let Some(index) = select_promotion_candidate(&ranked) else {
        return Err(DurableError::PromotionFailed {
          failed_primary: failed_primary.to_string(),
        });
      };
      let conn = candidates[index].0.clone();
      match self.transport.make_primary(&conn).await {
        Ok(()) => {
          self.update(&conn.address, |m| m.role = EndpointRole::Primary);
          tracing::info!(
            failed_primary = %failed_primary,
            new_primary = %conn.address,
            "Secondary promoted to primary"
          );
          return Ok(conn);
        }
        Err(e) => {
          tracing::warn!(address = %conn.address, error = %e, "Promotion candidate failed");
          self.transport.abort_connection(&conn).await;
          self.mark_lost(&conn);
        }
      }
    }
  }

  /// Graceful close of every connection, primary last.
  pub async fn close_all(&self, keep_alive: bool) {
    let mut conns = self.take_all();
    conns.sort_by_key(|(_, role)| *role == EndpointRole::Primary);
    for (conn, _) in conns {
      if let Err(e) = self.transport.close_connection(&conn, keep_alive).await {
        tracing::debug!(address = %conn.address, error = %e, "Close failed");
      }
    }
  }

  /// Open a short-lived connection only to close it without keep-alive, so
  /// the servers drop a queue retained after an earlier keep-alive close.
  /// Returns false if no endpoint could be reached.
  pub async fn discard_retained_queue(&self) -> bool {
    let candidates: Vec<String> = self.members.read().iter().map(|m| m.address.clone()).collect();
    for address in candidates {
      let conn = match self.transport.open_connection(&address, &self.session).await {
        Ok(conn) => conn,
        Err(e) => {
          tracing::debug!(address = %address, error = %e, "Endpoint unreachable");
          continue;
        }
      };
      match self.transport.close_connection(&conn, false).await {
        Ok(()) => return true,
        Err(e) => tracing::debug!(address = %address, error = %e, "Close failed"),
      }
    }
    false
  }

  /// Drop every connection without a close handshake.
  pub async fn abort_all(&self) {
    for (conn, _) in self.take_all() {
      self.transport.abort_connection(&conn).await;
    }
  }

  fn take_all(&self) -> Vec<(ConnectionHandle, EndpointRole)> {
    let mut members = self.members.write();
    members
      .iter_mut()
      .filter_map(|m| {
        let conn = m.conn.take()?;
        let role = std::mem::replace(&mut m.role, EndpointRole::Unavailable);
        Some((conn, role))
      })
      .collect()
  }
}

/// Pick the secondary with the most recent successful contact; ties go to the
/// lowest address.
pub fn select_promotion_candidate(candidates: &[(&str, Option<Instant>)]) -> Option<usize> {
  candidates
    .iter()
    .enumerate()
    .max_by(|(_, (addr_a, seen_a)), (_, (addr_b, seen_b))| {
      seen_a.cmp(seen_b).then_with(|| addr_b.cmp(addr_a))
    })
    .map(|(index, _)| index)
}
