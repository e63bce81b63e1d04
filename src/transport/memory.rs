use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{ConnectionHandle, RegistrationAck, Transport};
use crate::error::TransportError;
use crate::session::SessionIdentity;
use crate::types::{EventOperation, InterestEntry, InterestPattern, RawEvent};

#[derive(Default)]
struct ServerState {
  alive: bool,
  registrations: Vec<InterestEntry>,
  failing_registrations: usize,
}

struct ConnectionState {
  address: String,
  client_id: String,
}

struct ServerInterest {
  entry: InterestEntry,
  regex: Option<Regex>,
}

impl ServerInterest {
  fn matches(&self, event: &RawEvent) -> bool {
    if self.entry.region != event.region {
      return false;
    }
    match (&self.entry.pattern, &self.regex) {
      (InterestPattern::Keys(keys), _) => keys.contains(&event.key),
      (InterestPattern::Regex(_), Some(regex)) => regex.is_match(&event.key),
      (InterestPattern::Regex(_), None) => false,
    }
  }
}

/// Server-side durable queue shared by every server the client connects to.
struct DurableSession {
  timeout: Duration,
  connections: BTreeSet<u64>,
  primary: Option<u64>,
  ready: bool,
  interests: Vec<ServerInterest>,
  live: VecDeque<RawEvent>,
  retained: BTreeMap<(String, String), RawEvent>,
  retained_until: Option<Instant>,
}

impl DurableSession {
  fn new(timeout: Duration) -> Self {
    Self {
      timeout,
      connections: BTreeSet::new(),
      primary: None,
      ready: false,
      interests: Vec::new(),
      live: VecDeque::new(),
      retained: BTreeMap::new(),
      retained_until: None,
    }
  }

  fn expired(&self, now: Instant) -> bool {
    matches!(self.retained_until, Some(until) if now >= until)
  }

  fn matches(&self, event: &RawEvent) -> Option<bool> {
    let mut found = None;
    for interest in self.interests.iter().filter(|i| i.matches(event)) {
      if interest.entry.durable {
        return Some(true);
      }
      found = Some(false);
    }
    found
  }

  fn retain(&mut self, event: RawEvent) {
    let slot = (event.region.clone(), event.key.clone());
    match self.retained.get(&slot) {
      Some(existing) if existing.sequence >= event.sequence => {}
      _ => {
        self.retained.insert(slot, event);
      }
    }
  }
}

#[derive(Default)]
struct GridState {
  servers: BTreeMap<String, ServerState>,
  sessions: HashMap<String, DurableSession>,
  connections: HashMap<u64, ConnectionState>,
  next_connection: u64,
  sequences: HashMap<(String, String), u64>,
}

impl GridState {
  fn connection(&self, conn: &ConnectionHandle) -> Result<&ConnectionState, TransportError> {
    self
      .connections
      .get(&conn.id)
      .ok_or_else(|| TransportError::ConnectionLost {
        address: conn.address.clone(),
      })
  }

  fn session_for(&mut self, conn: &ConnectionHandle) -> Result<&mut DurableSession, TransportError> {
    let client_id = self.connection(conn)?.client_id.clone();
    self
      .sessions
      .get_mut(&client_id)
      .ok_or(TransportError::Closed)
  }

  fn purge_expired(&mut self, now: Instant) {
    self.sessions.retain(|client_id, session| {
      let keep = !session.expired(now);
      if !keep {
        tracing::debug!(client_id = %client_id, "Grid discarded expired durable queue");
      }
      keep
    });
  }

  /// Remove a connection from its session. The last detach either retains the
  /// queue for the session's timeout or discards it.
  fn detach(&mut self, conn_id: u64, discard: bool, now: Instant) {
    let Some(conn) = self.connections.remove(&conn_id) else {
      return;
    };
    let Some(session) = self.sessions.get_mut(&conn.client_id) else {
      return;
    };
    session.connections.remove(&conn_id);
    if session.primary == Some(conn_id) {
      session.primary = None;
    }
    if !session.connections.is_empty() {
      return;
    }
    if discard || session.timeout.is_zero() {
      self.sessions.remove(&conn.client_id);
      tracing::debug!(client_id = %conn.client_id, "Grid discarded durable queue");
      return;
    }
    session.ready = false;
    session.interests.retain(|i| i.entry.durable);
    let pending: Vec<RawEvent> = session.live.drain(..).collect();
    for event in pending {
      if session.matches(&event) == Some(true) {
        session.retain(event);
      }
    }
    // No representable deadline means the queue is kept until reclaimed
    session.retained_until = now.checked_add(session.timeout);
    tracing::debug!(client_id = %conn.client_id, "Grid retaining durable queue");
  }

  fn dispatch(&mut self, event: RawEvent, now: Instant) {
    self.purge_expired(now);
    for session in self.sessions.values_mut() {
      match session.matches(&event) {
        Some(_) if !session.connections.is_empty() => session.live.push_back(event.clone()),
        Some(true) => session.retain(event.clone()),
        _ => {}
      }
    }
  }

  fn next_sequence(&mut self, region: &str, key: &str) -> u64 {
    let counter = self
      .sequences
      .entry((region.to_string(), key.to_string()))
      .or_insert(0);
    *counter += 1;
    *counter
  }
}

/// In-process grid of cache servers implementing [`Transport`].
///
/// Servers can be killed and restarted, durable queues are compacted to the
/// last value per key while a client is away and expire after its timeout.
/// Every registration a server receives is logged so callers can check what a
/// failover replayed.
#[derive(Default)]
pub struct InMemoryGrid {
  state: Mutex<GridState>,
  notify: Notify,
}

impl InMemoryGrid {
  pub fn new() -> Self {
    Self::default()
  }

  /// Grid with one running server per address.
  pub fn with_servers<I, S>(addresses: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let grid = Self::new();
    for address in addresses {
      grid.add_server(address);
    }
    grid
  }

  pub fn add_server(&self, address: impl Into<String>) {
    let address = address.into();
    self.state.lock().servers.insert(
      address,
      ServerState {
        alive: true,
        ..Default::default()
      },
    );
  }

  /// Stop a server. Its connections drop as if the process died.
  pub fn kill_server(&self, address: &str) {
    let now = Instant::now();
    {
      let mut state = self.state.lock();
      if let Some(server) = state.servers.get_mut(address) {
        server.alive = false;
      }
      let doomed: Vec<u64> = state
        .connections
        .iter()
        .filter(|(_, c)| c.address == address)
        .map(|(id, _)| *id)
        .collect();
      for id in doomed {
        state.detach(id, false, now);
      }
    }
    tracing::debug!(address = %address, "Grid server killed");
    self.notify.notify_waiters();
  }

  pub fn start_server(&self, address: &str) {
    if let Some(server) = self.state.lock().servers.get_mut(address) {
      server.alive = true;
    }
  }

  /// Create or update a key, returning the sequence assigned to the event.
  pub fn put(&self, region: &str, key: &str, value: serde_json::Value) -> u64 {
    self.publish(region, key, EventOperation::Update, Some(value))
  }

  pub fn destroy(&self, region: &str, key: &str) -> u64 {
    self.publish(region, key, EventOperation::Destroy, None)
  }

  fn publish(
    &self,
    region: &str,
    key: &str,
    operation: EventOperation,
    value: Option<serde_json::Value>,
  ) -> u64 {
    let now = Instant::now();
    let sequence = {
      let mut state = self.state.lock();
      let sequence = state.next_sequence(region, key);
      let operation = match operation {
        EventOperation::Update if sequence == 1 => EventOperation::Create,
        other => other,
      };
      state.dispatch(RawEvent::new(region, key, operation, value, sequence), now);
      sequence
    };
    self.notify.notify_waiters();
    sequence
  }

  /// Queue an event verbatim on a connected session, bypassing sequencing.
  pub fn push_raw(&self, client_id: &str, event: RawEvent) {
    if let Some(session) = self.state.lock().sessions.get_mut(client_id) {
      session.live.push_back(event);
    }
    self.notify.notify_waiters();
  }

  /// Registrations a server has received, in arrival order.
  pub fn registrations(&self, address: &str) -> Vec<InterestEntry> {
    self
      .state
      .lock()
      .servers
      .get(address)
      .map(|s| s.registrations.clone())
      .unwrap_or_default()
  }

  /// Make the next `count` registrations on a server time out.
  pub fn fail_registrations(&self, address: &str, count: usize) {
    if let Some(server) = self.state.lock().servers.get_mut(address) {
      server.failing_registrations = count;
    }
  }

  pub fn session_exists(&self, client_id: &str) -> bool {
    let now = Instant::now();
    let mut state = self.state.lock();
    state.purge_expired(now);
    state.sessions.contains_key(client_id)
  }

  /// Number of keys retained for a disconnected durable client.
  pub fn retained_len(&self, client_id: &str) -> usize {
    self
      .state
      .lock()
      .sessions
      .get(client_id)
      .map(|s| s.retained.len())
      .unwrap_or(0)
  }

  /// Interests the grid currently holds for a client.
  pub fn session_interests(&self, client_id: &str) -> Vec<InterestEntry> {
    self
      .state
      .lock()
      .sessions
      .get(client_id)
      .map(|s| s.interests.iter().map(|i| i.entry.clone()).collect())
      .unwrap_or_default()
  }

  pub fn connection_count(&self, address: &str) -> usize {
    self
      .state
      .lock()
      .connections
      .values()
      .filter(|c| c.address == address)
      .count()
  }

  fn check_alive(state: &GridState, conn: &ConnectionHandle) -> Result<(), TransportError> {
    state.connection(conn)?;
    match state.servers.get(&conn.address) {
      Some(server) if server.alive => Ok(()),
      _ => Err(TransportError::ConnectionLost {
        address: conn.address.clone(),
      }),
    }
  }
}

#[async_trait]
impl Transport for InMemoryGrid {
  async fn open_connection(
    &self,
    address: &str,
    session: &SessionIdentity,
  ) -> Result<ConnectionHandle, TransportError> {
    let now = Instant::now();
    let mut state = self.state.lock();
    match state.servers.get(address) {
      Some(server) if server.alive => {}
      Some(_) => {
        return Err(TransportError::ConnectFailed {
          address: address.to_string(),
          reason: "server unavailable".into(),
        })
      }
      None => {
        return Err(TransportError::ConnectFailed {
          address: address.to_string(),
          reason: "unknown server".into(),
        })
      }
    }
    state.purge_expired(now);

    state.next_connection += 1;
    let id = state.next_connection;
    let client_id = session.durable_client_id().to_string();
    state.connections.insert(
      id,
      ConnectionState {
        address: address.to_string(),
        client_id: client_id.clone(),
      },
    );
    let durable = state
      .sessions
      .entry(client_id)
      .or_insert_with(|| DurableSession::new(session.durable_timeout()));
    durable.timeout = session.durable_timeout();
    durable.connections.insert(id);
    durable.retained_until = None;

    Ok(ConnectionHandle {
      id,
      address: address.to_string(),
    })
  }

  async fn send_registration(
    &self,
    conn: &ConnectionHandle,
    entry: &InterestEntry,
  ) -> Result<RegistrationAck, TransportError> {
    let mut state = self.state.lock();
    Self::check_alive(&state, conn)?;
    if let Some(server) = state.servers.get_mut(&conn.address) {
      if server.failing_registrations > 0 {
        server.failing_registrations -= 1;
        return Err(TransportError::Timeout {
          address: conn.address.clone(),
        });
      }
      server.registrations.push(entry.clone());
    }

    let regex = match &entry.pattern {
      InterestPattern::Regex(expr) => match Regex::new(&format!("^(?:{})$", expr)) {
        Ok(regex) => Some(regex),
        Err(e) => return Ok(RegistrationAck::Nack(e.to_string())),
      },
      InterestPattern::Keys(_) => None,
    };
    let session = state.session_for(conn)?;
    session
      .interests
      .retain(|i| !(i.entry.region == entry.region && i.entry.pattern == entry.pattern));
    session.interests.push(ServerInterest {
      entry: entry.clone(),
      regex,
    });
    Ok(RegistrationAck::Ack)
  }

  async fn send_unregistration(
    &self,
    conn: &ConnectionHandle,
    region: &str,
    pattern: &InterestPattern,
  ) -> Result<RegistrationAck, TransportError> {
    let mut state = self.state.lock();
    Self::check_alive(&state, conn)?;
    let session = state.session_for(conn)?;
    match pattern {
      InterestPattern::Keys(keys) => {
        for interest in session.interests.iter_mut() {
          if interest.entry.region != region {
            continue;
          }
          if let InterestPattern::Keys(held) = &mut interest.entry.pattern {
            held.retain(|k| !keys.contains(k));
          }
        }
        session.interests.retain(|i| match &i.entry.pattern {
          InterestPattern::Keys(held) => !held.is_empty(),
          InterestPattern::Regex(_) => true,
        });
      }
      InterestPattern::Regex(_) => {
        session
          .interests
          .retain(|i| !(i.entry.region == region && &i.entry.pattern == pattern));
      }
    }
    Ok(RegistrationAck::Ack)
  }

  async fn make_primary(&self, conn: &ConnectionHandle) -> Result<(), TransportError> {
    {
      let mut state = self.state.lock();
      Self::check_alive(&state, conn)?;
      let session = state.session_for(conn)?;
      session.primary = Some(conn.id);
    }
    self.notify.notify_waiters();
    Ok(())
  }

  async fn ready_for_events(&self, conn: &ConnectionHandle) -> Result<Vec<RawEvent>, TransportError> {
    let batch = {
      let mut state = self.state.lock();
      Self::check_alive(&state, conn)?;
      let session = state.session_for(conn)?;
      session.ready = true;
      let mut batch: Vec<RawEvent> = std::mem::take(&mut session.retained).into_values().collect();
      batch.sort_by_key(|e| e.sequence);
      batch
    };
    self.notify.notify_waiters();
    Ok(batch)
  }

  async fn poll_events(&self, conn: &ConnectionHandle) -> Result<Vec<RawEvent>, TransportError> {
    loop {
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      {
        let mut state = self.state.lock();
        Self::check_alive(&state, conn)?;
        let session = state.session_for(conn)?;
        if session.primary == Some(conn.id) && session.ready && !session.live.is_empty() {
          return Ok(session.live.drain(..).collect());
        }
      }
      notified.await;
    }
  }

  async fn ping(&self, conn: &ConnectionHandle) -> Result<(), TransportError> {
    let state = self.state.lock();
    Self::check_alive(&state, conn)
  }

  async fn close_connection(
    &self,
    conn: &ConnectionHandle,
    keep_alive: bool,
  ) -> Result<(), TransportError> {
    let now = Instant::now();
    {
      let mut state = self.state.lock();
      Self::check_alive(&state, conn)?;
      state.detach(conn.id, !keep_alive, now);
    }
    self.notify.notify_waiters();
    Ok(())
  }

  async fn abort_connection(&self, conn: &ConnectionHandle) {
    let now = Instant::now();
    self.state.lock().detach(conn.id, false, now);
    self.notify.notify_waiters();
  }
}
