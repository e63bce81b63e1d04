//! Application-facing durable client.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{ClientConfig, PoolConfig};
use crate::delivery::{CatchUpReport, DeliveryStats, EventPipeline, KeyState, SubscriptionListener};
use crate::error::{DurableError, TransportError};
use crate::interest::InterestRegistry;
use crate::pool::{ConnectionSet, FailoverController, FailoverState, ReplayReport};
use crate::revival::{DisconnectCause, ReviveMode, RevivalProtocol, SessionPhase};
use crate::session::SessionIdentity;
use crate::transport::{ConnectionHandle, RegistrationAck, Transport};
use crate::types::{
  DeliveryKind, EndpointRole, EndpointStatus, InterestEntry, InterestPattern, RawEvent,
};

/// Snapshot of the client's health, published on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStatus {
  pub session: SessionPhase,
  pub failover: FailoverState,
  /// Live secondary connections
  pub secondaries: usize,
  pub redundancy_level: u32,
  /// Warning-level condition attached to the transition, e.g. redundancy
  /// shortfall, failed promotion or an expired queue
  pub warning: Option<DurableError>,
}

impl ClientStatus {
  fn initial(session: &SessionIdentity) -> Self {
    Self {
      session: SessionPhase::Idle,
      failover: FailoverState::Disconnected,
      secondaries: 0,
      redundancy_level: session.redundancy_level(),
      warning: None,
    }
  }
}

/// What a successful connect or revive established.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
  pub mode: ReviveMode,
  pub primary: String,
  pub secondaries: Vec<String>,
  pub replay: ReplayReport,
  /// Present for catch-up sessions
  pub catch_up: Option<CatchUpReport>,
  /// Redundancy shortfall, if any
  pub degraded: Option<DurableError>,
}

struct ClientInner {
  session: SessionIdentity,
  transport: Arc<dyn Transport>,
  registry: Arc<InterestRegistry>,
  pipeline: Arc<EventPipeline>,
  connections: ConnectionSet,
  failover: FailoverController,
  revival: Mutex<RevivalProtocol>,
  ping_interval: Duration,

  // Serializes connect, revive, disconnect, failover and close
  ops: tokio::sync::Mutex<()>,
  revive_gate: tokio::sync::Mutex<()>,

  status_tx: watch::Sender<ClientStatus>,
  delivery_tx: mpsc::UnboundedSender<RawEvent>,
  delivery_rx: Mutex<Option<mpsc::UnboundedReceiver<RawEvent>>>,
  loss_tx: mpsc::UnboundedSender<ConnectionHandle>,
  loss_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionHandle>>>,
  shutdown_tx: broadcast::Sender<()>,

  readers: Mutex<HashMap<u64, JoinHandle<()>>>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
  started: AtomicBool,
  retry_at: Mutex<Option<Instant>>,
  wake: Notify,
}

/// Durable subscription client.
///
/// Cheap to clone. Background tasks (delivery, liveness checks, failover)
/// start with the first connect and run until [`close`](Self::close).
#[derive(Clone)]
pub struct DurableClient {
  inner: Arc<ClientInner>,
}

impl DurableClient {
  pub fn new(
    session: SessionIdentity,
    pool: PoolConfig,
    transport: Arc<dyn Transport>,
  ) -> Result<Self, DurableError> {
    if pool.endpoints.is_empty() {
      return Err(DurableError::Config(
        "at least one endpoint is required".into(),
      ));
    }
    let registry = Arc::new(InterestRegistry::new());
    let pipeline = Arc::new(EventPipeline::new(registry.clone()));
    let connections = ConnectionSet::new(transport.clone(), session.clone(), &pool);
    let failover = FailoverController::new(
      session.durable_client_id(),
      registry.clone(),
      transport.clone(),
      pool.reconnect.clone(),
    );
    let revival = RevivalProtocol::new(session.durable_timeout());
    let (status_tx, _) = watch::channel(ClientStatus::initial(&session));
    let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
    let (loss_tx, loss_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = broadcast::channel(1);

    tracing::debug!(
      client_id = %session.durable_client_id(),
      durable_timeout_secs = session.durable_timeout_secs(),
      redundancy_level = session.redundancy_level(),
      endpoints = pool.endpoints.len(),
      "Durable client created"
    );

    Ok(Self {
      inner: Arc::new(ClientInner {
        session,
        transport,
        registry,
        pipeline,
        connections,
        failover,
        revival: Mutex::new(revival),
        ping_interval: pool.ping_interval(),
        ops: tokio::sync::Mutex::new(()),
        revive_gate: tokio::sync::Mutex::new(()),
        status_tx,
        delivery_tx,
        delivery_rx: Mutex::new(Some(delivery_rx)),
        loss_tx,
        loss_rx: Mutex::new(Some(loss_rx)),
        shutdown_tx,
        readers: Mutex::new(HashMap::new()),
        tasks: Mutex::new(Vec::new()),
        started: AtomicBool::new(false),
        retry_at: Mutex::new(None),
        wake: Notify::new(),
      }),
    })
  }

  pub fn from_config(
    config: &ClientConfig,
    transport: Arc<dyn Transport>,
  ) -> Result<Self, DurableError> {
    let session = config.session_identity()?;
    Self::new(session, config.pool.clone(), transport)
  }

  pub fn session(&self) -> &SessionIdentity {
    &self.inner.session
  }

  pub fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) {
    self.inner.pipeline.add_listener(listener);
  }

  /// Open the connection set, replay interests and start receiving events.
  ///
  /// A durable client connecting for the first time receives whatever queue
  /// the servers still retain under its id. After a discarded or expired
  /// queue the connect is a fresh session.
  pub async fn connect(&self) -> Result<SessionOutcome, DurableError> {
    let inner = &self.inner;
    let mut shutdown = inner.shutdown_tx.subscribe();
    let _ops = inner.ops.lock().await;
    let mode = inner.revival.lock().begin_connect(Instant::now())?;
    let result = tokio::select! {
      result = inner.establish(mode) => result,
      _ = shutdown.recv() => Err(DurableError::Closed),
    };
    let warning = match &result {
      Ok(outcome) => outcome.degraded.clone(),
      Err(e) => Some(e.clone()),
    };
    inner.publish(warning);
    result
  }

  /// Reclaim the retained durable queue.
  ///
  /// Before the deadline this replays interests and applies the compacted
  /// catch-up batch. After it, the client still comes back live on a fresh
  /// session but the call reports `RevivalExpired`: updates from the missed
  /// interval are lost.
  pub async fn revive(&self) -> Result<SessionOutcome, DurableError> {
    let inner = &self.inner;
    let Ok(_gate) = inner.revive_gate.try_lock() else {
      return Err(DurableError::RevivalInProgress);
    };
    let mut shutdown = inner.shutdown_tx.subscribe();
    let _ops = inner.ops.lock().await;
    let mode = inner.revival.lock().begin_revive(Instant::now())?;
    let result = tokio::select! {
      result = inner.establish(mode) => result,
      _ = shutdown.recv() => Err(DurableError::Closed),
    };
    let outcome = match result {
      Ok(outcome) => outcome,
      Err(e) => {
        inner.publish(Some(e.clone()));
        return Err(e);
      }
    };
    match mode {
      ReviveMode::CatchUp => {
        inner.publish(outcome.degraded.clone());
        Ok(outcome)
      }
      ReviveMode::FreshSession => {
        let expired = DurableError::RevivalExpired {
          client_id: inner.session.durable_client_id().to_string(),
        };
        tracing::warn!(
          client_id = %inner.session.durable_client_id(),
          "Durable queue expired before revival, continuing with a fresh session"
        );
        inner.publish(Some(expired.clone()));
        Err(expired)
      }
    }
  }

  /// Drop the session's connections. `KeepAlive` and `Close` close them
  /// gracefully; every other cause aborts them as a failure would.
  pub async fn disconnect(&self, cause: DisconnectCause) -> Result<SessionPhase, DurableError> {
    let inner = &self.inner;
    let _ops = inner.ops.lock().await;
    let phase = inner.revival.lock().phase();
    match phase {
      SessionPhase::Live => {}
      SessionPhase::Closed => return Err(DurableError::Closed),
      _ => {
        return Err(DurableError::InvalidState {
          phase,
          operation: "disconnect",
        })
      }
    }
    inner.stop_readers();
    match cause {
      DisconnectCause::KeepAlive => inner.connections.close_all(true).await,
      DisconnectCause::Close => inner.connections.close_all(false).await,
      _ => inner.connections.abort_all().await,
    }
    let phase = inner
      .revival
      .lock()
      .on_transport_lost(cause, Instant::now());
    inner.failover.mark_disconnected();
    *inner.retry_at.lock() = None;
    inner.publish(None);
    Ok(phase)
  }

  /// Shut the client down. Cancels liveness checks, promotion and any pending
  /// revival. With `keep_alive` the servers keep the durable queue for a later
  /// process presenting the same identity.
  ///
  /// Closing without `keep_alive` while a queue is retained from an earlier
  /// keep-alive disconnect briefly reconnects to tell the servers to drop it.
  pub async fn close(&self, keep_alive: bool) -> Result<(), DurableError> {
    let inner = &self.inner;
    let retained = {
      let mut revival = inner.revival.lock();
      revival.refresh(Instant::now());
      let phase = revival.phase();
      if phase == SessionPhase::Closed {
        return Ok(());
      }
      revival.close();
      phase == SessionPhase::QueueRetained
    };
    let _ = inner.shutdown_tx.send(());
    for task in inner.tasks.lock().drain(..) {
      task.abort();
    }
    let _ops = inner.ops.lock().await;
    inner.stop_readers();
    inner.connections.close_all(keep_alive).await;
    if retained && !keep_alive && !inner.connections.discard_retained_queue().await {
      tracing::warn!(
        client_id = %inner.session.durable_client_id(),
        "No endpoint reachable to discard retained queue"
      );
    }
    inner.failover.mark_disconnected();
    *inner.retry_at.lock() = None;
    tracing::info!(
      client_id = %inner.session.durable_client_id(),
      keep_alive,
      "Durable client closed"
    );
    inner.publish(None);
    Ok(())
  }

  /// Add or update an interest.
  ///
  /// The registry records the interest before anything is sent, so a
  /// `NotConnected` failure still gets it replayed once a primary is back.
  /// Registering an identical interest again is a no-op once the server has
  /// acknowledged it; an unacknowledged one is sent again.
  pub async fn register_interest(
    &self,
    region: impl Into<String>,
    pattern: InterestPattern,
    durable: bool,
  ) -> Result<(), DurableError> {
    let inner = &self.inner;
    inner.ensure_open()?;
    let entry = InterestEntry::new(region, pattern, durable);
    if !inner.registry.register(&entry)? && !inner.registry.is_pending(&entry) {
      return Ok(());
    }
    let Some(primary) = inner.connections.primary() else {
      return Err(DurableError::NotConnected(format!(
        "interest in `{}` recorded for replay",
        entry.region
      )));
    };
    match inner.transport.send_registration(&primary, &entry).await {
      Ok(RegistrationAck::Ack) => {
        inner.registry.confirm(&entry);
        Ok(())
      }
      Ok(RegistrationAck::Nack(reason)) => Err(DurableError::RegistrationRejected {
        address: primary.address,
        reason,
      }),
      Err(e) => Err(unreachable_error(e)),
    }
  }

  /// Remove an interest. Returns false if it was not registered.
  pub async fn unregister_interest(
    &self,
    region: &str,
    pattern: &InterestPattern,
  ) -> Result<bool, DurableError> {
    let inner = &self.inner;
    inner.ensure_open()?;
    if !inner.registry.unregister(region, pattern) {
      return Ok(false);
    }
    let Some(primary) = inner.connections.primary() else {
      return Err(DurableError::NotConnected(format!(
        "interest in `{}` removed locally only",
        region
      )));
    };
    match inner
      .transport
      .send_unregistration(&primary, region, pattern)
      .await
    {
      Ok(RegistrationAck::Ack) => Ok(true),
      Ok(RegistrationAck::Nack(reason)) => Err(DurableError::RegistrationRejected {
        address: primary.address,
        reason,
      }),
      Err(e) => Err(unreachable_error(e)),
    }
  }

  /// Forget a destroyed region: its interests and its key state.
  pub async fn remove_region(&self, region: &str) -> Vec<InterestEntry> {
    let inner = &self.inner;
    let removed = inner.registry.remove_region(region);
    inner.pipeline.clear_region(region);
    if let Some(primary) = inner.connections.primary() {
      for entry in &removed {
        if let Err(e) = inner
          .transport
          .send_unregistration(&primary, region, &entry.pattern)
          .await
        {
          tracing::debug!(region = %region, error = %e, "Unregistration of removed region failed");
        }
      }
    }
    removed
  }

  pub fn list_interests(&self, region: &str) -> Vec<InterestEntry> {
    self.inner.registry.list(region)
  }

  pub fn current_endpoint_roles(&self) -> Vec<EndpointStatus> {
    self.inner.connections.statuses()
  }

  pub fn status(&self) -> ClientStatus {
    self.inner.status_tx.borrow().clone()
  }

  pub fn subscribe_status(&self) -> watch::Receiver<ClientStatus> {
    self.inner.status_tx.subscribe()
  }

  pub fn session_phase(&self) -> SessionPhase {
    self.inner.revival.lock().phase()
  }

  pub fn value(&self, region: &str, key: &str) -> Option<serde_json::Value> {
    self.inner.pipeline.value(region, key)
  }

  pub fn key_state(&self, region: &str, key: &str) -> Option<KeyState> {
    self.inner.pipeline.key_state(region, key)
  }

  pub fn delivery_stats(&self) -> DeliveryStats {
    self.inner.pipeline.stats()
  }
}

fn unreachable_error(e: TransportError) -> DurableError {
  match e {
    TransportError::ConnectionLost { .. } | TransportError::Closed => {
      DurableError::NotConnected(e.to_string())
    }
    other => DurableError::Transport(other),
  }
}

impl ClientInner {
  fn ensure_open(&self) -> Result<(), DurableError> {
    if self.revival.lock().phase() == SessionPhase::Closed {
      return Err(DurableError::Closed);
    }
    Ok(())
  }

  fn publish(&self, warning: Option<DurableError>) {
    let status = ClientStatus {
      session: self.revival.lock().phase(),
      failover: self.failover.state(),
      secondaries: self.connections.secondaries().len(),
      redundancy_level: self.session.redundancy_level(),
      warning,
    };
    self.status_tx.send_replace(status);
  }

  fn ensure_started(self: &Arc<Self>) {
    if self.started.swap(true, Ordering::SeqCst) {
      return;
    }
    let mut tasks = self.tasks.lock();
    if let Some(rx) = self.delivery_rx.lock().take() {
      tasks.push(tokio::spawn(deliver(
        self.pipeline.clone(),
        rx,
        self.shutdown_tx.subscribe(),
      )));
    }
    if let Some(rx) = self.loss_rx.lock().take() {
      tasks.push(tokio::spawn(supervise(
        self.clone(),
        rx,
        self.shutdown_tx.subscribe(),
      )));
    }
  }

  fn spawn_reader(&self, conn: ConnectionHandle) {
    let mut readers = self.readers.lock();
    if readers.contains_key(&conn.id) {
      return;
    }
    let id = conn.id;
    let handle = tokio::spawn(read_events(
      self.transport.clone(),
      conn,
      self.delivery_tx.clone(),
      self.loss_tx.clone(),
    ));
    readers.insert(id, handle);
  }

  fn spawn_missing_readers(&self) {
    for conn in self.connections.connections() {
      self.spawn_reader(conn);
    }
  }

  fn stop_reader(&self, id: u64) {
    if let Some(handle) = self.readers.lock().remove(&id) {
      handle.abort();
    }
  }

  fn stop_readers(&self) {
    for (_, handle) in self.readers.lock().drain() {
      handle.abort();
    }
  }

  fn schedule_retry(&self) {
    let delay = self.failover.next_retry_delay();
    *self.retry_at.lock() = Some(Instant::now() + delay);
    self.wake.notify_one();
  }

  /// Connect, replay, handshake and deliver catch-up. The revival protocol
  /// must already be in `Reviving`; on failure it is rolled back.
  async fn establish(self: &Arc<Self>, mode: ReviveMode) -> Result<SessionOutcome, DurableError> {
    self.ensure_started();
    self.stop_readers();

    let report = match self.connections.connect().await {
      Ok(report) => report,
      Err(e) => {
        self.revival.lock().fail_revive(Instant::now());
        return Err(e);
      }
    };

    let deadline = match mode {
      ReviveMode::CatchUp => self.revival.lock().deadline(),
      ReviveMode::FreshSession => None,
    };
    let replay = match self
      .failover
      .replay_interests(&report.primary, deadline)
      .await
    {
      Ok(replay) => replay,
      Err(e) => {
        self.connections.abort_all().await;
        let mut revival = self.revival.lock();
        if matches!(e, DurableError::RevivalExpired { .. }) {
          revival.force_expire();
        } else {
          revival.fail_revive(Instant::now());
        }
        return Err(e);
      }
    };

    let batch = match self.transport.ready_for_events(&report.primary).await {
      Ok(batch) => batch,
      Err(e) => {
        self.connections.abort_all().await;
        self.revival.lock().fail_revive(Instant::now());
        return Err(e.into());
      }
    };

    let catch_up = match mode {
      ReviveMode::CatchUp => {
        self.pipeline.mark_revived();
        Some(self.pipeline.apply_catch_up(batch))
      }
      ReviveMode::FreshSession => {
        if !batch.is_empty() {
          tracing::debug!(
            discarded = batch.len(),
            "Ignoring retained events on fresh session"
          );
        }
        self.pipeline.reset_for_fresh_session();
        None
      }
    };

    self.revival.lock().complete_revive()?;
    self.spawn_missing_readers();
    self.failover.mark_stable(&report.primary, &report.secondaries);
    self.failover.reset_backoff();
    if report.shortfall.is_some() {
      self.schedule_retry();
    } else {
      *self.retry_at.lock() = None;
    }

    tracing::info!(
      client_id = %self.session.durable_client_id(),
      primary = %report.primary.address,
      secondaries = report.secondaries.len(),
      ?mode,
      "Session established"
    );
    Ok(SessionOutcome {
      mode,
      primary: report.primary.address.clone(),
      secondaries: report
        .secondaries
        .iter()
        .map(|c| c.address.clone())
        .collect(),
      replay,
      catch_up,
      degraded: report.shortfall,
    })
  }

  async fn handle_loss(self: &Arc<Self>, conn: ConnectionHandle) {
    let _ops = self.ops.lock().await;
    let Some(role) = self.connections.mark_lost(&conn) else {
      return;
    };
    self.transport.abort_connection(&conn).await;
    self.after_loss(conn, role).await;
  }

  async fn health_check(self: &Arc<Self>) {
    let _ops = self.ops.lock().await;
    if self.revival.lock().refresh(Instant::now()) {
      self.publish(Some(DurableError::RevivalExpired {
        client_id: self.session.durable_client_id().to_string(),
      }));
    }
    if !self.failover.state().is_stable() {
      return;
    }
    for (conn, role) in self.connections.check_liveness().await {
      self.after_loss(conn, role).await;
    }
  }

  /// React to a connection that is already marked lost and aborted.
  async fn after_loss(self: &Arc<Self>, conn: ConnectionHandle, role: EndpointRole) {
    self.stop_reader(conn.id);
    match role {
      EndpointRole::Primary => self.fail_over(&conn.address).await,
      EndpointRole::Secondary => {
        tracing::warn!(address = %conn.address, "Secondary lost, restoring redundancy in background");
        if let Some(primary) = self.connections.primary() {
          self
            .failover
            .mark_stable(&primary, &self.connections.secondaries());
        }
        self.schedule_retry();
        self.publish(Some(DurableError::RedundancyDegraded {
          requested: self.session.redundancy_level(),
          available: self.connections.secondaries().len(),
        }));
      }
      EndpointRole::Unavailable => {}
    }
  }

  async fn fail_over(self: &Arc<Self>, failed_primary: &str) {
    if self.revival.lock().phase() != SessionPhase::Live {
      return;
    }
    match self
      .failover
      .handle_primary_loss(&self.connections, failed_primary)
      .await
    {
      Ok(primary) => {
        match self.transport.ready_for_events(&primary).await {
          Ok(batch) if !batch.is_empty() => {
            self.pipeline.apply_catch_up(batch);
          }
          Ok(_) => {}
          Err(e) => {
            tracing::warn!(address = %primary.address, error = %e, "New primary failed handshake");
            let _ = self.loss_tx.send(primary);
            return;
          }
        }
        let shortfall = self.connections.fill_secondaries().await;
        self.spawn_missing_readers();
        self
          .failover
          .mark_stable(&primary, &self.connections.secondaries());
        if shortfall.is_some() {
          self.schedule_retry();
        }
        self.publish(shortfall);
      }
      Err(e) => {
        self.stop_readers();
        self.connections.abort_all().await;
        let phase = self
          .revival
          .lock()
          .on_transport_lost(DisconnectCause::TransportLost, Instant::now());
        tracing::warn!(
          client_id = %self.session.durable_client_id(),
          phase = %phase,
          "Failover failed, retrying endpoint discovery"
        );
        self.schedule_retry();
        self.publish(Some(e));
      }
    }
  }

  async fn retry(self: &Arc<Self>) {
    let _ops = self.ops.lock().await;
    *self.retry_at.lock() = None;
    match self.failover.state() {
      FailoverState::Degraded { .. } => self.rediscover().await,
      FailoverState::Stable { .. } => self.restore_redundancy().await,
      _ => {}
    }
  }

  /// Degraded: look for any reachable endpoint and re-establish the session.
  async fn rediscover(self: &Arc<Self>) {
    let now = Instant::now();
    let begun = {
      let mut revival = self.revival.lock();
      revival.refresh(now);
      let from = revival.phase();
      revival.begin_connect(now).map(|mode| (mode, from))
    };
    let (mode, from) = match begun {
      Ok(begun) => begun,
      Err(e) => {
        tracing::debug!(error = %e, "Endpoint discovery skipped");
        return;
      }
    };
    match self.establish(mode).await {
      Ok(outcome) => {
        let warning = if from == SessionPhase::Expired && self.session.is_durable() {
          Some(DurableError::RevivalExpired {
            client_id: self.session.durable_client_id().to_string(),
          })
        } else {
          outcome.degraded
        };
        tracing::info!(
          client_id = %self.session.durable_client_id(),
          primary = %outcome.primary,
          "Recovered from degraded state"
        );
        self.publish(warning);
      }
      Err(e) => {
        let attempts = self.failover.mark_degraded(Instant::now());
        tracing::warn!(
          client_id = %self.session.durable_client_id(),
          attempts,
          error = %e,
          "Endpoint discovery failed"
        );
        self.schedule_retry();
        self.publish(Some(e));
      }
    }
  }

  async fn restore_redundancy(self: &Arc<Self>) {
    let shortfall = self.connections.fill_secondaries().await;
    self.spawn_missing_readers();
    if let Some(primary) = self.connections.primary() {
      self
        .failover
        .mark_stable(&primary, &self.connections.secondaries());
    }
    if shortfall.is_some() {
      self.schedule_retry();
    } else {
      self.failover.reset_backoff();
      tracing::info!("Redundancy level restored");
    }
    self.publish(shortfall);
  }
}

async fn deliver(
  pipeline: Arc<EventPipeline>,
  mut rx: mpsc::UnboundedReceiver<RawEvent>,
  mut shutdown: broadcast::Receiver<()>,
) {
  loop {
    tokio::select! {
      event = rx.recv() => match event {
        Some(event) => {
          pipeline.apply(event, DeliveryKind::Live);
        }
        None => break,
      },
      _ = shutdown.recv() => break,
    }
  }
}

async fn read_events(
  transport: Arc<dyn Transport>,
  conn: ConnectionHandle,
  delivery: mpsc::UnboundedSender<RawEvent>,
  loss: mpsc::UnboundedSender<ConnectionHandle>,
) {
  loop {
    match transport.poll_events(&conn).await {
      Ok(events) => {
        for event in events {
          if delivery.send(event).is_err() {
            return;
          }
        }
      }
      Err(e) => {
        tracing::debug!(address = %conn.address, error = %e, "Connection reader stopped");
        let _ = loss.send(conn);
        return;
      }
    }
  }
}

async fn supervise(
  inner: Arc<ClientInner>,
  mut loss_rx: mpsc::UnboundedReceiver<ConnectionHandle>,
  mut shutdown: broadcast::Receiver<()>,
) {
  let mut ticker = tokio::time::interval(inner.ping_interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  ticker.tick().await;
  loop {
    let retry_at = *inner.retry_at.lock();
    tokio::select! {
      _ = shutdown.recv() => break,
      Some(conn) = loss_rx.recv() => inner.handle_loss(conn).await,
      _ = ticker.tick() => inner.health_check().await,
      _ = sleep_until(retry_at) => inner.retry().await,
      _ = inner.wake.notified() => {}
    }
  }
}

async fn sleep_until(at: Option<Instant>) {
  match at {
    Some(at) => tokio::time::sleep_until(at).await,
    None => std::future::pending().await,
  }
}
