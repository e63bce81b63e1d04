use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{ConnectionHandle, RegistrationAck, Transport};
use crate::error::TransportError;
use crate::session::SessionIdentity;
use crate::types::{ClientMessage, InterestEntry, InterestPattern, RawEvent, ServerMessage};

type Pending = Arc<tokio::sync::Mutex<HashMap<String, oneshot::Sender<ServerMessage>>>>;

struct Outbound {
  id: String,
  text: String,
  reply: Option<oneshot::Sender<ServerMessage>>,
}

struct Link {
  tx: mpsc::UnboundedSender<Outbound>,
  events: tokio::sync::Mutex<mpsc::UnboundedReceiver<RawEvent>>,
  reader: JoinHandle<()>,
}

/// JSON-over-WebSocket transport. One socket per connection handle; replies
/// are matched to requests by id and pushed events queue per connection.
pub struct WsTransport {
  links: Mutex<HashMap<u64, Arc<Link>>>,
  next_id: AtomicU64,
  request_timeout: Duration,
}

impl WsTransport {
  pub fn new(request_timeout: Duration) -> Self {
    Self {
      links: Mutex::new(HashMap::new()),
      next_id: AtomicU64::new(1),
      request_timeout,
    }
  }

  fn link(&self, conn: &ConnectionHandle) -> Result<Arc<Link>, TransportError> {
    self
      .links
      .lock()
      .get(&conn.id)
      .cloned()
      .ok_or_else(|| lost(&conn.address))
  }

  fn drop_link(&self, conn: &ConnectionHandle) -> Option<Arc<Link>> {
    self.links.lock().remove(&conn.id)
  }

  async fn dial(&self, address: &str) -> Result<Arc<Link>, TransportError> {
    let url = if address.starts_with("ws://") || address.starts_with("wss://") {
      address.to_string()
    } else {
      format!("ws://{}", address)
    };
    let (ws, _) = tokio_tungstenite::connect_async(&url)
      .await
      .map_err(|e| TransportError::ConnectFailed {
        address: address.to_string(),
        reason: e.to_string(),
      })?;
    let (mut sink, mut stream) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let pending: Pending = Arc::new(tokio::sync::Mutex::new(HashMap::new()));

    let writer_pending = pending.clone();
    tokio::spawn(async move {
      while let Some(out) = rx.recv().await {
        if let Some(reply) = out.reply {
          writer_pending.lock().await.insert(out.id, reply);
        }
        if sink.send(Message::Text(out.text.into())).await.is_err() {
          break;
        }
      }
      let _ = sink.close().await;
    });

    let peer = address.to_string();
    let reader = tokio::spawn(async move {
      while let Some(Ok(message)) = stream.next().await {
        let text = match message {
          Message::Text(text) => text,
          Message::Close(_) => break,
          _ => continue,
        };
        let msg = match serde_json::from_str::<ServerMessage>(&text) {
          Ok(msg) => msg,
          Err(e) => {
            tracing::warn!(address = %peer, error = %e, "Undecodable server message");
            continue;
          }
        };
        match msg.reply_id().map(str::to_string) {
          None => {
            if let ServerMessage::Event { event } = msg {
              let _ = event_tx.send(event);
            }
          }
          Some(id) => {
            if let Some(reply) = pending.lock().await.remove(&id) {
              let _ = reply.send(msg);
            }
          }
        }
      }
      tracing::debug!(address = %peer, "WebSocket stream ended");
    });

    Ok(Arc::new(Link {
      tx,
      events: tokio::sync::Mutex::new(event_rx),
      reader,
    }))
  }

  async fn request(
    &self,
    address: &str,
    link: &Link,
    msg: ClientMessage,
  ) -> Result<ServerMessage, TransportError> {
    let text = serde_json::to_string(&msg).map_err(|e| TransportError::Protocol(e.to_string()))?;
    let (reply_tx, reply_rx) = oneshot::channel();
    link
      .tx
      .send(Outbound {
        id: msg.id().to_string(),
        text,
        reply: Some(reply_tx),
      })
      .map_err(|_| lost(address))?;
    match tokio::time::timeout(self.request_timeout, reply_rx).await {
      Ok(Ok(ServerMessage::Error { error, .. })) => Err(TransportError::Protocol(error)),
      Ok(Ok(reply)) => Ok(reply),
      Ok(Err(_)) => Err(lost(address)),
      Err(_) => Err(TransportError::Timeout {
        address: address.to_string(),
      }),
    }
  }

  async fn call(
    &self,
    conn: &ConnectionHandle,
    msg: ClientMessage,
  ) -> Result<ServerMessage, TransportError> {
    let link = self.link(conn)?;
    self.request(&conn.address, &link, msg).await
  }
}

fn lost(address: &str) -> TransportError {
  TransportError::ConnectionLost {
    address: address.to_string(),
  }
}

fn request_id() -> String {
  Uuid::new_v4().to_string()
}

fn unexpected(reply: ServerMessage) -> TransportError {
  TransportError::Protocol(format!("unexpected reply: {:?}", reply))
}

fn into_ack(reply: ServerMessage) -> Result<RegistrationAck, TransportError> {
  match reply {
    ServerMessage::Ack { .. } => Ok(RegistrationAck::Ack),
    ServerMessage::Nack { reason, .. } => Ok(RegistrationAck::Nack(reason)),
    other => Err(unexpected(other)),
  }
}

fn expect_ack(reply: ServerMessage) -> Result<(), TransportError> {
  match reply {
    ServerMessage::Ack { .. } | ServerMessage::Pong { .. } => Ok(()),
    ServerMessage::Nack { reason, .. } => Err(TransportError::Protocol(reason)),
    other => Err(unexpected(other)),
  }
}

#[async_trait]
impl Transport for WsTransport {
  async fn open_connection(
    &self,
    address: &str,
    session: &SessionIdentity,
  ) -> Result<ConnectionHandle, TransportError> {
    let link = self.dial(address).await?;
    let hello = ClientMessage::Hello {
      id: request_id(),
      durable_client_id: session.durable_client_id().to_string(),
      durable_timeout_secs: session.durable_timeout_secs(),
    };
    if let Err(e) = self
      .request(address, &link, hello)
      .await
      .and_then(expect_ack)
    {
      link.reader.abort();
      return Err(TransportError::ConnectFailed {
        address: address.to_string(),
        reason: e.to_string(),
      });
    }
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self.links.lock().insert(id, link);
    tracing::debug!(address = %address, id, "WebSocket connection open");
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
    let msg = ClientMessage::Register {
      id: request_id(),
      entry: entry.clone(),
    };
    into_ack(self.call(conn, msg).await?)
  }

  async fn send_unregistration(
    &self,
    conn: &ConnectionHandle,
    region: &str,
    pattern: &InterestPattern,
  ) -> Result<RegistrationAck, TransportError> {
    let msg = ClientMessage::Unregister {
      id: request_id(),
      region: region.to_string(),
      pattern: pattern.clone(),
    };
    into_ack(self.call(conn, msg).await?)
  }

  async fn make_primary(&self, conn: &ConnectionHandle) -> Result<(), TransportError> {
    expect_ack(self.call(conn, ClientMessage::MakePrimary { id: request_id() }).await?)
  }

  async fn ready_for_events(&self, conn: &ConnectionHandle) -> Result<Vec<RawEvent>, TransportError> {
    match self
      .call(conn, ClientMessage::ReadyForEvents { id: request_id() })
      .await?
    {
      ServerMessage::CatchUp { events, .. } => Ok(events),
      ServerMessage::Ack { .. } => Ok(Vec::new()),
      other => Err(unexpected(other)),
    }
  }

  async fn poll_events(&self, conn: &ConnectionHandle) -> Result<Vec<RawEvent>, TransportError> {
    let link = self.link(conn)?;
    let mut events = link.events.lock().await;
    let first = events.recv().await.ok_or_else(|| lost(&conn.address))?;
    let mut batch = vec![first];
    while let Ok(event) = events.try_recv() {
      batch.push(event);
    }
    Ok(batch)
  }

  async fn ping(&self, conn: &ConnectionHandle) -> Result<(), TransportError> {
    expect_ack(self.call(conn, ClientMessage::Ping { id: request_id() }).await?)
  }

  async fn close_connection(
    &self,
    conn: &ConnectionHandle,
    keep_alive: bool,
  ) -> Result<(), TransportError> {
    let link = self.drop_link(conn).ok_or_else(|| lost(&conn.address))?;
    let msg = ClientMessage::Close {
      id: request_id(),
      keep_alive,
    };
    let text = serde_json::to_string(&msg).map_err(|e| TransportError::Protocol(e.to_string()))?;
    let sent = link.tx.send(Outbound {
      id: msg.id().to_string(),
      text,
      reply: None,
    });
    link.reader.abort();
    sent.map_err(|_| lost(&conn.address))
  }

  async fn abort_connection(&self, conn: &ConnectionHandle) {
    if let Some(link) = self.drop_link(conn) {
      link.reader.abort();
    }
  }
}
