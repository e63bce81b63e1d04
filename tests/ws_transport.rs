//! WebSocket transport tests - a scripted server on a local port answering
//! the handshake, registrations, catch-up and pushed events.

#![cfg(feature = "ws")]

use durasub::transport::{RegistrationAck, WsTransport};
use durasub::types::{ClientMessage, EventOperation, InterestEntry, InterestPattern, RawEvent, ServerMessage};
use durasub::{SessionIdentity, Transport, TransportError};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Serve one client. Registrations on region `forbidden` are refused; every
/// client message is forwarded to `seen`.
async fn serve(listener: TcpListener, seen: mpsc::UnboundedSender<ClientMessage>) {
  let (stream, _) = listener.accept().await.unwrap();
  let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
  let (mut sink, mut stream) = ws.split();

  while let Some(Ok(Message::Text(text))) = stream.next().await {
    let msg: ClientMessage = serde_json::from_str(&text).unwrap();
    let _ = seen.send(msg.clone());
    let replies = match msg {
      ClientMessage::Hello { id, .. }
      | ClientMessage::Unregister { id, .. }
      | ClientMessage::MakePrimary { id } => vec![ServerMessage::ack(id)],
      ClientMessage::Register { id, entry } if entry.region == "forbidden" => {
        vec![ServerMessage::nack(id, "region not found")]
      }
      ClientMessage::Register { id, .. } => vec![ServerMessage::ack(id)],
      ClientMessage::ReadyForEvents { id } => vec![
        ServerMessage::catch_up(
          id,
          vec![RawEvent::new(
            "region1",
            "D-1",
            EventOperation::Update,
            Some(json!("queued")),
            4,
          )],
        ),
        ServerMessage::event(RawEvent::new(
          "region1",
          "D-1",
          EventOperation::Update,
          Some(json!("live")),
          5,
        )),
      ],
      ClientMessage::Ping { id } => vec![ServerMessage::pong(id)],
      ClientMessage::Close { .. } => break,
    };
    for reply in replies {
      let text = serde_json::to_string(&reply).unwrap();
      sink.send(Message::Text(text.into())).await.unwrap();
    }
  }
}

async fn start_server() -> (String, mpsc::UnboundedReceiver<ClientMessage>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let address = listener.local_addr().unwrap().to_string();
  let (seen_tx, seen_rx) = mpsc::unbounded_channel();
  tokio::spawn(serve(listener, seen_tx));
  (address, seen_rx)
}

fn identity() -> SessionIdentity {
  SessionIdentity::new("ws-client", 60, 0).unwrap()
}

// =============================================================================
// Session flow
// =============================================================================

#[tokio::test]
async fn test_full_session_over_websocket() {
  let (address, mut seen) = start_server().await;
  let transport = WsTransport::new(Duration::from_secs(5));

  let conn = transport.open_connection(&address, &identity()).await.unwrap();
  match seen.recv().await.unwrap() {
    ClientMessage::Hello {
      durable_client_id,
      durable_timeout_secs,
      ..
    } => {
      assert_eq!(durable_client_id, "ws-client");
      assert_eq!(durable_timeout_secs, 60);
    }
    other => panic!("expected hello, got {:?}", other),
  }

  let entry = InterestEntry::durable("region1", InterestPattern::key("D-1"));
  assert_eq!(
    transport.send_registration(&conn, &entry).await.unwrap(),
    RegistrationAck::Ack
  );
  let refused = InterestEntry::durable("forbidden", InterestPattern::key("x"));
  assert_eq!(
    transport.send_registration(&conn, &refused).await.unwrap(),
    RegistrationAck::Nack("region not found".into())
  );

  transport.make_primary(&conn).await.unwrap();
  let batch = transport.ready_for_events(&conn).await.unwrap();
  assert_eq!(batch.len(), 1);
  assert_eq!(batch[0].value, Some(json!("queued")));

  let live = tokio::time::timeout(Duration::from_secs(5), transport.poll_events(&conn))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(live[0].sequence, 5);

  transport.ping(&conn).await.unwrap();
  assert_eq!(
    transport
      .send_unregistration(&conn, "region1", &InterestPattern::key("D-1"))
      .await
      .unwrap(),
    RegistrationAck::Ack
  );

  transport.close_connection(&conn, true).await.unwrap();
  loop {
    if let ClientMessage::Close { keep_alive, .. } = seen.recv().await.unwrap() {
      assert!(keep_alive);
      break;
    }
  }
  assert!(matches!(
    transport.ping(&conn).await,
    Err(TransportError::ConnectionLost { .. })
  ));
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_unreachable_endpoint() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let address = listener.local_addr().unwrap().to_string();
  drop(listener);

  let transport = WsTransport::new(Duration::from_secs(1));
  let err = transport.open_connection(&address, &identity()).await.unwrap_err();
  assert!(matches!(err, TransportError::ConnectFailed { .. }));
}

#[tokio::test]
async fn test_aborted_connection_is_lost() {
  let (address, _seen) = start_server().await;
  let transport = WsTransport::new(Duration::from_secs(5));
  let conn = transport.open_connection(&address, &identity()).await.unwrap();

  transport.abort_connection(&conn).await;
  assert!(matches!(
    transport.poll_events(&conn).await,
    Err(TransportError::ConnectionLost { .. })
  ));
  assert!(transport
    .send_registration(&conn, &InterestEntry::durable("r", InterestPattern::key("a")))
    .await
    .is_err());
}
