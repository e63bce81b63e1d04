//! Durable session tests - keep-alive disconnects, revival with catch-up,
//! queue expiry, discarded queues and duplicate suppression, all against the
//! in-memory grid.

use durasub::session::MAX_DURABLE_TIMEOUT_SECS;
use durasub::types::{EventOperation, InterestPattern, RawEvent};
use durasub::{
  DisconnectCause, DurableClient, DurableError, EventRecorder, InMemoryGrid, PoolConfig,
  ReviveMode, SessionIdentity, SessionPhase,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const CLIENT_ID: &str = "DurableClientId1";
const REGION: &str = "region1";

fn durable_client(grid: &Arc<InMemoryGrid>, timeout_secs: u64) -> (DurableClient, Arc<EventRecorder>) {
  let session = SessionIdentity::new(CLIENT_ID, timeout_secs, 0).unwrap();
  let mut pool = PoolConfig::with_endpoints(["s1"]);
  pool.ping_interval_ms = 1_000;
  let client = DurableClient::new(session, pool, grid.clone()).unwrap();
  let recorder = Arc::new(EventRecorder::new());
  client.add_listener(recorder.clone());
  (client, recorder)
}

async fn connected(grid: &Arc<InMemoryGrid>, timeout_secs: u64) -> (DurableClient, Arc<EventRecorder>) {
  let (client, recorder) = durable_client(grid, timeout_secs);
  client.connect().await.unwrap();
  client
    .register_interest(REGION, InterestPattern::key("D-1"), true)
    .await
    .unwrap();
  client
    .register_interest(REGION, InterestPattern::key("K-1"), false)
    .await
    .unwrap();
  (client, recorder)
}

// =============================================================================
// Revival with catch-up
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_revive_delivers_durable_update_once() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = connected(&grid, 300).await;

  let phase = client.disconnect(DisconnectCause::KeepAlive).await.unwrap();
  assert_eq!(phase, SessionPhase::QueueRetained);
  assert!(grid.session_exists(CLIENT_ID));

  grid.put(REGION, "D-1", json!(1));
  grid.put(REGION, "K-1", json!(1));
  assert_eq!(grid.retained_len(CLIENT_ID), 1);

  tokio::time::sleep(Duration::from_secs(5)).await;
  let outcome = client.revive().await.unwrap();
  assert_eq!(outcome.mode, ReviveMode::CatchUp);
  assert_eq!(outcome.primary, "s1");
  let catch_up = outcome.catch_up.unwrap();
  assert_eq!(catch_up.received, 1);
  assert_eq!(catch_up.applied, 1);

  assert_eq!(client.session_phase(), SessionPhase::Live);
  assert_eq!(recorder.count_for(REGION, "D-1"), 1);
  assert_eq!(recorder.last_value(REGION, "D-1"), Some(Some(json!(1))));
  assert_eq!(recorder.count_for(REGION, "K-1"), 0);
  assert_eq!(client.value(REGION, "D-1"), Some(json!(1)));

  grid.put(REGION, "K-1", json!(2));
  assert!(recorder.wait_for(2, Duration::from_secs(5)).await);
  assert_eq!(recorder.count_for(REGION, "K-1"), 1);
  assert_eq!(recorder.last_value(REGION, "K-1"), Some(Some(json!(2))));
  assert_eq!(client.value(REGION, "K-1"), Some(json!(2)));
}

#[tokio::test(start_paused = true)]
async fn test_catch_up_is_compacted_to_last_value() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = connected(&grid, 300).await;
  client.disconnect(DisconnectCause::KeepAlive).await.unwrap();

  for value in 1..=5 {
    grid.put(REGION, "D-1", json!(value));
  }
  grid.put(REGION, "D-1", json!("final"));

  let outcome = client.revive().await.unwrap();
  assert_eq!(outcome.catch_up.unwrap().applied, 1);
  let events = recorder.events_for(REGION, "D-1");
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].value, Some(json!("final")));
  assert_eq!(events[0].sequence, 6);
  assert!(events[0].durable);
}

#[tokio::test(start_paused = true)]
async fn test_non_durable_key_is_stale_after_revival() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = connected(&grid, 300).await;

  grid.put(REGION, "K-1", json!("before"));
  assert!(recorder.wait_for(1, Duration::from_secs(5)).await);
  assert_eq!(client.value(REGION, "K-1"), Some(json!("before")));

  client.disconnect(DisconnectCause::KeepAlive).await.unwrap();
  grid.put(REGION, "K-1", json!("missed"));
  client.revive().await.unwrap();

  // The missed update is gone and the pre-disconnect value is not trusted
  assert_eq!(client.value(REGION, "K-1"), None);
  assert!(client.key_state(REGION, "K-1").unwrap().stale);
  assert_eq!(recorder.count_for(REGION, "K-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_crash_and_network_loss_retain_queue() {
  for cause in [DisconnectCause::Crash, DisconnectCause::NetworkPartition] {
    let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
    let (client, recorder) = connected(&grid, 300).await;

    assert_eq!(
      client.disconnect(cause).await.unwrap(),
      SessionPhase::QueueRetained
    );
    grid.put(REGION, "D-1", json!("while-away"));

    let outcome = client.revive().await.unwrap();
    assert_eq!(outcome.mode, ReviveMode::CatchUp);
    assert_eq!(
      recorder.last_value(REGION, "D-1"),
      Some(Some(json!("while-away")))
    );
  }
}

#[tokio::test(start_paused = true)]
async fn test_destroy_during_absence_is_caught_up() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = connected(&grid, 300).await;
  grid.put(REGION, "D-1", json!(1));
  assert!(recorder.wait_for(1, Duration::from_secs(5)).await);

  client.disconnect(DisconnectCause::KeepAlive).await.unwrap();
  grid.destroy(REGION, "D-1");
  client.revive().await.unwrap();

  let events = recorder.events_for(REGION, "D-1");
  assert_eq!(events.len(), 2);
  assert_eq!(events[1].operation, EventOperation::Destroy);
  assert_eq!(client.value(REGION, "D-1"), None);
}

// =============================================================================
// Expiry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_revive_just_before_deadline_succeeds() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = connected(&grid, 300).await;
  client.disconnect(DisconnectCause::Crash).await.unwrap();
  grid.put(REGION, "D-1", json!(1));

  tokio::time::sleep(Duration::from_secs(299)).await;
  let outcome = client.revive().await.unwrap();
  assert_eq!(outcome.mode, ReviveMode::CatchUp);
  assert_eq!(recorder.count_for(REGION, "D-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_revive_at_deadline_is_expired() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = connected(&grid, 300).await;
  client.disconnect(DisconnectCause::Crash).await.unwrap();
  grid.put(REGION, "D-1", json!(1));

  tokio::time::sleep(Duration::from_secs(300)).await;
  let err = client.revive().await.unwrap_err();
  assert_eq!(
    err,
    DurableError::RevivalExpired {
      client_id: CLIENT_ID.into()
    }
  );
  assert!(!err.is_retryable());

  // Back live on a fresh session; the missed update is lost
  assert_eq!(client.session_phase(), SessionPhase::Live);
  assert_eq!(recorder.count_for(REGION, "D-1"), 0);
  assert!(matches!(
    client.status().warning,
    Some(DurableError::RevivalExpired { .. })
  ));

  grid.put(REGION, "D-1", json!(2));
  assert!(recorder.wait_for(1, Duration::from_secs(5)).await);
  assert_eq!(recorder.last_value(REGION, "D-1"), Some(Some(json!(2))));
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_discards_on_any_disconnect() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, _recorder) = connected(&grid, 0).await;

  assert_eq!(
    client.disconnect(DisconnectCause::KeepAlive).await.unwrap(),
    SessionPhase::QueueDiscarded
  );
  assert!(!grid.session_exists(CLIENT_ID));
  assert_eq!(
    client.revive().await.unwrap_err(),
    DurableError::RevivalUnavailable
  );
}

#[tokio::test(start_paused = true)]
async fn test_longest_timeout_survives_keep_alive_disconnect() {
  assert!(matches!(
    SessionIdentity::new(CLIENT_ID, u64::MAX, 0),
    Err(DurableError::Config(_))
  ));

  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, _recorder) = connected(&grid, MAX_DURABLE_TIMEOUT_SECS).await;
  assert_eq!(
    client.disconnect(DisconnectCause::KeepAlive).await.unwrap(),
    SessionPhase::QueueRetained
  );
  assert!(grid.session_exists(CLIENT_ID));
  client.revive().await.unwrap();
  assert_eq!(client.session_phase(), SessionPhase::Live);
}

// =============================================================================
// Discarded queues
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_close_without_keep_alive_starts_fresh() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = connected(&grid, 300).await;

  assert_eq!(
    client.disconnect(DisconnectCause::Close).await.unwrap(),
    SessionPhase::QueueDiscarded
  );
  assert!(!grid.session_exists(CLIENT_ID));
  grid.put(REGION, "D-1", json!(1));

  assert_eq!(
    client.revive().await.unwrap_err(),
    DurableError::RevivalUnavailable
  );

  let outcome = client.connect().await.unwrap();
  assert_eq!(outcome.mode, ReviveMode::FreshSession);
  assert!(outcome.catch_up.is_none());
  assert_eq!(outcome.replay.sent, 2);
  assert_eq!(recorder.count(), 0);

  grid.put(REGION, "D-1", json!(2));
  assert!(recorder.wait_for(1, Duration::from_secs(5)).await);
  assert_eq!(client.value(REGION, "D-1"), Some(json!(2)));
}

#[tokio::test(start_paused = true)]
async fn test_close_after_keep_alive_disconnect_discards_queue() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, _recorder) = connected(&grid, 300).await;
  client.disconnect(DisconnectCause::KeepAlive).await.unwrap();
  grid.put(REGION, "D-1", json!(1));
  assert_eq!(grid.retained_len(CLIENT_ID), 1);

  client.close(false).await.unwrap();
  assert_eq!(client.session_phase(), SessionPhase::Closed);
  assert!(!grid.session_exists(CLIENT_ID));
  assert_eq!(grid.connection_count("s1"), 0);

  // A restarted process with the same identity finds nothing to catch up on
  let (next, recorder) = durable_client(&grid, 300);
  next
    .register_interest(REGION, InterestPattern::key("D-1"), true)
    .await
    .unwrap_err();
  let outcome = next.connect().await.unwrap();
  assert_eq!(outcome.catch_up.map(|c| c.received).unwrap_or(0), 0);
  assert_eq!(recorder.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_close_after_disconnect_keeps_queue() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, _recorder) = connected(&grid, 300).await;
  client.disconnect(DisconnectCause::KeepAlive).await.unwrap();
  grid.put(REGION, "D-1", json!(1));

  client.close(true).await.unwrap();
  assert!(grid.session_exists(CLIENT_ID));
  assert_eq!(grid.retained_len(CLIENT_ID), 1);
}

#[tokio::test(start_paused = true)]
async fn test_new_process_reclaims_kept_alive_queue() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (first, _) = connected(&grid, 300).await;
  first.close(true).await.unwrap();
  assert_eq!(first.session_phase(), SessionPhase::Closed);
  grid.put(REGION, "D-1", json!("queued"));

  // A second client presenting the same identity picks the queue up on connect
  let (second, recorder) = durable_client(&grid, 300);
  second
    .register_interest(REGION, InterestPattern::key("D-1"), true)
    .await
    .unwrap_err();
  let outcome = second.connect().await.unwrap();
  assert_eq!(outcome.mode, ReviveMode::CatchUp);
  assert_eq!(
    recorder.last_value(REGION, "D-1"),
    Some(Some(json!("queued")))
  );
}

// =============================================================================
// Duplicates and ordering
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_duplicate_and_stale_events_are_suppressed() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = connected(&grid, 300).await;

  let seq = grid.put(REGION, "D-1", json!("a"));
  assert!(recorder.wait_for(1, Duration::from_secs(5)).await);

  grid.push_raw(
    CLIENT_ID,
    RawEvent::new(REGION, "D-1", EventOperation::Update, Some(json!("a")), seq),
  );
  grid.push_raw(
    CLIENT_ID,
    RawEvent::new(REGION, "D-1", EventOperation::Update, Some(json!("old")), 0),
  );
  grid.put(REGION, "D-1", json!("b"));
  assert!(recorder.wait_for(2, Duration::from_secs(5)).await);

  let values: Vec<_> = recorder
    .events_for(REGION, "D-1")
    .into_iter()
    .map(|e| e.value)
    .collect();
  assert_eq!(values, vec![Some(json!("a")), Some(json!("b"))]);
  assert_eq!(client.delivery_stats().duplicates, 2);
}

#[tokio::test(start_paused = true)]
async fn test_uninteresting_keys_are_not_delivered() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = connected(&grid, 300).await;
  grid.put(REGION, "other", json!(1));
  grid.put("region2", "D-1", json!(1));
  grid.put(REGION, "D-1", json!(1));
  assert!(recorder.wait_for(1, Duration::from_secs(5)).await);
  assert_eq!(recorder.count(), 1);
  assert_eq!(client.value(REGION, "other"), None);
}

// =============================================================================
// Revival failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_replay_retries_transient_failures() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = connected(&grid, 300).await;
  client.disconnect(DisconnectCause::KeepAlive).await.unwrap();
  grid.put(REGION, "D-1", json!(1));

  grid.fail_registrations("s1", 2);
  let outcome = client.revive().await.unwrap();
  assert_eq!(outcome.replay.retries, 2);
  assert_eq!(outcome.replay.sent, 2);
  assert_eq!(recorder.count_for(REGION, "D-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_replay_outliving_timeout_expires_session() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, _recorder) = connected(&grid, 2).await;
  client.disconnect(DisconnectCause::KeepAlive).await.unwrap();

  grid.fail_registrations("s1", 1_000);
  let err = client.revive().await.unwrap_err();
  assert!(matches!(err, DurableError::RevivalExpired { .. }));
  assert_eq!(client.session_phase(), SessionPhase::Expired);
}

#[tokio::test(start_paused = true)]
async fn test_failed_revival_keeps_queue_retained() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = connected(&grid, 300).await;
  client.disconnect(DisconnectCause::KeepAlive).await.unwrap();
  grid.put(REGION, "D-1", json!(1));

  grid.kill_server("s1");
  assert!(client.revive().await.is_err());
  assert_eq!(client.session_phase(), SessionPhase::QueueRetained);

  grid.start_server("s1");
  client.revive().await.unwrap();
  assert_eq!(recorder.count_for(REGION, "D-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_revive_is_rejected() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, _recorder) = connected(&grid, 300).await;
  client.disconnect(DisconnectCause::KeepAlive).await.unwrap();

  // One failed registration parks the first revival in its backoff sleep
  grid.fail_registrations("s1", 1);
  let (first, second) = tokio::join!(client.revive(), client.revive());
  assert!(first.is_ok());
  assert_eq!(second.unwrap_err(), DurableError::RevivalInProgress);
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_pending_revival() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, _recorder) = connected(&grid, 300).await;
  client.disconnect(DisconnectCause::KeepAlive).await.unwrap();

  grid.fail_registrations("s1", 1_000);
  let reviving = {
    let client = client.clone();
    tokio::spawn(async move { client.revive().await })
  };
  tokio::time::sleep(Duration::from_millis(50)).await;

  client.close(false).await.unwrap();
  assert_eq!(reviving.await.unwrap().unwrap_err(), DurableError::Closed);
  assert_eq!(client.session_phase(), SessionPhase::Closed);
  assert_eq!(
    client.revive().await.unwrap_err(),
    DurableError::Closed
  );
}

#[tokio::test(start_paused = true)]
async fn test_revive_while_live_is_invalid() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, _recorder) = connected(&grid, 300).await;
  assert!(matches!(
    client.revive().await.unwrap_err(),
    DurableError::InvalidState {
      phase: SessionPhase::Live,
      ..
    }
  ));
}

// =============================================================================
// Interest registration
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_registration_before_connect_is_replayed() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = durable_client(&grid, 300);

  let err = client
    .register_interest(REGION, InterestPattern::regex("D-.*"), true)
    .await
    .unwrap_err();
  assert!(matches!(err, DurableError::NotConnected(_)));
  assert_eq!(client.list_interests(REGION).len(), 1);

  client.connect().await.unwrap();
  assert_eq!(grid.registrations("s1"), client.list_interests(REGION));

  grid.put(REGION, "D-7", json!(7));
  assert!(recorder.wait_for(1, Duration::from_secs(5)).await);
}

#[tokio::test(start_paused = true)]
async fn test_identical_registration_is_idempotent() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, _recorder) = connected(&grid, 300).await;
  let before = grid.registrations("s1").len();

  client
    .register_interest(REGION, InterestPattern::key("D-1"), true)
    .await
    .unwrap();
  assert_eq!(grid.registrations("s1").len(), before);
  assert_eq!(client.list_interests(REGION).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_registration_is_sent_again() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = connected(&grid, 300).await;

  grid.fail_registrations("s1", 1);
  let err = client
    .register_interest(REGION, InterestPattern::key("D-2"), true)
    .await
    .unwrap_err();
  assert!(err.is_retryable());
  assert_eq!(client.list_interests(REGION).len(), 2);
  assert!(!grid
    .session_interests(CLIENT_ID)
    .iter()
    .any(|e| e.pattern == InterestPattern::key("D-2")));

  client
    .register_interest(REGION, InterestPattern::key("D-2"), true)
    .await
    .unwrap();
  assert!(grid
    .session_interests(CLIENT_ID)
    .iter()
    .any(|e| e.pattern == InterestPattern::key("D-2") && e.durable));

  grid.put(REGION, "D-2", json!(1));
  assert!(recorder.wait_for(1, Duration::from_secs(5)).await);
  assert_eq!(recorder.count_for(REGION, "D-2"), 1);

  // Confirmed now, so a third call sends nothing
  let before = grid.registrations("s1").len();
  client
    .register_interest(REGION, InterestPattern::key("D-2"), true)
    .await
    .unwrap();
  assert_eq!(grid.registrations("s1").len(), before);
}

#[tokio::test(start_paused = true)]
async fn test_replay_confirms_offline_registrations() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, _recorder) = durable_client(&grid, 300);
  assert!(matches!(
    client
      .register_interest(REGION, InterestPattern::key("D-1"), true)
      .await,
    Err(DurableError::NotConnected(_))
  ));
  client.connect().await.unwrap();
  let before = grid.registrations("s1").len();
  assert_eq!(before, 1);

  client
    .register_interest(REGION, InterestPattern::key("D-1"), true)
    .await
    .unwrap();
  assert_eq!(grid.registrations("s1").len(), before);
}

#[tokio::test(start_paused = true)]
async fn test_registration_keeps_retrying_until_acknowledged() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, _recorder) = connected(&grid, 300).await;

  grid.fail_registrations("s1", 2);
  for _ in 0..2 {
    assert!(client
      .register_interest(REGION, InterestPattern::regex("D-.*"), true)
      .await
      .is_err());
  }
  client
    .register_interest(REGION, InterestPattern::regex("D-.*"), true)
    .await
    .unwrap();
  assert!(grid
    .session_interests(CLIENT_ID)
    .iter()
    .any(|e| e.pattern == InterestPattern::regex("D-.*")));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_regex_is_rejected_locally() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, _recorder) = connected(&grid, 300).await;
  let err = client
    .register_interest(REGION, InterestPattern::regex("D-("), true)
    .await
    .unwrap_err();
  assert!(matches!(err, DurableError::InvalidPattern { .. }));
  assert_eq!(client.list_interests(REGION).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unregister_stops_delivery() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = connected(&grid, 300).await;

  assert!(client
    .unregister_interest(REGION, &InterestPattern::key("K-1"))
    .await
    .unwrap());
  assert!(!client
    .unregister_interest(REGION, &InterestPattern::key("K-1"))
    .await
    .unwrap());

  grid.put(REGION, "K-1", json!(1));
  grid.put(REGION, "D-1", json!(1));
  assert!(recorder.wait_for(1, Duration::from_secs(5)).await);
  assert_eq!(recorder.count_for(REGION, "K-1"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_remove_region_forgets_interests_and_state() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, recorder) = connected(&grid, 300).await;
  grid.put(REGION, "D-1", json!(1));
  assert!(recorder.wait_for(1, Duration::from_secs(5)).await);

  let removed = client.remove_region(REGION).await;
  assert_eq!(removed.len(), 2);
  assert!(client.list_interests(REGION).is_empty());
  assert_eq!(client.value(REGION, "D-1"), None);
  assert!(grid.session_interests(CLIENT_ID).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_operations_after_close_fail() {
  let grid = Arc::new(InMemoryGrid::with_servers(["s1"]));
  let (client, _recorder) = connected(&grid, 300).await;
  client.close(false).await.unwrap();
  client.close(false).await.unwrap();

  assert_eq!(
    client
      .register_interest(REGION, InterestPattern::key("x"), true)
      .await
      .unwrap_err(),
    DurableError::Closed
  );
  assert_eq!(
    client.disconnect(DisconnectCause::KeepAlive).await.unwrap_err(),
    DurableError::Closed
  );
  assert!(!grid.session_exists(CLIENT_ID));
}
