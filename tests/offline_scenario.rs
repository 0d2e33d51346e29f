use async_trait::async_trait;
use chrono::Duration;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use offline_sync::{
  CacheSource, Collaborators, Config, FetchError, ManualClock, ManualReachability, MemoryStore,
  OfflineClient, ReadApi, SendError, SqliteStore, WriteApi, WriteRequest,
};

#[derive(Default)]
struct RecordingWriteApi {
  calls: Mutex<Vec<WriteRequest>>,
}

impl RecordingWriteApi {
  fn calls(&self) -> Vec<WriteRequest> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl WriteApi for RecordingWriteApi {
  async fn send(&self, request: &WriteRequest) -> Result<(), SendError> {
    self.calls.lock().unwrap().push(request.clone());
    Ok(())
  }
}

#[derive(Default)]
struct CountingReadApi {
  fetches: Mutex<Vec<String>>,
}

impl CountingReadApi {
  fn fetches_of(&self, key: &str) -> usize {
    self.fetches.lock().unwrap().iter().filter(|k| *k == key).count()
  }
}

#[async_trait]
impl ReadApi for CountingReadApi {
  async fn fetch(&self, key: &str) -> Result<Value, FetchError> {
    let mut fetches = self.fetches.lock().unwrap();
    fetches.push(key.to_string());
    Ok(json!({ "key": key, "version": fetches.len() }))
  }
}

fn collaborators(
  write: &Arc<RecordingWriteApi>,
  read: &Arc<CountingReadApi>,
  online: bool,
) -> Collaborators {
  Collaborators {
    write_api: write.clone(),
    read_api: read.clone(),
    reachability: Arc::new(ManualReachability::new(online)),
  }
}

/// Let any spawned drain run to completion.
async fn settle(client: &OfflineClient) {
  loop {
    tokio::task::yield_now().await;
    client.engine().wait_idle().await;
    if !client.engine().drain().await.coalesced {
      break;
    }
  }
}

#[tokio::test]
async fn offline_write_is_delivered_once_after_reconnect() {
  let write = Arc::new(RecordingWriteApi::default());
  let read = Arc::new(CountingReadApi::default());
  let client = OfflineClient::with_store(
    Arc::new(MemoryStore::new()),
    Arc::new(ManualClock::default()),
    &Config::default(),
    collaborators(&write, &read, false),
  )
  .unwrap();
  client.start();

  let submission = client
    .submit_action("participate", json!({ "eventId": 7 }))
    .await
    .unwrap();
  assert!(submission.queued);
  assert_eq!(client.pending_action_count(), 1);
  assert!(write.calls().is_empty());

  client.monitor().report(true);
  settle(&client).await;

  let calls = write.calls();
  assert_eq!(calls.len(), 1);
  assert_eq!(calls[0].kind, "participate");
  assert_eq!(calls[0].payload, json!({ "eventId": 7 }));
  assert_eq!(calls[0].id, submission.action_id);
  assert_eq!(client.pending_action_count(), 0);
  assert_eq!(client.sync_status().pending_count, 0);

  client.shutdown().await.unwrap();
}

#[tokio::test]
async fn queued_actions_survive_a_restart() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("store.db");
  let write = Arc::new(RecordingWriteApi::default());
  let read = Arc::new(CountingReadApi::default());

  {
    let client = OfflineClient::with_store(
      Arc::new(SqliteStore::open_at(&path).unwrap()),
      Arc::new(ManualClock::default()),
      &Config::default(),
      collaborators(&write, &read, false),
    )
    .unwrap();
    client.start();
    client.submit_action("like", json!({ "postId": 1 })).await.unwrap();
    client.submit_action("comment", json!({ "postId": 1 })).await.unwrap();
    client.shutdown().await.unwrap();
  }

  let client = OfflineClient::with_store(
    Arc::new(SqliteStore::open_at(&path).unwrap()),
    Arc::new(ManualClock::default()),
    &Config::default(),
    collaborators(&write, &read, true),
  )
  .unwrap();
  assert_eq!(client.pending_action_count(), 2);

  client.start();
  settle(&client).await;

  let kinds: Vec<String> = write.calls().into_iter().map(|c| c.kind).collect();
  assert_eq!(kinds, vec!["like", "comment"]);
  assert_eq!(client.pending_action_count(), 0);
}

#[tokio::test]
async fn stale_read_is_served_then_refreshed() {
  let write = Arc::new(RecordingWriteApi::default());
  let read = Arc::new(CountingReadApi::default());
  let clock = Arc::new(ManualClock::default());
  let mut config = Config::default();
  config.prefetch.enabled = false;
  let client = OfflineClient::with_store(
    Arc::new(MemoryStore::new()),
    clock.clone(),
    &config,
    collaborators(&write, &read, true),
  )
  .unwrap();

  let ttl = Duration::seconds(1);
  let first = client.read_key("events", ttl).await.unwrap();
  assert_eq!(first.source, CacheSource::Network);

  clock.advance(Duration::seconds(2));
  let stale = client.read_key("events", ttl).await.unwrap();
  assert_eq!(stale.source, CacheSource::CacheStale);
  assert_eq!(stale.value, first.value);

  client.cache().wait_for_refreshes().await;
  assert_eq!(read.fetches_of("events"), 2);

  let fresh = client.read_key("events", ttl).await.unwrap();
  assert_eq!(fresh.source, CacheSource::CacheFresh);
  assert_eq!(fresh.value["version"], json!(2));
}
