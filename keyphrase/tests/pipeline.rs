//! End-to-end tests driving the change-feed pipeline over in-memory storage.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use keyphrase::model::{Connection, MAX_OCCURRENCES, OccurrenceRecord, TotalScope};
use keyphrase::push::{PushClient, PushClientFactory};
use keyphrase::traits::ConnectionRegistry;
use keyphrase::{Config, KeyphraseService, PipelineConfig, Result};
use serde_json::{Value, json};

#[derive(Debug, Clone)]
struct Push {
    endpoint: String,
    recipients: Vec<String>,
    payload: Value,
}

#[derive(Default)]
struct Recorder {
    pushes: Mutex<Vec<Push>>,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    send_delay_ms: AtomicU64,
}

impl Recorder {
    fn pushes(&self) -> Vec<Push> {
        self.pushes.lock().unwrap().clone()
    }

    fn pushes_to(&self, connection_id: &str) -> Vec<Value> {
        self.pushes()
            .into_iter()
            .filter(|p| p.recipients.iter().any(|r| r == connection_id))
            .map(|p| p.payload)
            .collect()
    }
}

struct RecordingFactory(Arc<Recorder>);

#[async_trait]
impl PushClientFactory for RecordingFactory {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn PushClient>> {
        let failing = &self.0.failing_connects;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(keyphrase::Error::Transport("gateway unavailable".into()));
        }
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(RecordingClient {
            endpoint: endpoint.to_string(),
            recorder: self.0.clone(),
        }))
    }
}

struct RecordingClient {
    endpoint: String,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl PushClient for RecordingClient {
    async fn send(&self, recipients: &[String], payload: Bytes) -> Result<()> {
        let delay = self.recorder.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.recorder.pushes.lock().unwrap().push(Push {
            endpoint: self.endpoint.clone(),
            recipients: recipients.to_vec(),
            payload: serde_json::from_slice(&payload).unwrap(),
        });
        Ok(())
    }
}

async fn open() -> (KeyphraseService, Arc<Recorder>) {
    open_with(PipelineConfig {
        batch_window: Duration::from_millis(5),
        retry_delay: Duration::from_millis(10),
        ..Default::default()
    })
    .await
}

async fn open_with(pipeline: PipelineConfig) -> (KeyphraseService, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let config = Config {
        pipeline,
        ..Default::default()
    };
    let service = KeyphraseService::open_with_clients(
        config,
        Arc::new(RecordingFactory(recorder.clone())),
    )
    .await
    .unwrap();
    (service, recorder)
}

const POLL_ATTEMPTS: usize = 200;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Waits until the total of `keyphrase` in `scope` equals `expected`.
async fn wait_for_total(
    service: &KeyphraseService,
    scope: &TotalScope,
    keyphrase: &str,
    expected: u64,
) {
    for _ in 0..POLL_ATTEMPTS {
        let total = service.storage().read_total(scope, keyphrase).await.unwrap();
        if total == expected {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("total of {} in {:?} never reached {}", keyphrase, scope, expected);
}

/// Waits until `connection_id` received a push satisfying `matches`.
async fn wait_for_push(recorder: &Recorder, connection_id: &str, matches: impl Fn(&Value) -> bool) {
    for _ in 0..POLL_ATTEMPTS {
        if recorder.pushes_to(connection_id).iter().any(&matches) {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    panic!("no matching push for {}", connection_id);
}

fn occurrence(site: &str, pathname: &str, keyphrase: &str, occurrences: u64) -> OccurrenceRecord {
    OccurrenceRecord {
        site_key: site.to_string(),
        pathname: pathname.to_string(),
        keyphrase: keyphrase.to_string(),
        occurrences,
        aggregated: None,
    }
}

fn connection(id: &str, endpoint: &str, listening_key: &str) -> Connection {
    Connection {
        connection_id: id.to_string(),
        callback_endpoint: endpoint.to_string(),
        listening_key: listening_key.to_string(),
    }
}

#[tokio::test]
async fn should_aggregate_site_and_global_totals() {
    // given
    let (service, _) = open().await;
    let site = TotalScope::Site("example.com".to_string());
    service
        .storage()
        .put_occurrences(&[occurrence("example.com", "/a", "widget", 2)])
        .await
        .unwrap();
    wait_for_total(&service, &site, "widget", 2).await;

    // when
    service
        .storage()
        .put_occurrences(&[
            occurrence("example.com", "/a", "widget", 5),
            occurrence("other.org", "/b", "widget", 4),
        ])
        .await
        .unwrap();

    // then
    wait_for_total(&service, &site, "widget", 5).await;
    wait_for_total(&service, &TotalScope::Global, "widget", 9).await;
    service.close().await.unwrap();
}

#[tokio::test]
async fn should_push_changes_to_listening_connections() {
    // given
    let (service, recorder) = open().await;
    service
        .storage()
        .register(&connection("c1", "wss://gw/x", "example.com"))
        .await
        .unwrap();
    service
        .storage()
        .register(&connection("c2", "wss://gw/x", "other.org"))
        .await
        .unwrap();

    // when
    service
        .storage()
        .put_occurrences(&[occurrence("example.com", "/a", "widget", 3)])
        .await
        .unwrap();

    // then
    wait_for_push(&recorder, "c1", |p| {
        p == &json!([{"pathname": "/a", "keyphrase": "widget", "occurrences": 3}])
    })
    .await;
    wait_for_push(&recorder, "c1", |p| {
        p == &json!([{"pathname": "", "keyphrase": "widget", "occurrences": 3}])
    })
    .await;
    assert!(recorder.pushes_to("c2").is_empty());
    assert!(recorder.pushes().iter().all(|p| p.endpoint == "wss://gw/x"));
    service.close().await.unwrap();
}

#[tokio::test]
async fn should_push_zero_when_occurrence_is_removed() {
    // given
    let (service, recorder) = open().await;
    service
        .storage()
        .register(&connection("c1", "wss://gw/x", "example.com"))
        .await
        .unwrap();
    service
        .storage()
        .put_occurrences(&[occurrence("example.com", "/a", "widget", 3)])
        .await
        .unwrap();

    // when
    service
        .storage()
        .delete_occurrence("example.com", "/a", "widget")
        .await
        .unwrap();

    // then
    let removed = json!({"pathname": "/a", "keyphrase": "widget", "occurrences": 0});
    wait_for_push(&recorder, "c1", |p| {
        p.as_array().is_some_and(|rows| rows.contains(&removed))
    })
    .await;
    service.close().await.unwrap();
}

#[tokio::test]
async fn should_send_snapshot_to_new_connection() {
    // given
    let (service, recorder) = open().await;
    let site = TotalScope::Site("example.com".to_string());
    service
        .storage()
        .put_occurrences(&[
            occurrence("example.com", "/a", "widget", 2),
            occurrence("example.com", "/b", "widget", 1),
        ])
        .await
        .unwrap();
    wait_for_total(&service, &site, "widget", 3).await;

    // when
    service
        .storage()
        .register(&connection("c1", "wss://gw/x", "example.com"))
        .await
        .unwrap();

    // then
    let snapshot = json!([
        {"pathname": "/a", "keyphrase": "widget", "occurrences": 2},
        {"pathname": "/b", "keyphrase": "widget", "occurrences": 1},
        {"pathname": "", "keyphrase": "widget", "occurrences": 3}
    ]);
    wait_for_push(&recorder, "c1", |p| p == &snapshot).await;
    service.close().await.unwrap();
}

#[tokio::test]
async fn should_stay_silent_for_new_connection_on_empty_site() {
    // given
    let (service, recorder) = open().await;

    // when
    service
        .storage()
        .register(&connection("c1", "wss://gw/x", "silent.example"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.close().await.unwrap();

    // then
    assert_eq!(recorder.connects.load(Ordering::SeqCst), 0);
    assert!(recorder.pushes().is_empty());
}

#[tokio::test]
async fn should_redeliver_after_transient_push_failure() {
    // given
    let (service, recorder) = open().await;
    service
        .storage()
        .register(&connection("c1", "wss://gw/x", "example.com"))
        .await
        .unwrap();
    recorder.failing_connects.store(1, Ordering::SeqCst);

    // when
    service
        .storage()
        .put_occurrences(&[occurrence("example.com", "/a", "widget", 7)])
        .await
        .unwrap();

    // then
    wait_for_push(&recorder, "c1", |p| {
        p == &json!([{"pathname": "/a", "keyphrase": "widget", "occurrences": 7}])
    })
    .await;
    service.close().await.unwrap();
}

#[tokio::test]
async fn should_keep_aggregating_while_fanout_is_stalled() {
    // given
    let (service, recorder) = open_with(PipelineConfig {
        batch_size: 1,
        batch_window: Duration::from_millis(1),
        retry_delay: Duration::from_millis(1),
        ..Default::default()
    })
    .await;
    recorder.send_delay_ms.store(50, Ordering::SeqCst);
    service
        .storage()
        .register(&connection("c1", "wss://gw/x", "example.com"))
        .await
        .unwrap();

    // when
    for page in 0..100 {
        service
            .storage()
            .put_occurrences(&[occurrence("example.com", &format!("/p{}", page), "widget", 1)])
            .await
            .unwrap();
    }

    // then
    wait_for_total(&service, &TotalScope::Global, "widget", 100).await;
    wait_for_total(
        &service,
        &TotalScope::Site("example.com".to_string()),
        "widget",
        100,
    )
    .await;
    assert!(recorder.pushes().len() < 100);
    // fan-out is still draining its backlog; skip waiting for it on close
    drop(service);
}

#[tokio::test]
async fn should_aggregate_largest_count_and_reject_larger() {
    // given
    let (service, _) = open().await;

    // when
    let largest = service
        .storage()
        .put_occurrences(&[occurrence("example.com", "/a", "widget", MAX_OCCURRENCES)])
        .await;
    let above = service
        .storage()
        .put_occurrences(&[occurrence("example.com", "/b", "widget", MAX_OCCURRENCES + 1)])
        .await;

    // then
    assert!(largest.is_ok());
    assert!(matches!(above, Err(keyphrase::Error::InvalidInput(_))));
    wait_for_total(&service, &TotalScope::Global, "widget", MAX_OCCURRENCES).await;
    service.close().await.unwrap();
}
