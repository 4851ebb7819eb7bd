//! Durable queue: delivery, retry, ordering, recovery.

use std::time::{Duration, SystemTime};

use courier_engine::{
    Continuation, CourierConfig, FailureKind, FetchOptions, FetchTarget, Invocation, QueueConfig,
    QueueStatus, SubmitError,
};
use courier_store::{ActorStore, epoch_ms};
use courier_types::FetchRequest;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{Harness, closed_port, quick_retries, record, recorder};

fn queue_db(harness: &Harness) -> ActorStore {
    ActorStore::open(harness.dir.path().join(".queue").join("default.db")).unwrap()
}

fn single_batches() -> CourierConfig {
    CourierConfig {
        queue: Some(QueueConfig {
            batch_size: Some(1),
            retry_jitter: Some(0.0),
            ..QueueConfig::default()
        }),
        ..CourierConfig::default()
    }
}

fn seeded(server: &MockServer, label: &str) -> FetchRequest {
    FetchRequest::new(
        FetchTarget::get(format!("{}/{label}", server.uri())).unwrap(),
        recorder("seeded"),
        Some(record(label)),
        FetchOptions::default(),
    )
}

#[tokio::test]
async fn client_error_is_delivered_as_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let system = harness.system();
    let actor = system.actor(&recorder("a")).await.unwrap();
    let req_id = actor
        .enqueue_fetch(
            FetchTarget::get(format!("{}/missing", server.uri())).unwrap(),
            Some(record("missing")),
            FetchOptions::default(),
        )
        .await
        .unwrap();

    let seen = harness.wait_for(1).await;
    let (label, result) = &seen[0];
    assert_eq!(label, "missing");
    assert_eq!(result.req_id, req_id);
    assert_eq!(result.retry_count, 0);
    let response = result.response().expect("404 is a response, not an error");
    assert_eq!(response.status, 404);
    assert!(!response.ok);
    assert_eq!(response.text(), "nope");

    system.idle().await;
    let queue = system.queue("default").await.unwrap();
    assert_eq!(
        queue.stats().unwrap(),
        QueueStatus {
            queued: 0,
            in_flight: 0,
            alarm_at_ms: None,
        }
    );
}

#[tokio::test]
async fn unreachable_host_is_delivered_as_error() {
    let harness = Harness::new();
    let system = harness.system();
    let actor = system.actor(&recorder("a")).await.unwrap();
    actor
        .enqueue_fetch(
            FetchTarget::get(format!("http://127.0.0.1:{}/", closed_port())).unwrap(),
            Some(record("down")),
            quick_retries(0),
        )
        .await
        .unwrap();

    let seen = harness.wait_for(1).await;
    let error = seen[0].1.error().expect("connection refused is an error");
    assert_eq!(error.kind, FailureKind::Transport);
    assert!(seen[0].1.response().is_none());
}

#[tokio::test]
async fn server_errors_retry_until_budget_is_spent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let system = harness.system();
    let actor = system.actor(&recorder("a")).await.unwrap();
    actor
        .enqueue_fetch(
            FetchTarget::get(server.uri()).unwrap(),
            Some(record("flaky")),
            quick_retries(2),
        )
        .await
        .unwrap();

    let seen = harness.wait_for(1).await;
    let result = &seen[0].1;
    assert_eq!(result.response().map(|r| r.status), Some(500));
    assert_eq!(result.retry_count, 2);

    system.idle().await;
    assert_eq!(harness.deliveries().len(), 1);
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let system = harness.system();
    let actor = system.actor(&recorder("a")).await.unwrap();
    actor
        .enqueue_fetch(
            FetchTarget::get(server.uri()).unwrap(),
            Some(record("eventually")),
            quick_retries(3),
        )
        .await
        .unwrap();

    let seen = harness.wait_for(1).await;
    let result = &seen[0].1;
    assert_eq!(result.response().map(|r| r.status), Some(200));
    assert_eq!(result.retry_count, 1);
}

#[tokio::test]
async fn oversized_retry_after_ms_falls_back_to_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).insert_header("retry-after-ms", "1e300"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let system = harness.system();
    let actor = system.actor(&recorder("a")).await.unwrap();
    actor
        .enqueue_fetch(
            FetchTarget::get(server.uri()).unwrap(),
            Some(record("throttled")),
            quick_retries(1),
        )
        .await
        .unwrap();

    let seen = harness.wait_for(1).await;
    assert_eq!(seen[0].1.response().map(|r| r.status), Some(200));
    assert_eq!(seen[0].1.retry_count, 1);

    system.idle().await;
    let stats = system.queue("default").await.unwrap().stats().unwrap();
    assert_eq!((stats.queued, stats.in_flight), (0, 0));
}

#[tokio::test]
async fn server_error_is_final_when_5xx_retry_disabled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let system = harness.system();
    let actor = system.actor(&recorder("a")).await.unwrap();
    actor
        .enqueue_fetch(
            FetchTarget::get(server.uri()).unwrap(),
            Some(record("once")),
            FetchOptions {
                retry_on_5xx: false,
                ..quick_retries(3)
            },
        )
        .await
        .unwrap();

    let seen = harness.wait_for(1).await;
    assert_eq!(seen[0].1.response().map(|r| r.status), Some(502));
    assert_eq!(seen[0].1.retry_count, 0);
}

#[tokio::test]
async fn fire_and_forget_executes_without_delivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let system = harness.system();
    let actor = system.actor(&recorder("a")).await.unwrap();
    actor
        .enqueue_fetch(
            FetchTarget::post(format!("{}/events", server.uri()))
                .unwrap()
                .body("{}"),
            None,
            FetchOptions::default(),
        )
        .await
        .unwrap();

    system.idle().await;
    assert!(harness.deliveries().is_empty());
}

#[tokio::test]
async fn handler_can_enqueue_during_its_turn() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let system = harness.system();
    let actor = system.actor(&recorder("a")).await.unwrap();
    actor
        .call(Invocation::new("fetch_later", vec![json!(server.uri())]))
        .await
        .unwrap();

    let seen = harness.wait_for(1).await;
    assert_eq!(seen[0].0, "from-handler");
    assert!(seen[0].1.response().is_some_and(|r| r.ok));
}

#[tokio::test]
async fn entries_are_claimed_in_submission_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = Harness::new();
    {
        let store = queue_db(&harness);
        for label in ["first", "second", "third"] {
            store
                .enqueue(&seeded(&server, label), SystemTime::now(), 0)
                .unwrap();
        }
    }

    let config = CourierConfig {
        queue: Some(QueueConfig {
            batch_size: Some(1),
            follow_up_delay_ms: Some(50),
            retry_jitter: Some(0.0),
            ..QueueConfig::default()
        }),
        ..CourierConfig::default()
    };
    let system = harness.builder(config).build().unwrap();
    system.queue("default").await.unwrap();

    let seen = harness.wait_for(3).await;
    let labels: Vec<&str> = seen.iter().map(|(label, _)| label.as_str()).collect();
    assert_eq!(labels, ["first", "second", "third"]);
}

#[tokio::test]
async fn backoff_alarm_does_not_postpone_the_next_batch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = Harness::new();
    {
        let store = queue_db(&harness);
        let now = SystemTime::now();
        let backoff_until = epoch_ms(now) + 20_000;
        store
            .enqueue(&seeded(&server, "backing-off"), now, backoff_until)
            .unwrap();
        store.set_alarm_no_later_than(backoff_until).unwrap();
        for label in ["b", "c"] {
            store.enqueue(&seeded(&server, label), now, 0).unwrap();
        }
    }

    let system = harness.builder(single_batches()).build().unwrap();
    let queue = system.queue("default").await.unwrap();

    let seen = harness.wait_for(2).await;
    let labels: Vec<&str> = seen.iter().map(|(label, _)| label.as_str()).collect();
    assert_eq!(labels, ["b", "c"]);

    system.idle().await;
    let stats = queue.stats().unwrap();
    assert_eq!((stats.queued, stats.in_flight), (1, 0));
}

#[tokio::test]
async fn corrupt_row_does_not_hold_back_its_batch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let db_path = harness.dir.path().join(".queue").join("default.db");
    {
        let store = queue_db(&harness);
        store
            .enqueue(&seeded(&server, "intact"), SystemTime::now(), 0)
            .unwrap();
    }
    {
        // Sorts ahead of the intact entry, so both land in one claimed batch.
        let db = rusqlite::Connection::open(&db_path).unwrap();
        db.execute(
            "INSERT INTO fetch_queue VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'r-bad', 'queued', 0, '{nope')",
            [],
        )
        .unwrap();
    }

    let system = harness.system();
    let queue = system.queue("default").await.unwrap();

    let seen = harness.wait_for(1).await;
    assert_eq!(seen[0].0, "intact");
    system.idle().await;
    assert_eq!(harness.deliveries().len(), 1);
    let stats = queue.stats().unwrap();
    assert_eq!((stats.queued, stats.in_flight), (0, 0));
}

#[tokio::test]
async fn recovery_replays_young_entries_and_drops_expired_ones() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let stale = seeded(&server, "stale");
    let fresh = seeded(&server, "fresh");
    {
        let store = queue_db(&harness);
        let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
        store.enqueue(&stale, an_hour_ago, 0).unwrap();
        store.enqueue(&fresh, SystemTime::now(), 0).unwrap();
        // Simulate a crash mid-execution.
        let claimed = store.claim_batch(10, epoch_ms(SystemTime::now())).unwrap();
        assert_eq!(claimed.len(), 2);
    }

    let system = harness.system();
    let queue = system.queue("default").await.unwrap();
    let seen = harness.wait_for(1).await;
    system.idle().await;

    assert_eq!(seen[0].0, "fresh");
    assert_eq!(harness.deliveries().len(), 1);
    assert!(queue.entry(&stale.req_id).unwrap().is_none());
    assert!(queue.entry(&fresh.req_id).unwrap().is_none());

    let paths: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    assert_eq!(paths, ["/fresh"]);
}

#[tokio::test]
async fn recovery_leaves_running_entries_alone() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let system = harness.system();
    let actor = system.actor(&recorder("a")).await.unwrap();
    let req_id = actor
        .enqueue_fetch(
            FetchTarget::get(server.uri()).unwrap(),
            Some(record("slow")),
            FetchOptions::default(),
        )
        .await
        .unwrap();

    let queue = system.queue("default").await.unwrap();
    assert!(queue.entry(&req_id).unwrap().is_some());
    let report = queue.recover().await.unwrap();
    assert_eq!(report.requeued, 0);
    assert_eq!(report.launched, 0);

    harness.wait_for(1).await;
    system.idle().await;
    assert_eq!(harness.deliveries().len(), 1);
}

#[tokio::test]
async fn invalid_submissions_are_rejected_without_persisting() {
    let harness = Harness::new();
    let system = harness.system();
    let actor = system.actor(&recorder("a")).await.unwrap();
    let target = FetchTarget::get("http://127.0.0.1:9/").unwrap();

    let zero_timeout = actor
        .enqueue_fetch(
            target.clone(),
            Some(record("x")),
            FetchOptions {
                timeout_ms: 0,
                ..FetchOptions::default()
            },
        )
        .await;
    assert!(matches!(zero_timeout, Err(SubmitError::Validation(_))));

    let wrong_method = actor
        .enqueue_fetch(
            target,
            Some(Continuation::new("missing").result()),
            FetchOptions::default(),
        )
        .await;
    assert!(matches!(wrong_method, Err(SubmitError::UnknownMethod { .. })));

    let queue = system.queue("default").await.unwrap();
    let stats = queue.stats().unwrap();
    assert_eq!((stats.queued, stats.in_flight), (0, 0));
}
