//! Activation, eviction, and resume across a simulated restart.

use std::time::Duration;

use courier_engine::{ActivationError, ActorRef, FailureKind, FetchOptions, FetchTarget};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{Harness, record, recorder, suppressed};

#[tokio::test]
async fn unknown_binding_fails_activation() {
    let harness = Harness::new();
    let system = harness.system();

    let ghost = ActorRef::new("ghost", "one").unwrap();
    assert!(matches!(
        system.actor(&ghost).await,
        Err(ActivationError::UnknownBinding(name)) if name == "ghost"
    ));
}

#[tokio::test]
async fn overdue_wakeup_fires_after_resume() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let id = recorder("sleepy");
    let req_id = {
        let system = harness.builder(suppressed()).build().unwrap();
        let actor = system.actor(&id).await.unwrap();
        let req_id = actor
            .race_fetch(
                FetchTarget::get(server.uri()).unwrap(),
                record("late"),
                FetchOptions {
                    timeout_ms: 150,
                    ..FetchOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(system.evict(&id));
        system.shutdown();
        req_id
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(harness.deliveries().is_empty());

    let system = harness.builder(suppressed()).build().unwrap();
    let report = system.resume().await.unwrap();
    assert_eq!(report.actors, 1);

    let seen = harness.wait_for(1).await;
    assert_eq!(seen[0].1.req_id, req_id);
    assert_eq!(seen[0].1.error().map(|e| e.kind), Some(FailureKind::Timeout));
}

#[tokio::test]
async fn evicted_queue_recovers_in_flight_entries_on_reactivation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let system = harness.system();
    let actor = system.actor(&recorder("a")).await.unwrap();
    actor
        .enqueue_fetch(
            FetchTarget::get(server.uri()).unwrap(),
            Some(record("survivor")),
            FetchOptions::default(),
        )
        .await
        .unwrap();

    // Crash the processor while the call is outstanding.
    assert!(system.evict_queue("default"));
    let queue = system.queue("default").await.unwrap();

    let seen = harness.wait_for(1).await;
    assert_eq!(seen[0].0, "survivor");
    system.idle().await;
    let stats = queue.stats().unwrap();
    assert_eq!((stats.queued, stats.in_flight), (0, 0));
}
