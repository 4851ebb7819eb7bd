//! Raced calls: executor reply against durable wake-up.

use std::sync::{Arc, Mutex};

use courier_engine::{
    Continuation, DispatchError, ExecutionContext, ExecutionTask, FailureKind, FetchOptions,
    FetchResult, FetchTarget, ResponseSnapshot, SubmitError,
};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{Harness, record, recorder, suppressed};

/// Refuses every task.
struct Refusing;

impl ExecutionContext for Refusing {
    fn dispatch(&self, task: ExecutionTask) -> Result<(), DispatchError> {
        Err(DispatchError::Rejected(format!("{} refused", task.req_id)))
    }
}

/// Accepts every task and holds it until the test replies by hand.
#[derive(Default)]
struct Stashing {
    tasks: Mutex<Vec<ExecutionTask>>,
}

impl Stashing {
    fn take(&self) -> ExecutionTask {
        self.tasks.lock().unwrap().pop().expect("a dispatched task")
    }
}

impl ExecutionContext for Stashing {
    fn dispatch(&self, task: ExecutionTask) -> Result<(), DispatchError> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

fn timeout(timeout_ms: u64) -> FetchOptions {
    FetchOptions {
        timeout_ms,
        ..FetchOptions::default()
    }
}

async fn ok_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn executor_reply_wins_and_later_wakeup_is_a_no_op() {
    let server = ok_server().await;
    let harness = Harness::new();
    let system = harness.system();
    let actor = system.actor(&recorder("a")).await.unwrap();

    let req_id = actor
        .race_fetch(
            FetchTarget::get(server.uri()).unwrap(),
            record("raced"),
            timeout(5_000),
        )
        .await
        .unwrap();

    let seen = harness.wait_for(1).await;
    assert_eq!(seen[0].1.req_id, req_id);
    assert_eq!(seen[0].1.response().map(|r| r.status), Some(200));
    assert!(!actor.has_pending_wakeup(&req_id).unwrap());

    assert!(!actor.fire_wakeup(&req_id).await.unwrap());
    system.idle().await;
    assert_eq!(harness.deliveries().len(), 1);
}

#[tokio::test]
async fn wakeup_delivers_timeout_when_executor_is_silent() {
    let server = ok_server().await;
    let harness = Harness::new();
    let system = harness.builder(suppressed()).build().unwrap();
    let actor = system.actor(&recorder("a")).await.unwrap();

    let req_id = actor
        .race_fetch(
            FetchTarget::get(server.uri()).unwrap(),
            record("silent"),
            timeout(100),
        )
        .await
        .unwrap();

    let seen = harness.wait_for(1).await;
    let (label, result) = &seen[0];
    assert_eq!(label, "silent");
    assert_eq!(result.req_id, req_id);
    let error = result.error().expect("timeout is an error outcome");
    assert_eq!(error.kind, FailureKind::Timeout);
    assert_eq!(error.message, "request timed out after 100ms");
    assert_eq!(actor.pending_wakeups().unwrap(), 0);
}

#[tokio::test]
async fn repeated_firing_delivers_once() {
    let server = ok_server().await;
    let harness = Harness::new();
    let system = harness.builder(suppressed()).build().unwrap();
    let actor = system.actor(&recorder("a")).await.unwrap();

    let req_id = actor
        .race_fetch(
            FetchTarget::get(server.uri()).unwrap(),
            record("forced"),
            timeout(60_000),
        )
        .await
        .unwrap();
    assert!(actor.has_pending_wakeup(&req_id).unwrap());

    assert!(actor.fire_wakeup(&req_id).await.unwrap());
    assert!(!actor.fire_wakeup(&req_id).await.unwrap());

    system.idle().await;
    let seen = harness.deliveries();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1.error().map(|e| e.kind), Some(FailureKind::Timeout));
}

#[tokio::test]
async fn late_executor_reply_after_wakeup_is_a_no_op() {
    let stash = Arc::new(Stashing::default());
    let harness = Harness::new();
    let system = harness
        .builder(suppressed())
        .executor("stash", Arc::clone(&stash) as Arc<dyn ExecutionContext>)
        .build()
        .unwrap();
    let actor = system.actor(&recorder("a")).await.unwrap();

    let url = "http://127.0.0.1:9/";
    let req_id = actor
        .race_fetch(
            FetchTarget::get(url).unwrap(),
            record("overtaken"),
            FetchOptions {
                executor_binding: "stash".to_string(),
                ..timeout(60_000)
            },
        )
        .await
        .unwrap();
    assert!(actor.fire_wakeup(&req_id).await.unwrap());

    let task = stash.take();
    assert_eq!(task.req_id, req_id);
    let late = FetchResult::new(
        task.req_id.clone(),
        Ok(ResponseSnapshot::new(200, "OK", url, Vec::new(), Vec::new())),
        0,
        1,
    );
    assert!(!task.reply.deliver(late).await.unwrap());

    system.idle().await;
    let seen = harness.deliveries();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "overtaken");
    assert_eq!(seen[0].1.error().map(|e| e.kind), Some(FailureKind::Timeout));
}

#[tokio::test]
async fn cancelled_race_never_delivers() {
    let server = ok_server().await;
    let harness = Harness::new();
    let system = harness.builder(suppressed()).build().unwrap();
    let actor = system.actor(&recorder("a")).await.unwrap();

    let req_id = actor
        .race_fetch(
            FetchTarget::get(server.uri()).unwrap(),
            record("withdrawn"),
            timeout(60_000),
        )
        .await
        .unwrap();

    assert!(actor.cancel_fetch(&req_id).await.unwrap());
    assert!(!actor.cancel_fetch(&req_id).await.unwrap());
    assert!(!actor.fire_wakeup(&req_id).await.unwrap());

    system.idle().await;
    assert!(harness.deliveries().is_empty());
}

#[tokio::test]
async fn dispatch_failure_cancels_the_wakeup() {
    let harness = Harness::new();
    let system = harness
        .builder(suppressed())
        .executor("refusing", Arc::new(Refusing))
        .build()
        .unwrap();
    let actor = system.actor(&recorder("a")).await.unwrap();

    let err = actor
        .race_fetch(
            FetchTarget::get("http://127.0.0.1:9/").unwrap(),
            record("refused"),
            FetchOptions {
                executor_binding: "refusing".to_string(),
                ..timeout(100)
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SubmitError::Dispatch(DispatchError::Rejected(_))
    ));
    assert_eq!(actor.pending_wakeups().unwrap(), 0);
}

#[tokio::test]
async fn unknown_executor_and_method_are_rejected() {
    let harness = Harness::new();
    let system = harness.system();
    let actor = system.actor(&recorder("a")).await.unwrap();
    let target = FetchTarget::get("http://127.0.0.1:9/").unwrap();

    let no_executor = actor
        .race_fetch(
            target.clone(),
            record("nowhere"),
            FetchOptions {
                executor_binding: "nowhere".to_string(),
                ..FetchOptions::default()
            },
        )
        .await;
    assert!(matches!(no_executor, Err(SubmitError::UnknownExecutor(name)) if name == "nowhere"));

    let no_method = actor
        .race_fetch(
            target,
            Continuation::new("missing").result(),
            FetchOptions::default(),
        )
        .await;
    assert!(matches!(no_method, Err(SubmitError::UnknownMethod { .. })));

    assert_eq!(actor.pending_wakeups().unwrap(), 0);
}
