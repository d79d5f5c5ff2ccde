mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::*;
use relay_worker::poller::{PollOutcome, PollerSettings};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// An address nothing listens on.
const DEAD_BROKER: &str = "http://127.0.0.1:9";

fn produce(dir: &std::path::Path) -> std::sync::Arc<FakeBackend> {
    FakeBackend::new(Behavior::Produce {
        path: dir.join("out.jpg"),
        bytes: b"processed".to_vec(),
    })
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_registers_with_reachable_brokers_only() {
    let up = MockServer::start().await;
    mount_healthy(&up).await;
    let dir = tempfile::tempdir().unwrap();

    let mut poller = poller(
        &[up.uri(), DEAD_BROKER.to_string()],
        dir.path(),
        produce(dir.path()),
    );
    assert!(poller.connect().await);

    assert_eq!(poller.pool().available(), vec![0]);
    assert!(poller.pool().entries()[1].last_error.is_some());
    let registrations = requests_to(&up, "POST", "/api/v1/register").await;
    assert_eq!(registrations.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&registrations[0].body).unwrap();
    assert_eq!(body["worker_id"], WORKER_ID);
    assert_eq!(body["local_port"], 7777);
}

#[tokio::test]
async fn connect_fails_when_backend_is_down() {
    let up = MockServer::start().await;
    mount_healthy(&up).await;
    let dir = tempfile::tempdir().unwrap();

    let backend = FakeBackend::new(Behavior::Fail("unused".into()));
    backend.set_reachable(false);
    let mut poller = poller(&[up.uri()], dir.path(), backend);

    assert!(!poller.connect().await);
    assert!(requests_to(&up, "POST", "/api/v1/register").await.is_empty());
    // Reachable brokers are not polled while there is nothing to process with.
    assert_eq!(poller.pool().available_count(), 0);
    assert_matches!(poller.poll_once().await, PollOutcome::NoBrokers);
    assert!(requests_to(&up, "GET", "/api/v1/jobs/next").await.is_empty());
}

#[tokio::test]
async fn backend_outage_takes_brokers_out_until_reconnect() {
    let up = MockServer::start().await;
    mount_healthy(&up).await;
    mount_no_jobs(&up).await;
    let dir = tempfile::tempdir().unwrap();
    let backend = produce(dir.path());

    let mut poller = poller(&[up.uri()], dir.path(), backend.clone());
    assert!(poller.connect().await);
    assert_eq!(poller.pool().available_count(), 1);

    backend.set_reachable(false);
    assert!(!poller.connect().await);
    assert_matches!(poller.poll_once().await, PollOutcome::NoBrokers);

    backend.set_reachable(true);
    assert!(poller.connect().await);
    assert_matches!(poller.poll_once().await, PollOutcome::Empty);
}

#[tokio::test]
async fn startup_gives_up_after_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let mut poller = poller(&[DEAD_BROKER.to_string()], dir.path(), produce(dir.path()));

    let err = poller.startup(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.attempts, 2);
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_broker_yields_empty_round() {
    let server = MockServer::start().await;
    mount_healthy(&server).await;
    mount_no_jobs(&server).await;
    let dir = tempfile::tempdir().unwrap();

    let mut poller = poller(&[server.uri()], dir.path(), produce(dir.path()));
    assert!(poller.connect().await);

    assert_matches!(poller.poll_once().await, PollOutcome::Empty);
    let polls = requests_to(&server, "GET", "/api/v1/jobs/next").await;
    assert_eq!(polls[0].url.query(), Some("worker=worker-test"));
}

#[tokio::test]
async fn busy_brokers_are_served_alternately() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    for server in [&a, &b] {
        mount_healthy(server).await;
        mount_next(server, &job_json(Uuid::now_v7(), "/in.jpg", "/cfg.lua", false)).await;
    }

    let mut poller = poller(&[a.uri(), b.uri()], dir.path(), produce(dir.path()));
    assert!(poller.connect().await);

    let mut served = Vec::new();
    for _ in 0..4 {
        match poller.poll_once().await {
            PollOutcome::Claimed { broker, .. } => served.push(broker),
            other => panic!("expected a job, got {other:?}"),
        }
    }
    assert_eq!(served, vec![0, 1, 0, 1]);
    assert_eq!(poller.pool().entries()[0].jobs_claimed, 2);
    assert_eq!(poller.pool().entries()[1].jobs_claimed, 2);
}

#[tokio::test]
async fn idle_broker_is_skipped_for_the_busy_one() {
    let idle = MockServer::start().await;
    let busy = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_healthy(&idle).await;
    mount_no_jobs(&idle).await;
    mount_healthy(&busy).await;
    mount_next(&busy, &job_json(Uuid::now_v7(), "/in.jpg", "/cfg.lua", false)).await;

    let mut poller = poller(&[idle.uri(), busy.uri()], dir.path(), produce(dir.path()));
    assert!(poller.connect().await);

    assert_matches!(poller.poll_once().await, PollOutcome::Claimed { broker: 1, .. });
    // The cursor moved past the busy broker, so the idle one is asked first.
    assert_matches!(poller.poll_once().await, PollOutcome::Claimed { broker: 1, .. });
    assert_eq!(requests_to(&idle, "GET", "/api/v1/jobs/next").await.len(), 2);
}

#[tokio::test]
async fn broker_after_the_server_is_next_when_an_earlier_one_fails() {
    let failing = MockServer::start().await;
    let b = MockServer::start().await;
    let c = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    mount_healthy(&failing).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/jobs/next"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&failing)
        .await;
    for server in [&b, &c] {
        mount_healthy(server).await;
        mount_next(server, &job_json(Uuid::now_v7(), "/in.jpg", "/cfg.lua", false)).await;
    }

    let mut poller = poller(&[failing.uri(), b.uri(), c.uri()], dir.path(), produce(dir.path()));
    assert!(poller.connect().await);

    assert_matches!(poller.poll_once().await, PollOutcome::Claimed { broker: 1, .. });
    assert_matches!(poller.poll_once().await, PollOutcome::Claimed { broker: 2, .. });
    assert_matches!(poller.poll_once().await, PollOutcome::Claimed { broker: 1, .. });
}

#[tokio::test]
async fn failing_poll_marks_broker_unavailable() {
    let server = MockServer::start().await;
    mount_healthy(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/jobs/next"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();

    let mut poller = poller(&[server.uri()], dir.path(), produce(dir.path()));
    assert!(poller.connect().await);

    assert_matches!(poller.poll_once().await, PollOutcome::Empty);
    assert_eq!(poller.pool().available_count(), 0);
    assert_matches!(poller.poll_once().await, PollOutcome::NoBrokers);
}

#[tokio::test]
async fn recovered_broker_is_reregistered() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let other = MockServer::start().await;
    mount_healthy(&other).await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut poller = poller(&[server.uri(), other.uri()], dir.path(), produce(dir.path()));
    assert!(poller.connect().await);
    assert_eq!(poller.pool().available(), vec![1]);

    server.reset().await;
    mount_healthy(&server).await;

    poller.health_check().await;
    assert_eq!(poller.pool().available(), vec![0, 1]);
    assert_eq!(requests_to(&server, "POST", "/api/v1/register").await.len(), 1);
    // Already-available brokers are not registered twice.
    assert_eq!(requests_to(&other, "POST", "/api/v1/register").await.len(), 1);
}

#[tokio::test]
async fn recovered_broker_waits_for_the_backend() {
    let server = MockServer::start().await;
    mount_healthy(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let backend = produce(dir.path());
    backend.set_reachable(false);

    let mut poller = poller(&[server.uri()], dir.path(), backend.clone());
    assert!(!poller.connect().await);

    poller.health_check().await;
    assert_eq!(poller.pool().available_count(), 0);
    assert!(requests_to(&server, "POST", "/api/v1/register").await.is_empty());

    backend.set_reachable(true);
    poller.health_check().await;
    assert_eq!(poller.pool().available(), vec![0]);
    assert_eq!(requests_to(&server, "POST", "/api/v1/register").await.len(), 1);
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_processes_jobs_until_cancelled() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let input = write_file(dir.path(), "photo.jpg", b"raw");
    let config = write_file(dir.path(), "preset.lua", b"s = {}");
    let job = job_json(Uuid::now_v7(), &input, &config, false);

    mount_healthy(&server).await;
    mount_lifecycle(&server, &job).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/jobs/next"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": job })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_no_jobs(&server).await;

    let poller = poller(&[server.uri()], dir.path(), produce(dir.path()));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(poller.run(cancel.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while reports(&server).await.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();

    let stats = handle.await.unwrap().unwrap();
    assert_eq!(stats.jobs_claimed, 1);
    assert_eq!(stats.jobs_succeeded, 1);
    assert_eq!(stats.uploads, 1);
    assert_eq!(reports(&server).await.len(), 1);
}

#[tokio::test]
async fn run_reregisters_after_too_many_poll_failures() {
    let server = MockServer::start().await;
    mount_healthy(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/jobs/next"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_no_jobs(&server).await;
    let dir = tempfile::tempdir().unwrap();

    let settings = PollerSettings {
        max_consecutive_failures: 1,
        ..poller_settings()
    };
    let poller = poller_with(settings, &[server.uri()], dir.path(), produce(dir.path()));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(poller.run(cancel.clone()));

    // Polling resumes against the re-registered broker.
    let server = &server;
    let resumed = eventually(move || async move {
        requests_to(&server, "GET", "/api/v1/jobs/next").await.len() >= 3
    })
    .await;
    cancel.cancel();
    assert!(resumed);

    let stats = handle.await.unwrap().unwrap();
    assert!(stats.reconnects >= 1);
    assert!(requests_to(&server, "POST", "/api/v1/register").await.len() >= 2);
}

#[tokio::test]
async fn run_reconnects_when_every_broker_dropped_out() {
    let server = MockServer::start().await;
    mount_healthy(&server).await;
    // A non-transient error drops the only broker without counting as a
    // connection failure, leaving the rotation empty.
    Mock::given(method("GET"))
        .and(path("/api/v1/jobs/next"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_no_jobs(&server).await;
    let dir = tempfile::tempdir().unwrap();

    let poller = poller(&[server.uri()], dir.path(), produce(dir.path()));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(poller.run(cancel.clone()));

    let server = &server;
    let reregistered = eventually(move || async move {
        requests_to(&server, "POST", "/api/v1/register").await.len() >= 2
            && requests_to(&server, "GET", "/api/v1/jobs/next").await.len() >= 2
    })
    .await;
    cancel.cancel();
    assert!(reregistered);

    let stats = handle.await.unwrap().unwrap();
    assert!(stats.reconnects >= 1);
    assert_eq!(stats.jobs_claimed, 0);
}

#[tokio::test]
async fn run_stops_during_startup_when_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let mut poller = poller(&[DEAD_BROKER.to_string()], dir.path(), produce(dir.path()));

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(!poller.startup(&cancel).await.unwrap());
}
