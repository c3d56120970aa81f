mod common;

use std::time::Duration;

use beacon_dispatch::{DispatcherConfig, Envelope, Method, Outcome, STATUS_UNREACHABLE};
use common::{dispatcher, dispatcher_with, settle, url, ScriptedServer};
use serde_json::json;

fn idempotency_key(request: &beacon_dispatch::TransportRequest) -> Option<String> {
    request
        .headers
        .iter()
        .find(|(name, _)| name == "Idempotency-Key")
        .map(|(_, value)| value.clone())
}

#[tokio::test(start_paused = true)]
async fn retries_once_then_reports_unreachable() {
    let server = ScriptedServer::new();
    server.respond_with(Method::Get, &url("a"), 200, "", false);
    let dispatcher = dispatcher(&server);

    let start = tokio::time::Instant::now();
    let outcome = dispatcher.submit(Envelope::get(url("a"))).await;

    assert_eq!(outcome, Outcome::Unreachable);
    assert_eq!(outcome.status_code(), Some(STATUS_UNREACHABLE));
    assert!(start.elapsed() >= Duration::from_secs(20));
    assert_eq!(server.request_count(), 2);

    let requests = server.requests();
    assert!(idempotency_key(&requests[0]).is_some());
    assert_eq!(idempotency_key(&requests[0]), idempotency_key(&requests[1]));

    let metrics = dispatcher.metrics();
    assert_eq!(metrics.retries, 1);
    assert_eq!(metrics.attempts_sent, 2);
    assert_eq!(metrics.unreachable, 1);
}

#[tokio::test(start_paused = true)]
async fn lost_request_is_resent_and_succeeds() {
    let server = ScriptedServer::new();
    server.respond_with(Method::Get, &url("region"), 200, r#"{"changed":1}"#, true);
    server.lose_next(1);
    let dispatcher = dispatcher(&server);

    let outcome = dispatcher
        .submit(Envelope::get(url("region")).expect_body(true))
        .await;

    assert_eq!(
        outcome,
        Outcome::Response {
            status: 200,
            body: Some(json!({"changed": 1}))
        }
    );
    assert_eq!(server.request_count(), 2);
    let times = server.arrival_times();
    assert!(times[1] - times[0] >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn network_error_is_retried_immediately() {
    let server = ScriptedServer::new();
    server.respond_with(Method::Post, &url("proximity"), 201, "", true);
    server.fail_next(1);
    let dispatcher = dispatcher(&server);

    let outcome = dispatcher
        .submit(Envelope::post(url("proximity"), json!({"eventType": "found"})))
        .await;

    assert_eq!(outcome.status_code(), Some(201));
    let times = server.arrival_times();
    assert_eq!(times.len(), 2);
    assert_eq!(times[0], times[1]);
}

#[tokio::test(start_paused = true)]
async fn zero_retry_budget_fails_on_first_error() {
    let server = ScriptedServer::new();
    server.fail_next(1);
    let config = DispatcherConfig {
        retry_budget: 0,
        ..common::config()
    };
    let dispatcher = dispatcher_with(&server, config);

    let outcome = dispatcher.submit(Envelope::get(url("a"))).await;

    assert_eq!(outcome, Outcome::Unreachable);
    assert_eq!(server.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn server_errors_are_answers_not_failures() {
    let server = ScriptedServer::new();
    server.respond_with(Method::Get, &url("a"), 500, "oops", true);
    let dispatcher = dispatcher(&server);

    let outcome = dispatcher.submit(Envelope::get(url("a")).expect_body(true)).await;

    // Unparseable body is dropped, status still reported
    assert_eq!(
        outcome,
        Outcome::Response {
            status: 500,
            body: None
        }
    );
    assert_eq!(server.request_count(), 1);
    assert_eq!(dispatcher.metrics().retries, 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_completion_still_delivers() {
    let server = ScriptedServer::new();
    server.respond_with(Method::Get, &url("a"), 200, "", false);
    let dispatcher = dispatcher(&server);

    drop(dispatcher.submit(Envelope::get(url("a"))));
    server.wait_for_requests(1).await;
    server.respond();
    settle().await;

    assert_eq!(dispatcher.metrics().envelopes_completed, 1);
}
