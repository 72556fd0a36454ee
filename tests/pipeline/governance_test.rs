//! Governance pipeline behavior: chain ordering, failure semantics, and
//! the no-leak and budget-safety invariants.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use armitage::error::ErrorKind;
use armitage::inference::{BackendRequest, ChatBackend, InferenceError};
use armitage::ledger::{BudgetKey, SpendCounter};
use armitage::pipeline::ChatRequest;

use super::support::{
    build, harness, ok_body, principal, user_message, PRICE_MICROS_PER_1K,
};

fn request(messages: Vec<armitage::inference::ChatMessage>) -> ChatRequest {
    ChatRequest {
        project_id: "proj-a".to_owned(),
        model: "openai/gpt-test".to_owned(),
        messages,
        estimated_cost_hint_micros: None,
        seed: None,
    }
}

#[tokio::test]
async fn budget_block_stops_before_secret_and_inference() {
    let mut h = harness(50_000_000, vec![Ok(ok_body("unused"))]).await;
    let caller = principal(&["proj-a"]);
    // Today's spend sits one cent short of the $50 limit.
    h.counter
        .seed(BudgetKey::today(caller.user_id), 49_999_999)
        .await;

    let err = h
        .pipeline
        .chat(&caller, request(user_message("estimate me")))
        .await
        .expect_err("reservation must be refused");

    assert_eq!(err.kind, ErrorKind::BudgetExceeded);
    assert_eq!(err.detail, "Budget exceeded");
    assert_eq!(h.store.fetches.load(Ordering::SeqCst), 0, "no secret lookup");
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0, "no inference call");
    assert!(h.telemetry_rx.try_recv().is_err(), "no telemetry enqueued");
    assert_eq!(
        h.ledger.spent_today(caller.user_id).await.expect("spend"),
        49_999_999,
        "spend unchanged"
    );
}

#[tokio::test]
async fn happy_path_serves_verbatim_and_stores_scrubbed() {
    let mut h = harness(50_000_000, vec![Ok(ok_body("Ok, contacting John Doe."))]).await;
    let caller = principal(&["proj-a"]);

    let body = h
        .pipeline
        .chat(&caller, request(user_message("Call John Doe at 555-0199.")))
        .await
        .expect("happy path");

    // The caller sees the upstream body verbatim, PII included.
    assert_eq!(
        body.pointer("/choices/0/message/content").and_then(Value::as_str),
        Some("Ok, contacting John Doe.")
    );

    // The stored record carries only scrubbed content.
    let record = h.telemetry_rx.try_recv().expect("one record");
    assert_eq!(record.outcome, "ok");
    let stored_request = record.request_payload.expect("request payload");
    assert_eq!(
        stored_request[0]["content"],
        "Call <REDACTED PERSON> at <REDACTED PHONE_NUMBER>."
    );
    assert_eq!(
        record.response_payload.expect("response payload"),
        Value::String("Ok, contacting <REDACTED PERSON>.".to_owned())
    );

    // 150 tokens at the flat price: the commit recorded the actual cost.
    assert_eq!(record.cost_micros, 1_500);
    assert_eq!(
        h.ledger.spent_today(caller.user_id).await.expect("spend"),
        1_500
    );
    assert!(h.telemetry_rx.try_recv().is_err(), "exactly one record");
}

#[tokio::test]
async fn forbidden_project_fails_before_everything() {
    let mut h = harness(50_000_000, vec![Ok(ok_body("unused"))]).await;
    let caller = principal(&["some-other-project"]);

    let err = h
        .pipeline
        .chat(&caller, request(user_message("hi")))
        .await
        .expect_err("forbidden");

    assert_eq!(err.kind, ErrorKind::Forbidden);
    assert_eq!(h.store.fetches.load(Ordering::SeqCst), 0);
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    assert!(h.telemetry_rx.try_recv().is_err());
    assert_eq!(h.ledger.spent_today(caller.user_id).await.expect("spend"), 0);
}

#[tokio::test]
async fn missing_secret_refunds_and_marks_configuration_error() {
    let mut h = harness(50_000_000, vec![Ok(ok_body("unused"))]).await;
    let caller = principal(&["proj-a"]);

    let mut req = request(user_message("hi"));
    req.model = "anthropic/claude-test".to_owned(); // no secret seeded for anthropic

    let err = h.pipeline.chat(&caller, req).await.expect_err("no secret");
    assert_eq!(err.kind, ErrorKind::ConfigurationError);
    assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);

    let record = h.telemetry_rx.try_recv().expect("failure marker");
    assert_eq!(record.outcome, "configuration_error");
    assert!(record.request_payload.is_none(), "markers carry no payload");

    assert_eq!(
        h.ledger.spent_today(caller.user_id).await.expect("spend"),
        0,
        "reservation refunded"
    );
}

#[tokio::test]
async fn upstream_5xx_refunds_and_maps_unavailable() {
    let mut h = harness(
        50_000_000,
        vec![Err(InferenceError::UpstreamStatus {
            status: 502,
            body: String::new(),
        })],
    )
    .await;
    let caller = principal(&["proj-a"]);

    let err = h
        .pipeline
        .chat(&caller, request(user_message("hi")))
        .await
        .expect_err("upstream down");
    assert_eq!(err.kind, ErrorKind::Unavailable);

    let record = h.telemetry_rx.try_recv().expect("failure marker");
    assert_eq!(record.outcome, "unavailable");
    assert_eq!(
        h.ledger.spent_today(caller.user_id).await.expect("spend"),
        0
    );
}

#[tokio::test]
async fn upstream_4xx_maps_to_upstream_category() {
    let mut h = harness(
        50_000_000,
        vec![Err(InferenceError::UpstreamStatus {
            status: 400,
            body: String::new(),
        })],
    )
    .await;
    let caller = principal(&["proj-a"]);

    let err = h
        .pipeline
        .chat(&caller, request(user_message("hi")))
        .await
        .expect_err("bad request upstream");
    assert_eq!(err.kind, ErrorKind::Upstream);
    assert_eq!(h.telemetry_rx.try_recv().expect("marker").outcome, "upstream");
}

#[tokio::test]
async fn client_hint_may_only_raise_the_reservation() {
    // Limit fits the floor estimate but not the hint: the hint must win.
    let h = harness(40_000, vec![Ok(ok_body("unused"))]).await;
    let caller = principal(&["proj-a"]);

    let mut req = request(user_message("hi"));
    req.estimated_cost_hint_micros = Some(50_000);
    let err = h.pipeline.chat(&caller, req).await.expect_err("hint raised");
    assert_eq!(err.kind, ErrorKind::BudgetExceeded);

    // A lowball hint is ignored: the floor estimate still reserves fine
    // and the call goes through.
    let mut req = request(user_message("hi"));
    req.estimated_cost_hint_micros = Some(1);
    h.pipeline.chat(&caller, req).await.expect("floor estimate wins");
}

#[tokio::test]
async fn telemetry_exactly_once_per_served_response() {
    let script = vec![
        Ok(ok_body("one")),
        Ok(ok_body("two")),
        Ok(ok_body("three")),
    ];
    let mut h = harness(50_000_000, script).await;
    let caller = principal(&["proj-a"]);

    for _ in 0..3 {
        h.pipeline
            .chat(&caller, request(user_message("go")))
            .await
            .expect("served");
    }

    let mut ok_records = 0;
    while let Ok(record) = h.telemetry_rx.try_recv() {
        assert_eq!(record.outcome, "ok");
        ok_records += 1;
    }
    assert_eq!(ok_records, 3);
}

struct PanickingBackend;

#[async_trait]
impl ChatBackend for PanickingBackend {
    async fn complete(&self, _request: BackendRequest<'_>) -> Result<Value, InferenceError> {
        panic!("injected crash between reserve and commit");
    }
}

#[tokio::test]
async fn crash_between_reserve_and_commit_is_refunded() {
    let (pipeline, counter, ledger, _store, _rx) =
        build(50_000_000, Arc::new(PanickingBackend)).await;
    let caller = principal(&["proj-a"]);

    let err = pipeline
        .chat(&caller, request(user_message("boom")))
        .await
        .expect_err("handler crashed");
    assert_eq!(err.kind, ErrorKind::Internal);

    // The dropped guard schedules the refund; give it a few polls to land.
    for _ in 0..100 {
        tokio::task::yield_now().await;
        if counter
            .current(&BudgetKey::today(caller.user_id))
            .await
            .expect("counter")
            == 0
        {
            break;
        }
    }
    assert_eq!(
        ledger.spent_today(caller.user_id).await.expect("spend"),
        0,
        "reserved amount reclaimed after the crash"
    );

    // The budget is usable again immediately.
    assert!(ledger.reserve(caller.user_id, 1_000_000).await.is_ok());
}

#[tokio::test]
async fn actual_cost_commit_tracks_usage_not_estimate() {
    // A large prompt reserves far more than the actual cost; the ledger
    // must end at the actual.
    let mut h = harness(50_000_000, vec![Ok(ok_body("short"))]).await;
    let caller = principal(&["proj-a"]);

    let big_prompt = "x".repeat(20_000);
    h.pipeline
        .chat(&caller, request(user_message(&big_prompt)))
        .await
        .expect("served");

    let record = h.telemetry_rx.try_recv().expect("record");
    assert_eq!(record.cost_micros, 150 * PRICE_MICROS_PER_1K / 1000);
    assert_eq!(
        h.ledger.spent_today(caller.user_id).await.expect("spend"),
        record.cost_micros
    );
}
