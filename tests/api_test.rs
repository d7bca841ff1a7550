use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use bigdecimal::BigDecimal;
use futures::StreamExt;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use transfer_core::adapters::InMemoryLedger;
use transfer_core::{create_app, AppState};

const ADMIN_KEY: &str = "test-admin-key-0123456789";

fn setup_test_state() -> (Router, Arc<InMemoryLedger>, AppState) {
    let ledger = Arc::new(InMemoryLedger::new());
    let state = AppState::new(ledger.clone(), ledger.clone(), chrono::Duration::days(7), ADMIN_KEY);
    (create_app(state.clone()), ledger, state)
}

fn setup_test_app() -> (Router, Arc<InMemoryLedger>) {
    let (app, ledger, _) = setup_test_state();
    (app, ledger)
}

fn build_request(
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, Value) {
    let request = build_request(method, uri, token, body, headers);
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, json)
}

fn money(value: &Value) -> BigDecimal {
    BigDecimal::from_str(value.as_str().unwrap()).unwrap()
}

struct TestUser {
    token: String,
    checking: String,
}

async fn register(app: &Router, email: &str, name: &str) -> TestUser {
    let (status, _, body) = call(
        app,
        "POST",
        "/users",
        None,
        Some(json!({ "email": email, "display_name": name })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    let checking = body["accounts"]
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["account_type"] == "checking")
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();
    TestUser {
        token: body["api_token"].as_str().unwrap().to_string(),
        checking,
    }
}

async fn fund(app: &Router, account_id: &str, amount: &str) {
    let (status, _, body) = call(
        app,
        "POST",
        &format!("/admin/accounts/{}/deposit", account_id),
        Some(ADMIN_KEY),
        Some(json!({ "amount": amount })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

async fn balance(app: &Router, user: &TestUser) -> BigDecimal {
    let (status, _, body) = call(app, "GET", "/accounts", Some(&user.token), None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let account = body
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["id"] == user.checking.as_str())
        .unwrap()
        .clone();
    money(&account["balance"])
}

#[tokio::test]
async fn test_health_without_database() {
    let (app, _) = setup_test_app();
    let (status, _, body) = call(&app, "GET", "/health", None, None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_duplicate_registration_conflicts() {
    let (app, _) = setup_test_app();
    register(&app, "alice@example.com", "Alice").await;

    let (status, _, _) = call(
        &app,
        "POST",
        "/users",
        None,
        Some(json!({ "email": "ALICE@example.com", "display_name": "Other" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_requests_without_token_are_rejected() {
    let (app, _) = setup_test_app();

    let (status, _, _) = call(&app, "GET", "/accounts", None, None, &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = call(&app, "GET", "/accounts", Some("not-a-token"), None, &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_deposit_requires_admin_key() {
    let (app, _) = setup_test_app();
    let alice = register(&app, "alice@example.com", "Alice").await;

    let (status, _, _) = call(
        &app,
        "POST",
        &format!("/admin/accounts/{}/deposit", alice.checking),
        Some(&alice.token),
        Some(json!({ "amount": "100.00" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    fund(&app, &alice.checking, "100.00").await;
    assert_eq!(balance(&app, &alice).await, BigDecimal::from(100));
}

#[tokio::test]
async fn test_internal_transfer_moves_funds() {
    let (app, ledger) = setup_test_app();
    let alice = register(&app, "alice@example.com", "Alice").await;
    let bob = register(&app, "bob@example.com", "Bob").await;
    fund(&app, &alice.checking, "100.00").await;

    let (status, _, body) = call(
        &app,
        "POST",
        "/transfers",
        Some(&alice.token),
        Some(json!({ "recipient_email": "bob@example.com", "amount": "30.00", "description": "Lunch" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["method"], "internal");
    assert!(body.get("claim_token").is_none());
    assert!(body.get("claim_token_hash").is_none());

    assert_eq!(balance(&app, &alice).await, BigDecimal::from(70));
    assert_eq!(balance(&app, &bob).await, BigDecimal::from(30));

    let events = ledger.outbox_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "transfer.created");
}

#[tokio::test]
async fn test_insufficient_funds_changes_nothing() {
    let (app, ledger) = setup_test_app();
    let alice = register(&app, "alice@example.com", "Alice").await;
    register(&app, "bob@example.com", "Bob").await;
    fund(&app, &alice.checking, "10.00").await;

    let (status, _, body) = call(
        &app,
        "POST",
        "/transfers",
        Some(&alice.token),
        Some(json!({ "recipient_email": "bob@example.com", "amount": "10.01" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["status"], 402);

    assert_eq!(balance(&app, &alice).await, BigDecimal::from(10));
    assert!(ledger.transfers().await.is_empty());
    assert!(ledger.outbox_events().await.is_empty());
}

#[tokio::test]
async fn test_invalid_amounts_are_rejected() {
    let (app, _) = setup_test_app();
    let alice = register(&app, "alice@example.com", "Alice").await;
    register(&app, "bob@example.com", "Bob").await;
    fund(&app, &alice.checking, "10.00").await;

    for amount in [json!("0"), json!("-5"), json!("1.234"), json!("1e3"), json!("abc")] {
        let (status, _, _) = call(
            &app,
            "POST",
            "/transfers",
            Some(&alice.token),
            Some(json!({ "recipient_email": "bob@example.com", "amount": amount })),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "amount {amount}");
    }
}

#[tokio::test]
async fn test_idempotent_transfer_is_replayed() {
    let (app, ledger) = setup_test_app();
    let alice = register(&app, "alice@example.com", "Alice").await;
    register(&app, "bob@example.com", "Bob").await;
    fund(&app, &alice.checking, "100.00").await;

    let payload = json!({ "recipient_email": "bob@example.com", "amount": "25.00" });
    let key = [("idempotency-key", "transfer-001")];

    let (first_status, first_headers, first) =
        call(&app, "POST", "/transfers", Some(&alice.token), Some(payload.clone()), &key).await;
    assert_eq!(first_status, StatusCode::CREATED);
    assert!(first_headers.get("idempotent-replayed").is_none());

    let (second_status, second_headers, second) =
        call(&app, "POST", "/transfers", Some(&alice.token), Some(payload), &key).await;
    assert_eq!(second_status, StatusCode::CREATED);
    assert_eq!(second_headers.get("idempotent-replayed").unwrap(), "true");
    assert_eq!(first, second);

    assert_eq!(ledger.transfers().await.len(), 1);
    assert_eq!(balance(&app, &alice).await, BigDecimal::from(75));

    let (status, _, _) = call(
        &app,
        "POST",
        "/transfers",
        Some(&alice.token),
        Some(json!({ "recipient_email": "bob@example.com", "amount": "26.00" })),
        &key,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_failed_request_releases_idempotency_key() {
    let (app, _) = setup_test_app();
    let alice = register(&app, "alice@example.com", "Alice").await;
    register(&app, "bob@example.com", "Bob").await;

    let payload = json!({ "recipient_email": "bob@example.com", "amount": "5.00" });
    let key = [("idempotency-key", "retry-me")];

    let (status, _, _) = call(&app, "POST", "/transfers", Some(&alice.token), Some(payload.clone()), &key).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    fund(&app, &alice.checking, "5.00").await;

    let (status, headers, _) = call(&app, "POST", "/transfers", Some(&alice.token), Some(payload), &key).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(headers.get("idempotent-replayed").is_none());
}

#[tokio::test]
async fn test_claim_flow_for_unregistered_recipient() {
    let (app, _) = setup_test_app();
    let alice = register(&app, "alice@example.com", "Alice").await;
    fund(&app, &alice.checking, "50.00").await;

    let (status, _, receipt) = call(
        &app,
        "POST",
        "/transfers",
        Some(&alice.token),
        Some(json!({ "recipient_email": "carol@example.com", "amount": "20.00" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{receipt}");
    assert_eq!(receipt["status"], "pending");
    assert_eq!(receipt["method"], "email");
    let claim_token = receipt["claim_token"].as_str().unwrap().to_string();
    assert_eq!(balance(&app, &alice).await, BigDecimal::from(30));

    let carol = register(&app, "carol@example.com", "Carol").await;
    let claim = json!({ "claim_token": claim_token, "account_id": carol.checking });

    let (status, _, claimed) = call(&app, "POST", "/transfers/claim", Some(&carol.token), Some(claim.clone()), &[]).await;
    assert_eq!(status, StatusCode::OK, "{claimed}");
    assert_eq!(claimed["status"], "completed");
    assert_eq!(balance(&app, &carol).await, BigDecimal::from(20));

    let (status, _, _) = call(&app, "POST", "/transfers/claim", Some(&carol.token), Some(claim), &[]).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(balance(&app, &carol).await, BigDecimal::from(20));
}

#[tokio::test]
async fn test_unknown_claim_token_is_not_found() {
    let (app, _) = setup_test_app();
    let carol = register(&app, "carol@example.com", "Carol").await;

    let (status, _, _) = call(
        &app,
        "POST",
        "/transfers/claim",
        Some(&carol.token),
        Some(json!({ "claim_token": "no-such-token", "account_id": carol.checking })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_history_carries_running_balance() {
    let (app, _) = setup_test_app();
    let alice = register(&app, "alice@example.com", "Alice").await;
    register(&app, "bob@example.com", "Bob").await;
    fund(&app, &alice.checking, "100.00").await;

    let (status, _, _) = call(
        &app,
        "POST",
        "/transfers",
        Some(&alice.token),
        Some(json!({ "recipient_email": "bob@example.com", "amount": "40.00" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _, body) = call(
        &app,
        "GET",
        &format!("/transactions?account_id={}", alice.checking),
        Some(&alice.token),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entries = body.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["direction"], "debit");
    assert_eq!(money(&entries[0]["balance_after"]), BigDecimal::from(60));
    assert_eq!(money(&entries[1]["balance_after"]), BigDecimal::from(100));
}

#[tokio::test]
async fn test_history_of_foreign_account_is_forbidden() {
    let (app, _) = setup_test_app();
    let alice = register(&app, "alice@example.com", "Alice").await;
    let bob = register(&app, "bob@example.com", "Bob").await;

    let (status, _, _) = call(
        &app,
        "GET",
        &format!("/transactions?account_id={}", alice.checking),
        Some(&bob.token),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_list_transfers_shows_both_parties() {
    let (app, _) = setup_test_app();
    let alice = register(&app, "alice@example.com", "Alice").await;
    let bob = register(&app, "bob@example.com", "Bob").await;
    fund(&app, &alice.checking, "10.00").await;

    let (status, _, _) = call(
        &app,
        "POST",
        "/transfers",
        Some(&alice.token),
        Some(json!({ "recipient_account_id": bob.checking, "amount": 4 })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    for user in [&alice, &bob] {
        let (status, _, body) = call(&app, "GET", "/transfers", Some(&user.token), None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_idempotent_request_settles_after_client_disconnects() {
    let (app, ledger) = setup_test_app();
    let alice = register(&app, "alice@example.com", "Alice").await;
    register(&app, "bob@example.com", "Bob").await;
    fund(&app, &alice.checking, "100.00").await;

    let payload = json!({ "recipient_email": "bob@example.com", "amount": "25.00" });
    let key = [("idempotency-key", "dropped-mid-commit")];

    // Hang up while the commit is still in flight.
    ledger.set_commit_delay(Some(Duration::from_millis(300))).await;
    let request = build_request("POST", "/transfers", Some(&alice.token), Some(payload.clone()), &key);
    let in_flight = tokio::spawn(app.clone().oneshot(request));
    tokio::time::sleep(Duration::from_millis(100)).await;
    in_flight.abort();
    assert!(in_flight.await.unwrap_err().is_cancelled());
    ledger.set_commit_delay(None).await;

    tokio::time::sleep(Duration::from_millis(400)).await;

    let (status, headers, body) = call(&app, "POST", "/transfers", Some(&alice.token), Some(payload), &key).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(headers.get("idempotent-replayed").unwrap(), "true");
    assert_eq!(body["status"], "completed");

    assert_eq!(ledger.transfers().await.len(), 1);
    assert_eq!(balance(&app, &alice).await, BigDecimal::from(75));
}

#[tokio::test]
async fn test_replayed_pending_transfer_returns_same_claim_token() {
    let (app, ledger) = setup_test_app();
    let alice = register(&app, "alice@example.com", "Alice").await;
    fund(&app, &alice.checking, "50.00").await;

    let payload = json!({ "recipient_email": "carol@example.com", "amount": "20.00" });
    let key = [("idempotency-key", "pending-claim")];

    let (status, _, first) = call(&app, "POST", "/transfers", Some(&alice.token), Some(payload.clone()), &key).await;
    assert_eq!(status, StatusCode::CREATED);
    let claim_token = first["claim_token"].as_str().unwrap().to_string();

    let (status, headers, second) = call(&app, "POST", "/transfers", Some(&alice.token), Some(payload), &key).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(headers.get("idempotent-replayed").unwrap(), "true");
    assert_eq!(second["claim_token"], claim_token.as_str());
    assert_eq!(ledger.transfers().await.len(), 1);

    let carol = register(&app, "carol@example.com", "Carol").await;
    let claim = json!({ "claim_token": claim_token, "account_id": carol.checking });
    let (status, _, claimed) = call(&app, "POST", "/transfers/claim", Some(&carol.token), Some(claim), &[]).await;
    assert_eq!(status, StatusCode::OK, "{claimed}");
    assert_eq!(balance(&app, &carol).await, BigDecimal::from(20));
}

#[tokio::test]
async fn test_event_stream_delivers_transfer_created() {
    let (app, _, state) = setup_test_state();
    let alice = register(&app, "alice@example.com", "Alice").await;
    let bob = register(&app, "bob@example.com", "Bob").await;
    fund(&app, &alice.checking, "40.00").await;

    // EventSource cannot set headers, so the token rides in the query.
    let request = build_request("GET", &format!("/events?token={}", bob.token), None, None, &[]);
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(state.connections.connection_count(), 1);

    let (status, _, _) = call(
        &app,
        "POST",
        "/transfers",
        Some(&alice.token),
        Some(json!({ "recipient_email": "bob@example.com", "amount": "12.50" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let mut body = response.into_body().into_data_stream();
    let mut frame = String::new();
    while !frame.contains("\n\n") {
        let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .expect("no event within 2s")
            .expect("stream ended")
            .unwrap();
        frame.push_str(std::str::from_utf8(&chunk).unwrap());
    }

    let event_name = frame.lines().find_map(|line| line.strip_prefix("event: ")).unwrap();
    assert_eq!(event_name, "transfer.created");
    let data: Value = serde_json::from_str(frame.lines().find_map(|line| line.strip_prefix("data: ")).unwrap()).unwrap();
    assert_eq!(money(&data["amount"]), BigDecimal::from_str("12.50").unwrap());
    assert_eq!(data["status"], "completed");
    assert_eq!(data["method"], "internal");

    drop(body);
    assert_eq!(state.connections.connection_count(), 0);
}

#[tokio::test]
async fn test_event_stream_rejects_bad_token() {
    let (app, _, state) = setup_test_state();
    let (status, _, _) = call(&app, "GET", "/events?token=not-a-token", None, None, &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(state.connections.connection_count(), 0);
}
