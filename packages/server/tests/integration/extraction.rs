use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use receipt_server::extraction::InferenceError;
use receipt_server::stuck::{STUCK_MESSAGE, sweep_stuck_receipts};
use receipt_server::utils::jwt::FileClaims;

use crate::common::{FILE_SECRET, StubParser, TestApp, TestOptions, coffee_receipt, routes};

#[tokio::test]
async fn successful_run_processes_receipt() {
    let app = TestApp::spawn().await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;

    let res = app.wait_until_final(&id, &token).await;

    assert_eq!(res.body["status"], "processed", "{}", res.text);
    assert_eq!(res.body["items"].as_array().unwrap().len(), 2);
    assert_eq!(res.body["merchantName"], "Blue Bottle");
    assert_eq!(res.body["merchantAddress"], "1 Ferry Building, San Francisco");
    assert_eq!(res.body["transactionDate"], "2024-03-02");
    assert_eq!(res.body["transactionAmount"], "22.00");
    assert_eq!(res.body["currency"], "USD");
    assert_eq!(res.body["fileDisplayName"], "Blue Bottle – 2024-03-02");
    assert!(res.body["errorMessage"].is_null());
    assert!(res.body["processedAt"].is_string());
}

#[tokio::test]
async fn extraction_url_outlives_client_download_links() {
    let parser = Arc::new(StubParser::succeeding(coffee_receipt()));
    let app = TestApp::spawn_with(TestOptions {
        parser: parser.clone(),
        ..Default::default()
    })
    .await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;
    app.wait_until_final(&id, &token).await;

    let url = parser.urls.lock().unwrap()[0].clone();
    let file_token = url.rsplit('/').next().unwrap();
    let claims = decode::<FileClaims>(
        file_token,
        &DecodingKey::from_secret(FILE_SECRET.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .unwrap()
    .claims;

    // Client links last 300s; a queued run may start any time before the 900s sweep.
    let lifetime = claims.exp as i64 - chrono::Utc::now().timestamp();
    assert!(lifetime > 850, "extraction URL expires in {lifetime}s");
}

#[tokio::test]
async fn coffee_line_item_round_trips() {
    let app = TestApp::spawn().await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;

    let res = app.wait_until_final(&id, &token).await;

    let coffee = &res.body["items"][0];
    assert_eq!(coffee["name"], "Coffee");
    assert_eq!(coffee["quantity"].as_f64().unwrap(), 2.0);
    assert_eq!(coffee["unitPrice"].as_f64().unwrap(), 4.5);
    assert_eq!(coffee["totalPrice"].as_f64().unwrap(), 9.0);
}

#[tokio::test]
async fn completed_run_records_scan_usage() {
    let mut app = TestApp::spawn().await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;
    app.wait_until_final(&id, &token).await;

    let (owner, event) = tokio::time::timeout(Duration::from_secs(2), app.tracked.recv())
        .await
        .expect("usage event should be forwarded")
        .expect("metering channel closed");
    assert_eq!(owner, "alice");
    assert_eq!(event, "scan");
}

#[tokio::test]
async fn summary_is_hidden_without_the_feature() {
    let app = TestApp::spawn_with(TestOptions {
        summary: Ok(false),
        ..Default::default()
    })
    .await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;

    let res = app.wait_until_final(&id, &token).await;

    assert_eq!(res.body["status"], "processed");
    assert!(res.body["receiptSummary"].is_null());
}

#[tokio::test]
async fn summary_is_shown_with_the_feature() {
    let app = TestApp::spawn().await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;

    let res = app.wait_until_final(&id, &token).await;

    let summary = res.body["receiptSummary"].as_str().unwrap();
    assert!(summary.contains("Blue Bottle"));
}

#[tokio::test]
async fn summary_is_hidden_when_entitlements_are_unreachable() {
    let app = TestApp::spawn_with(TestOptions {
        summary: Err(502),
        ..Default::default()
    })
    .await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;

    let res = app.wait_until_final(&id, &token).await;

    assert!(res.body["receiptSummary"].is_null());
}

#[tokio::test]
async fn persistence_failure_never_processes_receipt() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let app = TestApp::spawn_with(TestOptions {
        failing_persist: Some(Arc::clone(&attempts)),
        max_persist_attempts: 3,
        ..Default::default()
    })
    .await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;

    let res = app.wait_until_final(&id, &token).await;

    assert_eq!(res.body["status"], "error");
    assert!(
        res.body["errorMessage"]
            .as_str()
            .unwrap()
            .starts_with("extraction failed")
    );
    assert!(res.body["merchantName"].is_null());
    assert_eq!(res.body["items"].as_array().unwrap().len(), 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rejected_document_fails_without_retry() {
    let parser = Arc::new(StubParser::scripted(vec![Err(InferenceError::Status {
        status: 400,
        body: "document could not be read".into(),
    })]));
    let app = TestApp::spawn_with(TestOptions {
        parser: parser.clone(),
        ..Default::default()
    })
    .await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;

    let res = app.wait_until_final(&id, &token).await;

    assert_eq!(res.body["status"], "error");
    assert!(
        res.body["errorMessage"]
            .as_str()
            .unwrap()
            .starts_with("parse failed")
    );
    assert_eq!(parser.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_parse_failures_are_retried() {
    let parser = Arc::new(StubParser::scripted(vec![
        Err(InferenceError::Status {
            status: 529,
            body: "overloaded".into(),
        }),
        Err(InferenceError::Timeout(Duration::from_secs(60))),
        Ok(coffee_receipt()),
    ]));
    let app = TestApp::spawn_with(TestOptions {
        parser: parser.clone(),
        ..Default::default()
    })
    .await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;

    let res = app.wait_until_final(&id, &token).await;

    assert_eq!(res.body["status"], "processed", "{}", res.text);
    assert_eq!(parser.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn deleting_during_extraction_leaves_nothing_behind() {
    let parser = Arc::new(
        StubParser::succeeding(coffee_receipt()).with_delay(Duration::from_millis(300)),
    );
    let app = TestApp::spawn_with(TestOptions {
        parser: parser.clone(),
        ..Default::default()
    })
    .await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;

    let res = app.delete_with_token(&routes::receipt(&id), &token).await;
    assert_eq!(res.status, 204);

    tokio::time::sleep(Duration::from_millis(600)).await;

    let res = app.get_with_token(&routes::receipt(&id), &token).await;
    assert_eq!(res.status, 404);
    assert_eq!(parser.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stuck_receipts_are_swept_to_error() {
    let app = TestApp::spawn_with(TestOptions {
        parser: Arc::new(
            StubParser::succeeding(coffee_receipt()).with_delay(Duration::from_secs(1)),
        ),
        ..Default::default()
    })
    .await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let marked = sweep_stuck_receipts(&app.db, 0).await.unwrap();
    assert_eq!(marked, 1);

    let res = app.get_with_token(&routes::receipt(&id), &token).await;
    assert_eq!(res.body["status"], "error");
    assert_eq!(res.body["errorMessage"], STUCK_MESSAGE);

    // The late run must not resurrect the receipt.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let res = app.get_with_token(&routes::receipt(&id), &token).await;
    assert_eq!(res.body["status"], "error");
}

#[tokio::test]
async fn recent_pending_receipts_are_not_swept() {
    let app = TestApp::spawn_with(TestOptions {
        parser: Arc::new(
            StubParser::succeeding(coffee_receipt()).with_delay(Duration::from_secs(1)),
        ),
        ..Default::default()
    })
    .await;
    let token = app.token_for("alice");
    app.upload_pdf(&token).await;

    let marked = sweep_stuck_receipts(&app.db, 900).await.unwrap();
    assert_eq!(marked, 0);
}
