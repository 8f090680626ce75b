use receipt_server::utils::jwt;

use crate::common::{JWT_SECRET, TestApp, routes};

#[tokio::test]
async fn missing_token_is_rejected() {
    let app = TestApp::spawn().await;

    let res = app.get_without_token(routes::RECEIPTS).await;

    assert_eq!(res.status, 401);
    assert_eq!(res.body["code"], "TOKEN_MISSING");
}

#[tokio::test]
async fn garbage_token_is_rejected() {
    let app = TestApp::spawn().await;

    let res = app.get_with_token(routes::RECEIPTS, "not-a-jwt").await;

    assert_eq!(res.status, 401);
    assert_eq!(res.body["code"], "TOKEN_INVALID");
}

#[tokio::test]
async fn token_signed_with_other_secret_is_rejected() {
    let app = TestApp::spawn().await;
    let token = jwt::sign("alice", "some-other-secret", None, chrono::Duration::hours(1)).unwrap();

    let res = app.get_with_token(routes::RECEIPTS, &token).await;

    assert_eq!(res.status, 401);
    assert_eq!(res.body["code"], "TOKEN_INVALID");
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let app = TestApp::spawn().await;
    let token = jwt::sign("alice", JWT_SECRET, None, chrono::Duration::hours(-2)).unwrap();

    let res = app.get_with_token(routes::RECEIPTS, &token).await;

    assert_eq!(res.status, 401);
    assert_eq!(res.body["code"], "TOKEN_INVALID");
}

#[tokio::test]
async fn upload_requires_a_token() {
    let app = TestApp::spawn().await;

    let part = reqwest::multipart::Part::bytes(crate::common::SAMPLE_PDF.to_vec())
        .file_name("receipt.pdf")
        .mime_str("application/pdf")
        .unwrap();
    let res = app
        .client
        .post(app.url(routes::RECEIPTS))
        .multipart(reqwest::multipart::Form::new().part("file", part))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 401);
    assert_eq!(app.stored_blob_count(), 0);
}

#[tokio::test]
async fn openapi_document_lists_receipt_routes() {
    let app = TestApp::spawn().await;

    let res = app.get_without_token("/api-docs/openapi.json").await;

    assert_eq!(res.status, 200);
    assert!(res.body["paths"]["/api/v1/receipts/{id}"].is_object());
    assert!(res.body["paths"]["/api/v1/files/{token}"].is_object());
    assert!(res.body["components"]["securitySchemes"]["jwt"].is_object());
}
