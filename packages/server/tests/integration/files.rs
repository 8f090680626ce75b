use crate::common::{SAMPLE_PDF, TestApp, routes};

async fn download_url_for(app: &TestApp, id: &str, token: &str) -> String {
    let res = app.get_with_token(&routes::download_url(id), token).await;
    assert_eq!(res.status, 200, "{}", res.text);
    assert!(res.body["expiresAt"].is_string());
    res.body["url"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn download_url_serves_the_uploaded_pdf() {
    let app = TestApp::spawn().await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;

    let url = download_url_for(&app, &id, &token).await;
    assert!(url.starts_with(&app.url("/api/v1/files/")));

    let res = app.client.get(&url).send().await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(
        res.headers()["content-type"].to_str().unwrap(),
        "application/pdf"
    );
    assert!(
        res.headers()["content-disposition"]
            .to_str()
            .unwrap()
            .contains("receipt.pdf")
    );
    assert!(res.headers().contains_key("etag"));
    let bytes = res.bytes().await.unwrap();
    assert_eq!(bytes.as_ref(), SAMPLE_PDF);
}

#[tokio::test]
async fn matching_etag_returns_not_modified() {
    let app = TestApp::spawn().await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;
    let url = download_url_for(&app, &id, &token).await;

    let first = app.client.get(&url).send().await.unwrap();
    let etag = first.headers()["etag"].to_str().unwrap().to_string();

    let res = app
        .client
        .get(&url)
        .header("If-None-Match", etag)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 304);
}

#[tokio::test]
async fn tampered_token_is_rejected() {
    let app = TestApp::spawn().await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;
    let url = download_url_for(&app, &id, &token).await;

    let res = app.client.get(format!("{url}x")).send().await.unwrap();
    assert_eq!(res.status().as_u16(), 401);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["code"], "TOKEN_INVALID");
}

#[tokio::test]
async fn bearer_token_does_not_open_files() {
    let app = TestApp::spawn().await;
    let token = app.token_for("alice");

    let res = app
        .get_without_token(&format!("/api/v1/files/{token}"))
        .await;
    assert_eq!(res.status, 401);
    assert_eq!(res.body["code"], "TOKEN_INVALID");
}

#[tokio::test]
async fn file_of_deleted_receipt_is_gone() {
    let app = TestApp::spawn().await;
    let token = app.token_for("alice");
    let id = app.upload_pdf(&token).await;
    let url = download_url_for(&app, &id, &token).await;

    let res = app.delete_with_token(&routes::receipt(&id), &token).await;
    assert_eq!(res.status, 204);

    let res = app.client.get(&url).send().await.unwrap();
    assert_eq!(res.status().as_u16(), 404);
}
