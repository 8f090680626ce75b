#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ::common::storage::BlobStore;
use ::common::storage::filesystem::FilesystemBlobStore;
use ::common::{BackoffConfig, ExtractionRequested, MqAppConfig};
use reqwest::Client;
use sea_orm::{DatabaseConnection, DbErr};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

use receipt_server::config::{
    AppConfig, AuthConfig, CorsConfig, DatabaseConfig, EntitlementsConfig, ExtractionConfig,
    InferenceConfig, ServerConfig, StorageBackend, StorageConfig,
};
use receipt_server::dispatch::{ExtractionDispatcher, InlineDispatcher};
use receipt_server::entitlements::{EntitlementError, Entitlements, FEATURE_SCANS, FEATURE_SUMMARY};
use receipt_server::entity::receipt;
use receipt_server::extraction::normalize::ExtractedFields;
use receipt_server::extraction::schema::{Merchant, ParsedItem, ParsedReceipt, Totals, Transaction};
use receipt_server::extraction::{
    DocumentParser, InferenceError, Orchestrator, ReceiptRecords, RunSettings,
};
use receipt_server::state::AppState;
use receipt_server::store::PersistOutcome;
use receipt_server::utils::jwt;

pub const JWT_SECRET: &str = "test-secret-for-integration-tests";
pub const FILE_SECRET: &str = "test-file-secret";
pub const MAX_BLOB_SIZE: u64 = 64 * 1024;

pub const SAMPLE_PDF: &[u8] = b"%PDF-1.4\n1 0 obj << /Type /Catalog >> endobj\ntrailer << /Root 1 0 R >>\n%%EOF\n";

pub mod routes {
    pub const RECEIPTS: &str = "/api/v1/receipts";

    pub fn receipt(id: &str) -> String {
        format!("/api/v1/receipts/{id}")
    }

    pub fn download_url(id: &str) -> String {
        format!("/api/v1/receipts/{id}/download-url")
    }

    pub fn cancel(id: &str) -> String {
        format!("/api/v1/receipts/{id}/cancel")
    }
}

/// The coffee-shop receipt every happy-path test extracts.
pub fn coffee_receipt() -> ParsedReceipt {
    ParsedReceipt {
        merchant: Merchant {
            name: Some("Blue Bottle".into()),
            address: Some("1 Ferry Building, San Francisco".into()),
            contact: Some("+1 415 555 0100".into()),
        },
        transaction: Transaction {
            date: Some("2024-03-02".into()),
            time: Some("08:15".into()),
            receipt_number: Some("A-1029".into()),
            payment_method: Some("VISA".into()),
        },
        items: vec![
            ParsedItem {
                name: "Coffee".into(),
                quantity: Some(2.0),
                unit_price: Some(4.5),
                total_price: Some(9.0),
            },
            ParsedItem {
                name: "Croissant".into(),
                quantity: Some(1.0),
                unit_price: Some(13.0),
                total_price: Some(13.0),
            },
        ],
        totals: Totals {
            subtotal: Some(22.0),
            taxes: Some(0.0),
            total: Some(22.0),
            currency: Some("usd".into()),
        },
    }
}

/// Parser stub replaying scripted results; the last one repeats.
pub struct StubParser {
    script: std::sync::Mutex<Vec<Result<ParsedReceipt, InferenceError>>>,
    pub calls: AtomicUsize,
    /// Document URLs handed to the parser, in call order.
    pub urls: std::sync::Mutex<Vec<String>>,
    pub delay: Duration,
}

impl StubParser {
    pub fn succeeding(receipt: ParsedReceipt) -> Self {
        Self::scripted(vec![Ok(receipt)])
    }

    pub fn scripted(script: Vec<Result<ParsedReceipt, InferenceError>>) -> Self {
        Self {
            script: std::sync::Mutex::new(script),
            calls: AtomicUsize::new(0),
            urls: std::sync::Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

fn replay(result: &Result<ParsedReceipt, InferenceError>) -> Result<ParsedReceipt, InferenceError> {
    match result {
        Ok(r) => Ok(r.clone()),
        Err(InferenceError::Status { status, body }) => Err(InferenceError::Status {
            status: *status,
            body: body.clone(),
        }),
        Err(InferenceError::Timeout(d)) => Err(InferenceError::Timeout(*d)),
        Err(other) => Err(InferenceError::Status {
            status: 500,
            body: other.to_string(),
        }),
    }
}

#[async_trait]
impl DocumentParser for StubParser {
    async fn parse(&self, pdf_url: &str) -> Result<ParsedReceipt, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(pdf_url.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            let next = script.remove(0);
            return next;
        }
        replay(&script[0])
    }
}

/// Record store whose final write always fails.
pub struct FailingPersist {
    pub db: DatabaseConnection,
    pub attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl ReceiptRecords for FailingPersist {
    async fn load(&self, id: Uuid) -> Result<Option<receipt::Model>, DbErr> {
        ReceiptRecords::load(&self.db, id).await
    }

    async fn persist(&self, _id: Uuid, _fields: &ExtractedFields) -> Result<PersistOutcome, DbErr> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(DbErr::Custom("disk I/O error".into()))
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> Result<bool, DbErr> {
        ReceiptRecords::mark_failed(&self.db, id, message).await
    }
}

/// Entitlements with fixed answers that count tracked events.
pub struct StubEntitlements {
    pub scans: Result<bool, u16>,
    pub summary: Result<bool, u16>,
    pub tracked: mpsc::UnboundedSender<(String, String)>,
}

#[async_trait]
impl Entitlements for StubEntitlements {
    async fn check(&self, _owner_id: &str, feature: &str) -> Result<bool, EntitlementError> {
        let answer = match feature {
            FEATURE_SCANS => self.scans,
            FEATURE_SUMMARY => self.summary,
            _ => Ok(false),
        };
        answer.map_err(EntitlementError::Status)
    }

    async fn track(&self, owner_id: &str, event: &str) -> Result<(), EntitlementError> {
        let _ = self.tracked.send((owner_id.to_string(), event.to_string()));
        Ok(())
    }
}

/// Dispatcher that never reaches a worker.
pub struct BrokenDispatcher;

#[async_trait]
impl ExtractionDispatcher for BrokenDispatcher {
    async fn dispatch(&self, _event: ExtractionRequested) -> Result<(), mq::MqError> {
        Err(mq::MqError::Publish {
            queue: "receipt_extraction".into(),
            reason: "connection refused".into(),
        })
    }
}

/// Knobs for a test server.
pub struct TestOptions {
    pub parser: Arc<dyn DocumentParser>,
    /// When set, every final write fails and is counted here.
    pub failing_persist: Option<Arc<AtomicUsize>>,
    pub scans: Result<bool, u16>,
    pub summary: Result<bool, u16>,
    pub broken_dispatch: bool,
    pub max_parse_attempts: u8,
    pub max_persist_attempts: u8,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            parser: Arc::new(StubParser::succeeding(coffee_receipt())),
            failing_persist: None,
            scans: Ok(true),
            summary: Ok(true),
            broken_dispatch: false,
            max_parse_attempts: 3,
            max_persist_attempts: 3,
        }
    }
}

/// A running test server.
pub struct TestApp {
    pub addr: SocketAddr,
    pub client: Client,
    pub db: DatabaseConnection,
    pub blob_dir: PathBuf,
    pub tracked: mpsc::UnboundedReceiver<(String, String)>,
    _blob_root: TempDir,
}

/// Parsed HTTP response for test assertions.
pub struct TestResponse {
    pub status: u16,
    /// Raw response body as text.
    pub text: String,
    /// Parsed JSON body, or `Null` if the response is not valid JSON.
    pub body: Value,
}

fn test_config(blob_dir: PathBuf) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            public_base_url: "http://127.0.0.1:0".to_string(),
            cors: CorsConfig {
                allow_origins: vec![],
                max_age: 3600,
            },
        },
        database: DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
        },
        auth: AuthConfig {
            jwt_secret: JWT_SECRET.to_string(),
            issuer: None,
        },
        storage: StorageConfig {
            backend: StorageBackend::Filesystem,
            path: blob_dir,
            max_blob_size: MAX_BLOB_SIZE,
            download_url_secret: FILE_SECRET.to_string(),
            download_url_ttl_secs: 300,
            s3: None,
        },
        mq: MqAppConfig::default(),
        extraction: ExtractionConfig {
            backoff: BackoffConfig {
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            ..Default::default()
        },
        inference: InferenceConfig {
            api_url: "http://127.0.0.1:9/v1/messages".to_string(),
            api_key: String::new(),
            model: "test-model".to_string(),
            max_tokens: 1024,
            timeout_secs: 5,
        },
        entitlements: EntitlementsConfig {
            enabled: false,
            api_url: "http://127.0.0.1:9".to_string(),
            api_key: String::new(),
            timeout_secs: 1,
        },
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(TestOptions::default()).await
    }

    pub async fn spawn_with(options: TestOptions) -> Self {
        let blob_root = tempfile::tempdir().expect("Failed to create blob dir");
        let blob_dir = blob_root.path().join("blobs");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let addr = listener.local_addr().unwrap();

        let mut app_config = test_config(blob_dir.clone());
        app_config.server.public_base_url = format!("http://{addr}");
        app_config.extraction.max_parse_attempts = options.max_parse_attempts;
        app_config.extraction.max_persist_attempts = options.max_persist_attempts;

        let db = receipt_server::database::init_db(&app_config.database)
            .await
            .expect("Failed to initialize test database");

        let blob_store: Arc<dyn BlobStore> = Arc::new(
            FilesystemBlobStore::new(blob_dir.clone(), MAX_BLOB_SIZE)
                .await
                .expect("Failed to open blob store"),
        );

        let (tracked_tx, tracked_rx) = mpsc::unbounded_channel();
        let entitlements: Arc<dyn Entitlements> = Arc::new(StubEntitlements {
            scans: options.scans,
            summary: options.summary,
            tracked: tracked_tx,
        });

        let (usage_tx, usage_rx) = mpsc::unbounded_channel();
        tokio::spawn(receipt_server::consumers::run_metering(
            usage_rx,
            Arc::clone(&entitlements),
        ));

        let records: Arc<dyn ReceiptRecords> = match options.failing_persist {
            Some(attempts) => Arc::new(FailingPersist {
                db: db.clone(),
                attempts,
            }),
            None => Arc::new(db.clone()),
        };
        let orchestrator = Arc::new(
            Orchestrator::new(
                records,
                options.parser,
                RunSettings::new(&app_config.extraction, &app_config.inference),
            )
            .with_usage_sink(usage_tx),
        );

        let dispatcher: Arc<dyn ExtractionDispatcher> = if options.broken_dispatch {
            Arc::new(BrokenDispatcher)
        } else {
            Arc::new(InlineDispatcher::new(orchestrator))
        };

        let state = AppState {
            db: db.clone(),
            config: app_config,
            blob_store,
            dispatcher,
            entitlements,
        };

        let app = receipt_server::build_router(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            client: Client::new(),
            db,
            blob_dir,
            tracked: tracked_rx,
            _blob_root: blob_root,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn token_for(&self, owner_id: &str) -> String {
        jwt::sign(owner_id, JWT_SECRET, None, chrono::Duration::hours(1))
            .expect("Failed to sign test token")
    }

    pub async fn get_with_token(&self, path: &str, token: &str) -> TestResponse {
        let res = self
            .client
            .get(self.url(path))
            .header("Authorization", format!("Bearer {token}"))
            .send()
            .await
            .expect("Failed to send GET request");

        TestResponse::from_response(res).await
    }

    pub async fn get_without_token(&self, path: &str) -> TestResponse {
        let res = self
            .client
            .get(self.url(path))
            .send()
            .await
            .expect("Failed to send GET request");

        TestResponse::from_response(res).await
    }

    pub async fn post_with_token(&self, path: &str, token: &str) -> TestResponse {
        let res = self
            .client
            .post(self.url(path))
            .header("Authorization", format!("Bearer {token}"))
            .send()
            .await
            .expect("Failed to send POST request");

        TestResponse::from_response(res).await
    }

    pub async fn delete_with_token(&self, path: &str, token: &str) -> TestResponse {
        let res = self
            .client
            .delete(self.url(path))
            .header("Authorization", format!("Bearer {token}"))
            .send()
            .await
            .expect("Failed to send DELETE request");

        TestResponse::from_response(res).await
    }

    pub async fn upload(
        &self,
        file_name: &str,
        mime: &str,
        file_bytes: Vec<u8>,
        token: &str,
    ) -> TestResponse {
        let form =
            reqwest::multipart::Form::new().part("file", pdf_part(file_name, mime, file_bytes));
        self.upload_form(form, token).await
    }

    pub async fn upload_form(&self, form: reqwest::multipart::Form, token: &str) -> TestResponse {
        let res = self
            .client
            .post(self.url(routes::RECEIPTS))
            .header("Authorization", format!("Bearer {token}"))
            .multipart(form)
            .send()
            .await
            .expect("Failed to send multipart upload request");

        TestResponse::from_response(res).await
    }

    /// Upload the sample PDF and return the new receipt id.
    pub async fn upload_pdf(&self, token: &str) -> String {
        let res = self
            .upload("receipt.pdf", "application/pdf", SAMPLE_PDF.to_vec(), token)
            .await;
        assert_eq!(res.status, 201, "upload failed: {}", res.text);
        res.body["receiptId"]
            .as_str()
            .expect("upload response should contain receiptId")
            .to_string()
    }

    /// Poll the receipt until its status is no longer `pending`.
    pub async fn wait_until_final(&self, id: &str, token: &str) -> TestResponse {
        for _ in 0..200 {
            let res = self.get_with_token(&routes::receipt(id), token).await;
            if res.body["status"] != "pending" {
                return res;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("receipt {id} is still pending");
    }

    /// Number of files in the blob store, ignoring the temp directory.
    pub fn stored_blob_count(&self) -> usize {
        fn walk(dir: &std::path::Path) -> usize {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return 0;
            };
            entries
                .flatten()
                .map(|e| {
                    let path = e.path();
                    if path.file_name().is_some_and(|n| n == ".tmp") {
                        0
                    } else if path.is_dir() {
                        walk(&path)
                    } else {
                        1
                    }
                })
                .sum()
        }
        walk(&self.blob_dir)
    }
}

pub fn pdf_part(file_name: &str, mime: &str, file_bytes: Vec<u8>) -> reqwest::multipart::Part {
    reqwest::multipart::Part::bytes(file_bytes)
        .file_name(file_name.to_string())
        .mime_str(mime)
        .expect("Failed to set MIME type")
}

impl TestResponse {
    pub async fn from_response(res: reqwest::Response) -> Self {
        let status = res.status().as_u16();
        let text = res.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text).unwrap_or(Value::Null);
        Self { status, text, body }
    }
}
