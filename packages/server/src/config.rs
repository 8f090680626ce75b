use std::path::PathBuf;

use common::storage::s3::S3Config;
pub use common::{BackoffConfig, MqAppConfig};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub allow_origins: Vec<String>,
    pub max_age: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL, used to build file URLs handed to the inference provider.
    pub public_base_url: String,
    pub cors: CorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    20
}
fn default_min_connections() -> u32 {
    1
}

/// Bearer tokens are issued by the external identity provider; the service only verifies them.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// Expected `iss` claim. Not checked when absent.
    #[serde(default)]
    pub issuer: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Filesystem,
    S3,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the filesystem backend.
    pub path: PathBuf,
    /// Maximum accepted upload size in bytes.
    pub max_blob_size: u64,
    /// Secret for signing file download tokens (filesystem backend).
    pub download_url_secret: String,
    /// Lifetime of minted download URLs.
    pub download_url_ttl_secs: u64,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Hard cap on state transitions per run.
    pub max_steps: u32,
    pub max_parse_attempts: u8,
    pub max_persist_attempts: u8,
    #[serde(flatten)]
    pub backoff: BackoffConfig,
    /// Receipts still pending after this long are marked as failed.
    pub stuck_timeout_secs: u64,
    pub stuck_scan_interval_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_steps: 16,
            max_parse_attempts: 3,
            max_persist_attempts: 3,
            backoff: BackoffConfig::default(),
            stuck_timeout_secs: 900,
            stuck_scan_interval_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EntitlementsConfig {
    /// When disabled every feature is granted and usage is only logged.
    pub enabled: bool,
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub mq: MqAppConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    pub inference: InferenceConfig,
    pub entitlements: EntitlementsConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("server.public_base_url", "http://127.0.0.1:3000")?
            .set_default("server.cors.allow_origins", Vec::<String>::new())?
            .set_default("server.cors.max_age", 3600)?
            .set_default("database.url", "sqlite://receipts.db?mode=rwc")?
            .set_default("storage.backend", "filesystem")?
            .set_default("storage.path", "./data/blobs")?
            .set_default("storage.max_blob_size", 20 * 1024 * 1024)?
            .set_default("storage.download_url_ttl_secs", 300)?
            .set_default("extraction.max_steps", 16)?
            .set_default("extraction.max_parse_attempts", 3)?
            .set_default("extraction.max_persist_attempts", 3)?
            .set_default("extraction.base_delay_ms", 500)?
            .set_default("extraction.max_delay_ms", 10_000)?
            .set_default("extraction.stuck_timeout_secs", 900)?
            .set_default("extraction.stuck_scan_interval_secs", 60)?
            .set_default("inference.api_url", "https://api.anthropic.com/v1/messages")?
            .set_default("inference.model", "claude-3-5-sonnet-20241022")?
            .set_default("inference.max_tokens", 3094)?
            .set_default("inference.timeout_secs", 60)?
            .set_default("entitlements.enabled", false)?
            .set_default("entitlements.api_url", "https://api.schematichq.com")?
            .set_default("entitlements.timeout_secs", 5)?
            // Load from config/config.toml
            .add_source(File::with_name("config/config").required(false))
            // Override from environment (e.g., RECEIPTS__AUTH__JWT_SECRET)
            .add_source(Environment::with_prefix("RECEIPTS").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Lifetime of the URL handed to an extraction run. A queued run can start well after
    /// upload, but never after the stuck sweeper has given up on the receipt.
    pub fn extraction_url_ttl_secs(&self) -> u64 {
        self.storage
            .download_url_ttl_secs
            .max(self.extraction.stuck_timeout_secs)
    }
}
