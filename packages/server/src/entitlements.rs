//! Client for the external entitlement and metering service.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EntitlementsConfig;

/// Feature gating uploads.
pub const FEATURE_SCANS: &str = "scans";
/// Feature gating the generated summary on receipt details.
pub const FEATURE_SUMMARY: &str = "summary";
/// Usage event recorded for each completed extraction.
pub const EVENT_SCAN: &str = "scan";

#[derive(Debug, thiserror::Error)]
pub enum EntitlementError {
    #[error("entitlement service returned HTTP {0}")]
    Status(u16),
    #[error("entitlement service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait Entitlements: Send + Sync {
    /// Whether `owner_id` may use `feature` right now.
    async fn check(&self, owner_id: &str, feature: &str) -> Result<bool, EntitlementError>;

    /// Record one usage event against `owner_id`.
    async fn track(&self, owner_id: &str, event: &str) -> Result<(), EntitlementError>;
}

/// Grants everything. Used when no entitlement service is configured.
pub struct AllowAll;

#[async_trait]
impl Entitlements for AllowAll {
    async fn check(&self, _owner_id: &str, _feature: &str) -> Result<bool, EntitlementError> {
        Ok(true)
    }

    async fn track(&self, owner_id: &str, event: &str) -> Result<(), EntitlementError> {
        debug!(owner_id, event, "Entitlements disabled, usage not forwarded");
        Ok(())
    }
}

/// Accounts are personal, so the owner is both the company and the user.
#[derive(Serialize)]
struct Subject<'a> {
    company: Keys<'a>,
    user: Keys<'a>,
}

#[derive(Serialize)]
struct Keys<'a> {
    id: &'a str,
}

impl<'a> Subject<'a> {
    fn owner(owner_id: &'a str) -> Self {
        Self {
            company: Keys { id: owner_id },
            user: Keys { id: owner_id },
        }
    }
}

#[derive(Serialize)]
struct TrackRequest<'a> {
    event_type: &'static str,
    body: TrackBody<'a>,
}

#[derive(Serialize)]
struct TrackBody<'a> {
    event: &'a str,
    #[serde(flatten)]
    subject: Subject<'a>,
}

#[derive(Deserialize)]
struct CheckResponse {
    data: CheckData,
}

#[derive(Deserialize)]
struct CheckData {
    value: bool,
}

/// REST client for a Schematic-compatible flag check and event API.
pub struct HttpEntitlements {
    client: reqwest::Client,
    config: EntitlementsConfig,
}

impl HttpEntitlements {
    pub fn new(config: EntitlementsConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Entitlements for HttpEntitlements {
    async fn check(&self, owner_id: &str, feature: &str) -> Result<bool, EntitlementError> {
        let response = self
            .client
            .post(self.url(&format!("flags/{feature}/check")))
            .header("X-Schematic-Api-Key", &self.config.api_key)
            .json(&Subject::owner(owner_id))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EntitlementError::Status(response.status().as_u16()));
        }
        let body: CheckResponse = response.json().await?;
        Ok(body.data.value)
    }

    async fn track(&self, owner_id: &str, event: &str) -> Result<(), EntitlementError> {
        let request = TrackRequest {
            event_type: "track",
            body: TrackBody {
                event,
                subject: Subject::owner(owner_id),
            },
        };

        let response = self
            .client
            .post(self.url("events"))
            .header("X-Schematic-Api-Key", &self.config.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EntitlementError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}
