use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::schema::{EXTRACTION_PROMPT, ParsedReceipt, SchemaError, parse_model_output};
use crate::config::InferenceConfig;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference call timed out after {0:?}")]
    Timeout(Duration),
    #[error("inference provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("inference transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl InferenceError {
    /// Whether another attempt may succeed. Schema failures count as transient
    /// because the same document can yield a valid reply on the next sample.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) | Self::Schema(_) => true,
            Self::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
        }
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Turns a stored receipt PDF into structured data.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// `pdf_url` must be readable by the provider without further credentials.
    async fn parse(&self, pdf_url: &str) -> Result<ParsedReceipt, InferenceError>;
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [UserMessage<'a>; 1],
}

#[derive(Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: [ContentBlock<'a>; 2],
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentBlock<'a> {
    Document { source: DocumentSource<'a> },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct DocumentSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    url: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Anthropic Messages API client sending the PDF as a URL document block.
pub struct AnthropicParser {
    client: reqwest::Client,
    config: InferenceConfig,
}

impl AnthropicParser {
    pub fn new(config: InferenceConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn request_body<'a>(&'a self, pdf_url: &'a str) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            messages: [UserMessage {
                role: "user",
                content: [
                    ContentBlock::Document {
                        source: DocumentSource {
                            kind: "url",
                            url: pdf_url,
                        },
                    },
                    ContentBlock::Text {
                        text: EXTRACTION_PROMPT,
                    },
                ],
            }],
        }
    }
}

#[async_trait]
impl DocumentParser for AnthropicParser {
    async fn parse(&self, pdf_url: &str) -> Result<ParsedReceipt, InferenceError> {
        let response = self
            .client
            .post(&self.config.api_url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.request_body(pdf_url))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status { status, body });
        }

        let body: MessagesResponse = response.json().await?;
        let text: String = body
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n");

        debug!(chars = text.len(), "Received inference reply");
        Ok(parse_model_output(&text)?)
    }
}
