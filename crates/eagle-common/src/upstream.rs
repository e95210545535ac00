use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::bounded::bounded_call;
use crate::error::CommonError;

pub const DEFAULT_BASE_URL: &str = "https://api.perplexity.ai";
pub const DEFAULT_MODEL: &str = "llama-3.1-sonar-huge-128k-online";

/// Hosting platforms kill a request after this long; the upstream deadline
/// must stay strictly below it so a timeout is always ours to report.
pub const PLATFORM_REQUEST_CEILING: Duration = Duration::from_secs(60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(55);
pub const DEFAULT_MAX_ERROR_BODY_BYTES: usize = 8 * 1024;

#[derive(Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_error_body_bytes: usize,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .field("max_error_body_bytes", &self.max_error_body_bytes)
            .finish()
    }
}

impl UpstreamConfig {
    /// Required:
    /// - `PERPLEXITY_API_KEY`
    ///
    /// Optional:
    /// - `PERPLEXITY_BASE_URL` (default: "https://api.perplexity.ai")
    /// - `PERPLEXITY_MODEL` (default: "llama-3.1-sonar-huge-128k-online")
    /// - `UPSTREAM_TIMEOUT_SECS` (default: 55, must be below 60)
    /// - `UPSTREAM_MAX_ERROR_BODY_BYTES` (default: 8192)
    pub fn from_env() -> Result<Self, CommonError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CommonError> {
        let api_key = lookup("PERPLEXITY_API_KEY").ok_or_else(|| {
            CommonError::Config("PERPLEXITY_API_KEY environment variable is required".to_string())
        })?;

        let base_url = lookup("PERPLEXITY_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let model = lookup("PERPLEXITY_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let timeout = parse_number(&lookup, "UPSTREAM_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        let max_error_body_bytes = parse_number(&lookup, "UPSTREAM_MAX_ERROR_BODY_BYTES")?
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_ERROR_BODY_BYTES);

        Self::new(base_url, api_key, model, timeout, max_error_body_bytes)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
        max_error_body_bytes: usize,
    ) -> Result<Self, CommonError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(CommonError::Config("PERPLEXITY_API_KEY must not be empty".to_string()));
        }
        if timeout.is_zero() || timeout >= PLATFORM_REQUEST_CEILING {
            return Err(CommonError::Config(format!(
                "upstream timeout must be non-zero and below {}s, got {}s",
                PLATFORM_REQUEST_CEILING.as_secs(),
                timeout.as_secs_f64()
            )));
        }

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            timeout,
            max_error_body_bytes,
        })
    }
}

fn parse_number(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<u64>, CommonError> {
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|_| CommonError::Config(format!("{name} is not a number: {raw}")))
        })
        .transpose()
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream call exceeded its {}ms deadline", .0.as_millis())]
    Timeout(Duration),

    #[error("upstream returned error: status={status} body={body}")]
    Upstream { status: StatusCode, body: String },

    #[error("malformed upstream response: {0}")]
    Malformed(#[from] ShapeError),
}

/// Ways a 2xx completion payload can fail validation.
#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("body is not valid completion JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("choices list is missing or empty")]
    NoChoices,

    #[error("choices[{index}] has no message content")]
    MissingContent { index: usize },
}

pub struct UpstreamClient {
    config: UpstreamConfig,
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Result<Self, UpstreamClientError> {
        let http = reqwest::Client::builder()
            .user_agent("eagle-eye/relay")
            .build()?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Single attempt, bounded by the configured deadline. The deadline
    /// covers both the send and the full body read.
    pub async fn chat_completions(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ValidatedCompletion, UpstreamClientError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let exchange = async {
            let resp = self
                .http
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(request)
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                let body = read_limited_text(resp, self.config.max_error_body_bytes).await;
                error!(status = %status, body = %body, "upstream API error");
                return Err(UpstreamClientError::Upstream { status, body });
            }

            Ok::<_, UpstreamClientError>(resp.bytes().await?)
        };

        let body = bounded_call(self.config.timeout, exchange)
            .await
            .map_err(|e| {
                warn!(timeout_ms = e.deadline.as_millis(), "upstream call timed out, request cancelled");
                UpstreamClientError::Timeout(e.deadline)
            })??;

        let completion = validate_completion(&body)
            .inspect_err(|e| warn!(error = %e, "upstream returned malformed completion"))?;
        Ok(completion)
    }
}

async fn read_limited_text(resp: reqwest::Response, max_bytes: usize) -> String {
    match resp.bytes().await {
        Ok(mut b) => {
            if b.len() > max_bytes {
                b.truncate(max_bytes);
            }
            String::from_utf8_lossy(&b).to_string()
        }
        Err(e) => {
            warn!(error = %e, "failed to read upstream error body");
            "<failed to read error body>".to_string()
        }
    }
}

/// Parse and shape-check a successful completion body.
///
/// Every choice must carry non-blank `message.content`; only the first one is
/// kept.
pub fn validate_completion(body: &[u8]) -> Result<ValidatedCompletion, ShapeError> {
    let parsed: ChatCompletionResponse = serde_json::from_slice(body)?;

    if parsed.choices.is_empty() {
        return Err(ShapeError::NoChoices);
    }

    let mut contents = Vec::with_capacity(parsed.choices.len());
    for (index, choice) in parsed.choices.into_iter().enumerate() {
        let content = choice
            .message
            .and_then(|m| m.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ShapeError::MissingContent { index })?;
        contents.push(content);
    }

    Ok(ValidatedCompletion {
        content: contents.swap_remove(0),
        citations: parsed.citations.unwrap_or_default(),
    })
}

/// A completion that passed shape validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCompletion {
    pub content: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
}

/// A source reference attached to a completion.
///
/// Providers send either `{"url", "title", ...}` objects or bare URL strings;
/// both deserialize into this type. Keys other than `url` and `title` are kept
/// in `extra` and serialize back as they came. A `null` title serializes as an
/// absent one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CitationWire")]
pub struct Citation {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Citation {
    pub fn new(url: impl Into<String>, title: Option<String>) -> Self {
        Self {
            url: url.into(),
            title,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CitationWire {
    Url(String),
    Entry(CitationEntry),
}

#[derive(Deserialize)]
struct CitationEntry {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl From<CitationWire> for Citation {
    fn from(wire: CitationWire) -> Self {
        match wire {
            CitationWire::Url(url) => Self::new(url, None),
            CitationWire::Entry(CitationEntry { url, title, extra }) => Self { url, title, extra },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    citations: Option<Vec<Citation>>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    #[serde(default)]
    message: Option<ChatCompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    #[serde(default)]
    content: Option<String>,
}
