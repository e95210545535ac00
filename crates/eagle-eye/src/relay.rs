use std::any::Any;
use std::panic::AssertUnwindSafe;

use eagle_common::upstream::{ChatCompletionRequest, Citation, Message, UpstreamClient};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::RelayError;

pub const SYSTEM_PROMPT: &str = "You are a private equity financial analyst. Be as thorough in your \
search as possible. Always include source URLs in your response!";

const TEMPERATURE: f32 = 0.1;
const TOP_P: f32 = 0.7;
const FREQUENCY_PENALTY: f32 = 1.2;

#[derive(Debug, Default, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisResult {
    pub response: String,
    pub citations: Vec<Citation>,
}

/// Turns a caller's query into one upstream completion call and back.
///
/// Holds no per-request state; a single instance is shared by every handler.
pub struct Relay {
    upstream: UpstreamClient,
}

impl Relay {
    pub fn new(upstream: UpstreamClient) -> Self {
        Self { upstream }
    }

    /// Analyze a query. Every failure, including a panic inside the
    /// pipeline, comes back as a [`RelayError`].
    pub async fn analyze(&self, query: Option<&str>) -> Result<AnalysisResult, RelayError> {
        let outcome = AssertUnwindSafe(self.run(query)).catch_unwind().await;
        let result = outcome
            .unwrap_or_else(|panic| Err(RelayError::UnexpectedError(panic_message(&*panic))));

        match &result {
            Ok(analysis) => info!(
                citations = analysis.citations.len(),
                response_len = analysis.response.len(),
                "analysis succeeded"
            ),
            Err(err) => warn!(kind = ?err.kind(), error = %err, "analysis failed"),
        }
        result
    }

    async fn run(&self, query: Option<&str>) -> Result<AnalysisResult, RelayError> {
        let query = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| RelayError::InvalidInput("Query is required".to_string()))?;

        info!(query_len = query.len(), "forwarding query to upstream");
        let request = self.build_request(query);
        let completion = self.upstream.chat_completions(&request).await?;

        Ok(AnalysisResult {
            response: completion.content,
            citations: completion.citations,
        })
    }

    fn build_request(&self, query: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.upstream.config().model.clone(),
            messages: vec![Message::system(SYSTEM_PROMPT), Message::user(query)],
            temperature: TEMPERATURE,
            top_p: TOP_P,
            frequency_penalty: FREQUENCY_PENALTY,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
