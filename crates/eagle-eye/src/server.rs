use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::HeaderValue;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Form, Json, Router};
use serde::Deserialize;
use tracing::{error, info};

use crate::console::{Console, ERROR_MESSAGE};
use crate::error::RelayError;
use crate::relay::{AnalysisResult, AnalyzeRequest, Relay};

/// Request bodies above this size are rejected before reaching a handler.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Advertised to intermediaries on every `/api` response, in seconds.
pub const REQUEST_TIMEOUT_HEADER: &str = "request-timeout";
const REQUEST_TIMEOUT_SECS: &str = "60";

#[derive(Clone)]
pub struct AppState {
    relay: Arc<Relay>,
    console: Arc<Console>,
}

impl AppState {
    pub fn new(relay: Arc<Relay>, console: Arc<Console>) -> Self {
        Self { relay, console }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/analyze", post(analyze))
        .layer(middleware::map_response(advertise_timeout));

    Router::new()
        .route("/", get(console_form).post(console_submit))
        .route("/healthz", get(healthz))
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn advertise_timeout(mut response: Response) -> Response {
    response.headers_mut().insert(
        REQUEST_TIMEOUT_HEADER,
        HeaderValue::from_static(REQUEST_TIMEOUT_SECS),
    );
    response
}

async fn healthz() -> &'static str {
    "ok"
}

/// `POST /api/analyze` with `{"query": "..."}`.
async fn analyze(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<AnalysisResult>, RelayError> {
    let body = body.map_err(|rejection| RelayError::RejectedBody {
        status: rejection.status().as_u16(),
        message: rejection.body_text(),
    })?;
    let request: AnalyzeRequest = serde_json::from_slice(&body)
        .map_err(|e| RelayError::InvalidInput(format!("Invalid request body: {e}")))?;

    info!("analyze request received");
    let result = state.relay.analyze(request.query.as_deref()).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct ConsoleForm {
    #[serde(default)]
    query: Option<String>,
}

async fn console_form(State(state): State<AppState>) -> Response {
    page(state.console.render_form())
}

async fn console_submit(State(state): State<AppState>, Form(form): Form<ConsoleForm>) -> Response {
    let query = form.query.as_deref();
    let outcome = state.relay.analyze(query).await;
    page(state.console.render_outcome(query.unwrap_or_default(), &outcome))
}

fn page(rendered: Result<String, minijinja::Error>) -> Response {
    match rendered {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!(error = %e, "console render failed");
            (StatusCode::INTERNAL_SERVER_ERROR, ERROR_MESSAGE).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use eagle_common::upstream::DEFAULT_TIMEOUT;
    use serde_json::{json, Value};

    use super::*;
    use crate::relay::tests::{relay_for, FakeUpstream};

    async fn spawn_app(upstream: SocketAddr, timeout: Duration) -> SocketAddr {
        let state = AppState::new(
            Arc::new(relay_for(upstream, timeout)),
            Arc::new(Console::new().unwrap()),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        addr
    }

    async fn post_analyze(app: SocketAddr, body: impl Into<reqwest::Body>) -> (u16, Option<String>, Value) {
        let resp = reqwest::Client::new()
            .post(format!("http://{app}/api/analyze"))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        let timeout_header = resp
            .headers()
            .get(REQUEST_TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let json = resp.json::<Value>().await.unwrap();
        (status, timeout_header, json)
    }

    const OK_BODY: &str = r#"{"choices":[{"message":{"content":"X"}}]}"#;

    #[tokio::test]
    async fn analyze_success_shape_and_timeout_header() {
        let upstream = FakeUpstream::new(StatusCode::OK, OK_BODY).spawn().await;
        let app = spawn_app(upstream, DEFAULT_TIMEOUT).await;

        let (status, header, body) = post_analyze(app, json!({"query": "acme"}).to_string()).await;
        assert_eq!(status, 200);
        assert_eq!(header.as_deref(), Some("60"));
        assert_eq!(body, json!({"response": "X", "citations": []}));
    }

    #[tokio::test]
    async fn missing_query_is_400_without_upstream_call() {
        let fake = FakeUpstream::new(StatusCode::OK, OK_BODY);
        let hits = Arc::clone(&fake.hits);
        let app = spawn_app(fake.spawn().await, DEFAULT_TIMEOUT).await;

        for payload in [json!({}), json!({"query": ""}), json!({"query": "  "})] {
            let (status, header, body) = post_analyze(app, payload.to_string()).await;
            assert_eq!(status, 400);
            assert_eq!(header.as_deref(), Some("60"));
            assert_eq!(body, json!({"error": "Query is required"}));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_json_body_is_400() {
        let upstream = FakeUpstream::new(StatusCode::OK, OK_BODY).spawn().await;
        let app = spawn_app(upstream, DEFAULT_TIMEOUT).await;

        let (status, _, body) = post_analyze(app, "query=acme").await;
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid request body"));
    }

    #[tokio::test]
    async fn oversized_body_is_413_json_without_upstream_call() {
        let fake = FakeUpstream::new(StatusCode::OK, OK_BODY);
        let hits = Arc::clone(&fake.hits);
        let app = spawn_app(fake.spawn().await, DEFAULT_TIMEOUT).await;

        let query = "a".repeat(MAX_BODY_BYTES + 1024 * 1024);
        let (status, header, body) = post_analyze(app, json!({"query": query}).to_string()).await;
        assert_eq!(status, 413);
        assert_eq!(header.as_deref(), Some("60"));
        assert!(!body["error"].as_str().unwrap().is_empty());
        assert!(body.get("details").is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upstream_429_passes_status_and_details() {
        let upstream = FakeUpstream::new(StatusCode::TOO_MANY_REQUESTS, "quota exceeded")
            .spawn()
            .await;
        let app = spawn_app(upstream, DEFAULT_TIMEOUT).await;

        let (status, _, body) = post_analyze(app, json!({"query": "acme"}).to_string()).await;
        assert_eq!(status, 429);
        assert_eq!(body, json!({"error": "API request failed", "details": "quota exceeded"}));
    }

    #[tokio::test]
    async fn malformed_upstream_is_500() {
        let upstream = FakeUpstream::new(StatusCode::OK, r#"{"choices":[]}"#).spawn().await;
        let app = spawn_app(upstream, DEFAULT_TIMEOUT).await;

        let (status, _, body) = post_analyze(app, json!({"query": "acme"}).to_string()).await;
        assert_eq!(status, 500);
        assert_eq!(body, json!({"error": "Malformed response from upstream API"}));
    }

    #[tokio::test]
    async fn slow_upstream_is_408() {
        let upstream = FakeUpstream::new(StatusCode::OK, OK_BODY)
            .with_delay(Duration::from_secs(10))
            .spawn()
            .await;
        let app = spawn_app(upstream, Duration::from_millis(200)).await;

        let (status, header, body) = post_analyze(app, json!({"query": "acme"}).to_string()).await;
        assert_eq!(status, 408);
        assert_eq!(header.as_deref(), Some("60"));
        assert_eq!(body, json!({"error": "Request timed out"}));
    }

    #[tokio::test]
    async fn console_round_trip() {
        let body = json!({
            "choices": [{"message": {"content": "Answer -: http://example.com"}}],
            "citations": [{"url": "https://sec.gov/acme", "title": "ACME 10-K"}]
        });
        let upstream = FakeUpstream::new(StatusCode::OK, body.to_string()).spawn().await;
        let app = spawn_app(upstream, DEFAULT_TIMEOUT).await;
        let client = reqwest::Client::new();

        let form = client.get(format!("http://{app}/")).send().await.unwrap();
        assert_eq!(form.status().as_u16(), 200);
        assert!(form.text().await.unwrap().contains("<form"));

        let page = client
            .post(format!("http://{app}/"))
            .header("content-type", "application/x-www-form-urlencoded")
            .body("query=acme+margins")
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(page.contains("ACME 10-K"));
        assert!(page.contains("Answer <a href=\"http:"));
        assert!(!page.contains(ERROR_MESSAGE));
    }

    #[tokio::test]
    async fn console_shows_fixed_error_message() {
        let upstream = FakeUpstream::new(StatusCode::INTERNAL_SERVER_ERROR, "boom").spawn().await;
        let app = spawn_app(upstream, DEFAULT_TIMEOUT).await;

        let page = reqwest::Client::new()
            .post(format!("http://{app}/"))
            .header("content-type", "application/x-www-form-urlencoded")
            .body("query=acme")
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(page.contains(ERROR_MESSAGE));
        assert!(!page.contains("boom"));
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let upstream = FakeUpstream::new(StatusCode::OK, OK_BODY).spawn().await;
        let app = spawn_app(upstream, DEFAULT_TIMEOUT).await;
        let resp = reqwest::get(format!("http://{app}/healthz")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert!(resp.headers().get(REQUEST_TIMEOUT_HEADER).is_none());
        assert_eq!(resp.text().await.unwrap(), "ok");
    }
}
