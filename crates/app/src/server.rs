use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use rag_service_core::{
    CompletionOrchestrator, CompletionRequest, CompletionResponse, CompletionStream, RagError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<CompletionOrchestrator>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionBody {
    pub query: String,
    #[serde(default)]
    pub similarity_threshold: Option<f32>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub return_context: bool,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl From<CompletionBody> for CompletionRequest {
    fn from(body: CompletionBody) -> Self {
        CompletionRequest {
            query: body.query,
            similarity_threshold: body.similarity_threshold,
            top_k: body.top_k,
            temperature: body.temperature,
            max_tokens: body.max_tokens,
            return_context: body.return_context,
            client_id: body.client_id,
            timeout: body.timeout_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CompletionEnvelope {
    pub id: String,
    pub created: i64,
    #[serde(flatten)]
    pub response: CompletionResponse,
}

pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            message: message.into(),
        }
    }
}

impl From<RagError> for ApiError {
    fn from(error: RagError) -> Self {
        let status = match &error {
            RagError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RagError::EmbeddingUnavailable(_) | RagError::GenerationFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            RagError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"error": self.kind, "message": self.message})),
        )
            .into_response()
    }
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/v1/completions", post(create_completion))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

pub async fn run_server(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let app = app_router(state);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("rag-service listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(error = %error, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let index = state.orchestrator.retriever().index().snapshot();
    Json(json!({
        "status": "healthy",
        "records": index.len(),
        "dimension": index.dimension(),
    }))
}

async fn create_completion(
    State(state): State<AppState>,
    body: Result<Json<CompletionBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    if body.timeout_ms == Some(0) {
        return Err(ApiError::bad_request("timeout_ms must be greater than zero"));
    }

    let id = format!("cmpl-{}", Uuid::new_v4());
    let stream = body.stream;
    let request = CompletionRequest::from(body);

    if stream {
        return match state.orchestrator.complete_stream(&request).await {
            Ok(streamed) => Ok(completion_events(id, streamed).into_response()),
            Err(rag_error) => Err(completion_failed(&id, rag_error)),
        };
    }

    match state.orchestrator.complete(&request).await {
        Ok(response) => Ok(Json(CompletionEnvelope {
            id,
            created: Utc::now().timestamp(),
            response,
        })
        .into_response()),
        Err(rag_error) => Err(completion_failed(&id, rag_error)),
    }
}

fn completion_failed(id: &str, rag_error: RagError) -> ApiError {
    error!(request_id = %id, kind = rag_error.kind(), error = %rag_error, "completion failed");
    ApiError::from(rag_error)
}

/// Server-sent events for a streamed completion: an optional `context`
/// event, one data event per delta, then `[DONE]`. A failure mid-stream is
/// sent as an `error` event and ends the stream without `[DONE]`.
fn completion_events(
    id: String,
    streamed: CompletionStream,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let created = Utc::now().timestamp();
    let CompletionStream {
        grounded,
        context,
        mut deltas,
    } = streamed;

    let events = async_stream::stream! {
        if let Some(context) = context {
            yield Ok(Event::default().event("context").data(json!(context).to_string()));
        }
        while let Some(delta) = deltas.next().await {
            match delta {
                Ok(delta) => {
                    let chunk = json!({
                        "id": id,
                        "created": created,
                        "delta": delta,
                        "grounded": grounded,
                    });
                    yield Ok(Event::default().data(chunk.to_string()));
                }
                Err(rag_error) => {
                    error!(
                        request_id = %id,
                        kind = rag_error.kind(),
                        error = %rag_error,
                        "completion stream failed"
                    );
                    let failure = json!({
                        "error": rag_error.kind(),
                        "message": rag_error.to_string(),
                    });
                    yield Ok(Event::default().event("error").data(failure.to_string()));
                    return;
                }
            }
        }
        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
