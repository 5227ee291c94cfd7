use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument};

use crate::{
    admission::{API_KEY_HEADER, Admission, ApiKeyAuth},
    api::{
        ApiJson, BatchBody, BatchItemResponse, BatchResponse, ChatBody, ChatResponse, CompleteBody,
        CompleteResponse, GenerateBody, GenerateResponse, ItemStatus, batch_defaults,
        chat_defaults, complete_defaults, generate_defaults, round2, tokens_per_second,
    },
    batch::BatchCoordinator,
    config::AppConfig,
    error::ServiceError,
    model::ModelMetadata,
    pool::{ExecutionSlotPool, PoolStatus},
    prompt::{format_chat, format_complete},
};

const SERVICE_NAME: &str = "LLM Inference API";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pool: ExecutionSlotPool,
    pub auth: ApiKeyAuth,
    pub admission: Admission,
    pub batcher: BatchCoordinator,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, pool: ExecutionSlotPool) -> Self {
        Self {
            auth: ApiKeyAuth::new(config.api_key.clone()),
            admission: Admission::new(&config.gateway),
            batcher: BatchCoordinator::new(pool.clone(), &config.gateway),
            pool,
            config,
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
    auth_enabled: bool,
    slots: PoolStatus,
}

pub fn build_router(config: Arc<AppConfig>, pool: ExecutionSlotPool) -> Router {
    let state = AppState::new(config, pool);

    let protected = Router::new()
        .route("/generate", post(generate))
        .route("/complete", post(complete))
        .route("/chat", post(chat))
        .route("/batch", post(batch))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Rejects requests whose `X-API-Key` does not match before the body is
/// even read. A no-op when no key is configured.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    state.auth.check(presented)?;
    Ok(next.run(request).await)
}

async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    let model = ModelMetadata {
        name: state.config.model_id.clone(),
        backend: state.config.backend.as_str().to_string(),
        slots: state.pool.capacity(),
    };
    let authentication = if state.auth.is_enabled() {
        "Required"
    } else {
        "Disabled"
    };
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "model": model,
        "endpoints": {
            "/health": "Health check",
            "/generate": "Generate text from prompt",
            "/complete": "Code completion",
            "/chat": "Chat interface",
            "/batch": "Batch processing",
        },
        "authentication": authentication,
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model_loaded: state.pool.capacity() > 0 && !state.pool.is_closed(),
        auth_enabled: state.auth.is_enabled(),
        slots: state.pool.status(),
    })
}

#[instrument(skip_all, fields(endpoint = "/generate"))]
async fn generate(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<GenerateBody>,
) -> Result<Json<GenerateResponse>, ServiceError> {
    let started = Instant::now();
    let request = state
        .admission
        .validate(&body.prompt, &body.overrides(), &generate_defaults())?;
    state.admission.admit(&state.pool)?;

    let result = state.pool.run(request).await?;
    let elapsed = started.elapsed().as_secs_f64();
    info!(tokens = result.tokens_generated, slot = result.slot, "generate completed");

    Ok(Json(GenerateResponse {
        tokens_per_second: tokens_per_second(result.tokens_generated, elapsed),
        tokens_generated: result.tokens_generated,
        generated_text: result.text,
        time_seconds: round2(elapsed),
    }))
}

#[instrument(skip_all, fields(endpoint = "/complete"))]
async fn complete(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<CompleteBody>,
) -> Result<Json<CompleteResponse>, ServiceError> {
    let started = Instant::now();
    let prompt = format_complete(&body.code);
    let request = state.admission.validate_field(
        "code",
        &prompt,
        &body.overrides(),
        &complete_defaults(),
    )?;
    state.admission.admit(&state.pool)?;

    let result = state.pool.run(request).await?;
    let elapsed = started.elapsed().as_secs_f64();
    info!(tokens = result.tokens_generated, slot = result.slot, "completion finished");

    Ok(Json(CompleteResponse {
        full_code: format!("{}{}", body.code, result.text),
        completion: result.text,
        time_seconds: round2(elapsed),
    }))
}

#[instrument(skip_all, fields(endpoint = "/chat"))]
async fn chat(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ChatBody>,
) -> Result<Json<ChatResponse>, ServiceError> {
    let started = Instant::now();
    if body.messages.is_empty() {
        return Err(ServiceError::invalid(
            "messages",
            "must contain at least one message",
        ));
    }
    let prompt = format_chat(&body.messages);
    let request = state.admission.validate_field(
        "messages",
        &prompt,
        &body.overrides(),
        &chat_defaults(),
    )?;
    state.admission.admit(&state.pool)?;

    let result = state.pool.run(request).await?;
    let elapsed = started.elapsed().as_secs_f64();
    info!(tokens = result.tokens_generated, slot = result.slot, "chat turn finished");

    Ok(Json(ChatResponse {
        response: result.text.trim().to_string(),
        time_seconds: round2(elapsed),
    }))
}

#[instrument(skip_all, fields(endpoint = "/batch"))]
async fn batch(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<BatchBody>,
) -> Result<Json<BatchResponse>, ServiceError> {
    let started = Instant::now();
    state.batcher.ensure_within_limit(body.prompts.len())?;
    let requests = state.admission.validate_many(
        &body.prompts,
        &body.overrides(),
        &batch_defaults(),
    )?;
    state.admission.admit(&state.pool)?;

    let items = state.batcher.run_batch(requests).await?;
    let results: Vec<BatchItemResponse> = items
        .into_iter()
        .map(|item| match item.outcome {
            Ok(result) => BatchItemResponse {
                index: item.index,
                prompt: item.prompt,
                generated_text: Some(result.text),
                error: None,
                error_kind: None,
                status: ItemStatus::Success,
            },
            Err(err) => BatchItemResponse {
                index: item.index,
                prompt: item.prompt,
                generated_text: None,
                error: Some(err.to_string()),
                error_kind: Some(err.kind().to_string()),
                status: ItemStatus::Error,
            },
        })
        .collect();

    let successful = results
        .iter()
        .filter(|r| r.status == ItemStatus::Success)
        .count();
    let total_prompts = results.len();
    info!(total_prompts, successful, "batch completed");

    Ok(Json(BatchResponse {
        failed: total_prompts - successful,
        successful,
        total_prompts,
        results,
        time_seconds: round2(started.elapsed().as_secs_f64()),
    }))
}
