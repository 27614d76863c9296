#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use leafscan_rust_node::config::Config;
use leafscan_rust_node::metrics;
use leafscan_rust_node::service::{DiagnosisOutcome, FailureResponse};
use leafscan_rust_node::{CallerIdentity, ImageInput, InvalidInput, PipelineError, PredictionService};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

type AppState = Arc<PredictionService>;

/// Multipart field carrying the leaf photo
const IMAGE_FIELD: &str = "image";

/// Health check endpoint
async fn health_handler(State(service): State<AppState>) -> impl IntoResponse {
    Json(service.health().await)
}

/// Prometheus metrics endpoint
async fn metrics_handler() -> String {
    metrics::export_metrics()
}

async fn classes_handler(State(service): State<AppState>) -> impl IntoResponse {
    let classes: Vec<serde_json::Value> = service
        .classes()
        .iter()
        .map(|entry| {
            let decoded = leafscan_rust_node::decode(&entry.raw_class_name);
            serde_json::json!({
                "classId": entry.class_id,
                "className": entry.raw_class_name,
                "plant": decoded.plant_name,
                "disease": decoded.disease_name,
                "isHealthy": decoded.is_healthy,
            })
        })
        .collect();
    Json(serde_json::json!({ "success": true, "classes": classes }))
}

async fn model_info_handler(State(service): State<AppState>) -> axum::response::Response {
    match service.model_info().await {
        Ok(info) => Json(serde_json::json!({ "success": true, "model": info })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(FailureResponse::from(&e)),
        )
            .into_response(),
    }
}

/// Client address, preferring the first X-Forwarded-For hop
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

/// Token verification happens upstream; a bearer token here means the
/// caller was already authenticated.
fn is_authenticated(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("Bearer ") && v.len() > "Bearer ".len())
        .unwrap_or(false)
}

async fn read_image(mut multipart: Multipart) -> Result<ImageInput, InvalidInput> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| InvalidInput::Unreadable(e.to_string()))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| InvalidInput::Unreadable(e.to_string()))?;
        return Ok(ImageInput::from_bytes(bytes, filename, mime_type));
    }
    Err(InvalidInput::Empty)
}

async fn predict_handler(
    State(service): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    multipart: Multipart,
) -> axum::response::Response {
    let caller = CallerIdentity {
        ip: client_ip(&headers, peer),
        is_authenticated: is_authenticated(&headers),
    };

    let input = match read_image(multipart).await {
        Ok(input) => input,
        Err(e) => {
            let e = PipelineError::from(e);
            return (StatusCode::BAD_REQUEST, Json(FailureResponse::from(&e))).into_response();
        }
    };

    let outcome = service.diagnose(input, &caller).await;
    let status = match &outcome {
        DiagnosisOutcome::Diagnosed(_) => StatusCode::OK,
        DiagnosisOutcome::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        DiagnosisOutcome::Failed(f) => match f.error_kind {
            "InvalidInput" => StatusCode::BAD_REQUEST,
            "NoBackendAvailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    };
    (status, Json(outcome)).into_response()
}

fn router(service: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/predict", post(predict_handler))
        .route("/api/model-info", get(model_info_handler))
        .route("/api/classes", get(classes_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        // Headroom for multipart framing; the pipeline enforces the real limit
        .layer(DefaultBodyLimit::max(max_upload_bytes + 64 * 1024))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting plant disease prediction node...");

    metrics::init_metrics();
    tracing::info!("Metrics system initialized");

    let config = Config::load()?;
    let max_upload_bytes = config.upload_config.max_bytes;
    let addr = format!("{}:{}", config.api_host, config.api_port);

    let service = Arc::new(PredictionService::new(config));
    match service.init().await {
        Ok(kind) => tracing::info!("Inference backend bound: {}", kind),
        Err(e) => tracing::error!("Starting without a usable inference backend: {}", e),
    }

    // Periodically drop lapsed guest quota records
    let pruner = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(pruner.prune_interval());
        interval.tick().await; // Skip first immediate tick

        loop {
            interval.tick().await;
            let removed = pruner.prune_quota();
            tracing::debug!("Quota prune removed {} records", removed);
        }
    });

    let app = router(service.clone(), max_upload_bytes);

    tracing::info!("Prediction API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    service.shutdown();
    Ok(())
}
