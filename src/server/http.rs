//! HTTP control surface for the training server.
//!
//! Mirrors the client in `backend`: models register themselves, push
//! trajectory batches for blocking training steps, append trajectory logs,
//! and trigger checkpoint retention. Serving state is observable through
//! `/_status`.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ServerConfig;
use crate::model::TrainableModel;
use crate::trajectory::TrajectoryGroup;

use super::service::{PolicyTuner, TrainingService};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub model: TrainableModel,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StepResponse {
    pub step: u64,
}

#[derive(Debug, Deserialize)]
pub struct ModelQuery {
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrainRequest {
    pub model: String,
    pub groups: Vec<TrajectoryGroup>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogRequest {
    pub model: String,
    pub groups: Vec<TrajectoryGroup>,
    #[serde(default = "default_split")]
    pub split: String,
}

fn default_split() -> String {
    "train".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogResponse {
    pub written: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteCheckpointsResponse {
    pub deleted: Vec<u64>,
}

/// Error body returned for any failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.to_string().contains("not registered") {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let body = ErrorBody {
            error: format!("{:#}", self.0),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// Build the control-surface router over a shared service.
pub fn router<T>(service: Arc<TrainingService<T>>) -> Router
where
    T: PolicyTuner + Send + Sync + 'static,
{
    Router::new()
        .route("/healthz", get(healthz))
        .route("/register", post(register::<T>))
        .route("/_get_step", get(get_step::<T>))
        .route("/_status", get(status::<T>))
        .route("/_train_model", post(train_model::<T>))
        .route("/_log", post(log_trajectories::<T>))
        .route("/_delete_checkpoints", post(delete_checkpoints::<T>))
        .with_state(service)
}

/// Bind and serve the control surface until the process exits.
pub async fn serve<T>(config: &ServerConfig, service: Arc<TrainingService<T>>) -> Result<()>
where
    T: PolicyTuner + Send + Sync + 'static,
{
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "training server listening");
    axum::serve(listener, router(service))
        .await
        .context("training server exited")
}

async fn healthz() -> &'static str {
    "ok"
}

async fn register<T: PolicyTuner + Send + Sync>(
    State(service): State<Arc<TrainingService<T>>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<StepResponse>, ApiError> {
    let step = service.register(req.model).await?;
    Ok(Json(StepResponse { step }))
}

async fn get_step<T: PolicyTuner + Send + Sync>(
    State(service): State<Arc<TrainingService<T>>>,
    Query(query): Query<ModelQuery>,
) -> Result<Json<StepResponse>, ApiError> {
    let step = service.get_step(&query.model)?;
    Ok(Json(StepResponse { step }))
}

async fn status<T: PolicyTuner + Send + Sync>(
    State(service): State<Arc<TrainingService<T>>>,
    Query(query): Query<ModelQuery>,
) -> Result<Response, ApiError> {
    let status = service.status(&query.model)?;
    Ok(Json(status).into_response())
}

async fn train_model<T: PolicyTuner + Send + Sync>(
    State(service): State<Arc<TrainingService<T>>>,
    Json(req): Json<TrainRequest>,
) -> Result<Response, ApiError> {
    let result = service.train(&req.model, &req.groups).await?;
    Ok(Json(result).into_response())
}

async fn log_trajectories<T: PolicyTuner + Send + Sync>(
    State(service): State<Arc<TrainingService<T>>>,
    Json(req): Json<LogRequest>,
) -> Result<Json<LogResponse>, ApiError> {
    let written = service.log(&req.model, &req.groups, &req.split)?;
    Ok(Json(LogResponse { written }))
}

async fn delete_checkpoints<T: PolicyTuner + Send + Sync>(
    State(service): State<Arc<TrainingService<T>>>,
    Query(query): Query<ModelQuery>,
) -> Result<Json<DeleteCheckpointsResponse>, ApiError> {
    let deleted = service.delete_checkpoints(&query.model)?;
    Ok(Json(DeleteCheckpointsResponse { deleted }))
}
