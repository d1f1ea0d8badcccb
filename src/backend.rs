//! Client for the training server's control surface.
//!
//! Rollout drivers run against the inference endpoint directly; this client
//! covers the training side: registering a model, pushing trajectory batches
//! for blocking training steps, appending trajectory logs, and checkpoint
//! retention.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::model::TrainableModel;
use crate::server::http::{
    DeleteCheckpointsResponse, ErrorBody, LogRequest, LogResponse, RegisterRequest, StepResponse,
    TrainRequest,
};
use crate::server::{ModelStatus, TrainResult};
use crate::trajectory::TrajectoryGroup;

/// A training step can take minutes; keep the client patient.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// HTTP client for a running training server.
#[derive(Debug, Clone)]
pub struct BackendClient {
    api_base: String,
    http: reqwest::Client,
}

impl BackendClient {
    /// Create a client for the server at `api_base`
    /// (e.g. `http://localhost:2218`).
    pub fn new(api_base: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Register a model with the server; returns its current step.
    pub async fn register(&self, model: &TrainableModel) -> Result<u64> {
        let request = RegisterRequest {
            model: model.clone(),
        };
        let response = self
            .http
            .post(format!("{}/register", self.api_base))
            .json(&request)
            .send()
            .await
            .context("register request failed")?;
        let step: StepResponse = parse(response).await?;
        debug!(model = %model.name, step = step.step, "model registered");
        Ok(step.step)
    }

    /// The model's current training step.
    pub async fn get_step(&self, model: &str) -> Result<u64> {
        let response = self
            .http
            .get(format!("{}/_get_step", self.api_base))
            .query(&[("model", model)])
            .send()
            .await
            .context("get_step request failed")?;
        let step: StepResponse = parse(response).await?;
        Ok(step.step)
    }

    /// Observable serving state for the model.
    pub async fn status(&self, model: &str) -> Result<ModelStatus> {
        let response = self
            .http
            .get(format!("{}/_status", self.api_base))
            .query(&[("model", model)])
            .send()
            .await
            .context("status request failed")?;
        parse(response).await
    }

    /// Run one blocking training step over a batch of trajectory groups.
    /// Resolves when the new checkpoint is serving.
    pub async fn train(&self, model: &str, groups: &[TrajectoryGroup]) -> Result<TrainResult> {
        let request = TrainRequest {
            model: model.to_string(),
            groups: groups.to_vec(),
        };
        let response = self
            .http
            .post(format!("{}/_train_model", self.api_base))
            .json(&request)
            .send()
            .await
            .context("train request failed")?;
        let result: TrainResult = parse(response).await?;
        debug!(model, step = result.step, "training step finished");
        Ok(result)
    }

    /// Append trajectory groups to the model's log for a split.
    pub async fn log(
        &self,
        model: &str,
        groups: &[TrajectoryGroup],
        split: &str,
    ) -> Result<usize> {
        let request = LogRequest {
            model: model.to_string(),
            groups: groups.to_vec(),
            split: split.to_string(),
        };
        let response = self
            .http
            .post(format!("{}/_log", self.api_base))
            .json(&request)
            .send()
            .await
            .context("log request failed")?;
        let logged: LogResponse = parse(response).await?;
        Ok(logged.written)
    }

    /// Delete superseded checkpoints; returns the deleted versions.
    pub async fn delete_checkpoints(&self, model: &str) -> Result<Vec<u64>> {
        let response = self
            .http
            .post(format!("{}/_delete_checkpoints", self.api_base))
            .query(&[("model", model)])
            .send()
            .await
            .context("delete_checkpoints request failed")?;
        let deleted: DeleteCheckpointsResponse = parse(response).await?;
        Ok(deleted.deleted)
    }
}

/// Decode a success body, or surface the server's error message.
async fn parse<D: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<D> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.context("malformed server response");
    }
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    bail!("training server error ({status}): {message}")
}
