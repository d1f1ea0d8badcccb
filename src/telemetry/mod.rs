//! Best-effort completion reporting.
//!
//! Rollouts can mirror each chat completion (request, response, timing,
//! tags) to an external reporting service for later inspection. Reporting
//! must never affect the rollout: failures are logged and swallowed, and the
//! client is a no-op when no API key is configured.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::TelemetryConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One completed chat request, ready to report.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionReport {
    /// When the request was sent.
    pub requested_at: DateTime<Utc>,
    /// When the response arrived.
    pub received_at: DateTime<Utc>,
    /// The request payload as sent.
    pub request: serde_json::Value,
    /// The response payload as received, if any.
    pub response: Option<serde_json::Value>,
    /// `"ok"` or `"error"`.
    pub status: String,
    /// Free-form tags (model name, step, scenario id).
    pub tags: HashMap<String, String>,
}

/// Equality predicate narrowing which reported entries a metadata update
/// applies to (e.g. `model = "agent-001"`).
#[derive(Debug, Clone, Serialize)]
pub struct MetadataFilter {
    pub field: String,
    pub value: String,
}

impl MetadataFilter {
    pub fn equals(field: &str, value: &str) -> Self {
        Self {
            field: field.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct UpdateMetadataRequest<'a> {
    completion_id: &'a str,
    filters: &'a [MetadataFilter],
    metadata: &'a HashMap<String, String>,
}

/// Fire-and-forget client for the reporting service.
#[derive(Debug, Clone)]
pub struct ReportClient {
    api_base: String,
    api_key: String,
    http: reqwest::Client,
}

impl ReportClient {
    pub fn new(config: &TelemetryConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http,
        }
    }

    /// Whether reporting is configured at all.
    pub fn enabled(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Report one completion. Never fails; a rejected or unreachable
    /// reporting service only produces a warning.
    pub async fn report(&self, report: &CompletionReport) {
        if !self.enabled() {
            return;
        }
        let result = self
            .http
            .post(format!("{}/report", self.api_base))
            .bearer_auth(&self.api_key)
            .json(report)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(status = %report.status, "completion reported");
            }
            Ok(response) => {
                warn!(status = %response.status(), "completion report rejected");
            }
            Err(e) => {
                warn!(error = %e, "completion report failed");
            }
        }
    }

    /// Attach metadata to a previously reported completion, keyed by the
    /// provider's completion id and narrowed by `filters`. Best-effort like
    /// `report`.
    pub async fn update_metadata(
        &self,
        completion_id: &str,
        filters: &[MetadataFilter],
        metadata: &HashMap<String, String>,
    ) {
        if !self.enabled() {
            return;
        }
        let request = UpdateMetadataRequest {
            completion_id,
            filters,
            metadata,
        };
        let result = self
            .http
            .post(format!("{}/report/update-metadata", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(completion_id, "completion metadata updated");
            }
            Ok(response) => {
                warn!(status = %response.status(), "metadata update rejected");
            }
            Err(e) => {
                warn!(error = %e, "metadata update failed");
            }
        }
    }
}
