//! Client-side rollout loop.
//!
//! A [`RolloutContext`] owns the trajectory of one agent run. Each call to
//! [`RolloutContext::completion`] forwards a request to the serving endpoint
//! and appends the exchanged user message and returned choice to the
//! trajectory; the caller decides when the run terminates and seals the
//! trajectory with its reward.
//!
//! Failures carry the partially built trajectory inside the error value, so
//! the caller (or the aggregator) can inspect or penalize the partial run
//! without any ambient state.

use std::collections::HashMap;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use crate::model::api::{ChatMessage, ChatResponse, Choice, CompletionParams, LlmClient};
use crate::model::Model;
use crate::telemetry::{CompletionReport, MetadataFilter, ReportClient};
use crate::trajectory::types::{FailureRecord, Trajectory};

// ---------------------------------------------------------------------------
// Completion client trait
// ---------------------------------------------------------------------------

/// The subset of the API client a rollout relies on.
///
/// [`LlmClient`] is the production implementation; tests supply scripted
/// clients that replay canned responses.
#[allow(async_fn_in_trait)]
pub trait CompletionClient: Send + Sync {
    /// Send a chat completion request for `model` with the given messages.
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> anyhow::Result<ChatResponse>;
}

impl CompletionClient for LlmClient {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> anyhow::Result<ChatResponse> {
        LlmClient::chat_completion(self, model, messages, params).await
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A failed rollout, carrying the partial trajectory at the point of failure.
#[derive(Debug, Error)]
pub enum RolloutError {
    /// The completion was truncated by the token cap. Retryable: resampling
    /// usually produces a completion that fits.
    #[error("completion truncated by the token limit")]
    ResponseTooLong { partial: Trajectory },

    /// The underlying completion call failed.
    #[error("completion request failed: {source}")]
    Completion {
        partial: Trajectory,
        #[source]
        source: anyhow::Error,
    },

    /// The caller's own rollout logic aborted the run.
    #[error("rollout aborted: {reason}")]
    Aborted { partial: Trajectory, reason: String },
}

impl RolloutError {
    /// The partial trajectory at the time of failure.
    pub fn partial(&self) -> &Trajectory {
        match self {
            Self::ResponseTooLong { partial }
            | Self::Completion { partial, .. }
            | Self::Aborted { partial, .. } => partial,
        }
    }

    /// Consume the error, yielding the partial trajectory.
    pub fn into_partial(self) -> Trajectory {
        match self {
            Self::ResponseTooLong { partial }
            | Self::Completion { partial, .. }
            | Self::Aborted { partial, .. } => partial,
        }
    }

    /// Whether re-running the whole rollout is likely to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResponseTooLong { .. })
    }

    /// Convert into the aggregator's failure record.
    pub fn to_failure_record(&self) -> FailureRecord {
        FailureRecord {
            message: self.to_string(),
            partial: Some(self.partial().clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Rollout context
// ---------------------------------------------------------------------------

/// Drives one agent run against a completion client, accumulating the
/// exchanged messages and choices into a trajectory.
pub struct RolloutContext<C: CompletionClient = LlmClient> {
    client: C,
    model_name: String,
    params: CompletionParams,
    trajectory: Trajectory,
    last_completion_id: Option<String>,
    reporter: Option<ReportClient>,
    report_tags: HashMap<String, String>,
}

impl RolloutContext<LlmClient> {
    /// Create a context for a model descriptor, using its endpoint client.
    pub fn new(model: &Model, params: CompletionParams) -> Self {
        Self::with_client(model.openai_client(), model.inference_name(), params)
    }
}

impl<C: CompletionClient> RolloutContext<C> {
    /// Create a context over an explicit client (tests use scripted clients).
    pub fn with_client(client: C, model_name: &str, params: CompletionParams) -> Self {
        Self {
            client,
            model_name: model_name.to_string(),
            params,
            trajectory: Trajectory::new(),
            last_completion_id: None,
            reporter: None,
            report_tags: HashMap::new(),
        }
    }

    /// Mirror every completion to a reporting client, tagged with `tags`.
    /// Reporting is best-effort and skipped entirely for a disabled client.
    pub fn with_reporter(mut self, reporter: &ReportClient, tags: HashMap<String, String>) -> Self {
        if reporter.enabled() {
            self.reporter = Some(reporter.clone());
            self.report_tags = tags;
        }
        self
    }

    /// Append the system message that opens the conversation.
    pub fn system(&mut self, content: impl Into<String>) {
        self.trajectory.push_message(ChatMessage::system(content));
    }

    /// Append a user message, request a completion over the full message
    /// history, and append the returned choice.
    ///
    /// Errors carry the partial trajectory; a `"length"` finish reason is
    /// surfaced as the retryable [`RolloutError::ResponseTooLong`].
    pub async fn completion(
        &mut self,
        user_content: impl Into<String>,
    ) -> Result<Choice, RolloutError> {
        self.trajectory.push_message(ChatMessage::user(user_content));

        let requested_at = Utc::now();
        let result = self
            .client
            .chat_completion(&self.model_name, &self.trajectory.messages(), &self.params)
            .await;

        if let Some(reporter) = &self.reporter {
            let report = CompletionReport {
                requested_at,
                received_at: Utc::now(),
                request: serde_json::json!({
                    "model": self.model_name,
                    "messages": self.trajectory.messages(),
                    "temperature": self.params.temperature,
                }),
                response: result
                    .as_ref()
                    .ok()
                    .and_then(|r| serde_json::to_value(r).ok()),
                status: if result.is_ok() { "ok" } else { "error" }.to_string(),
                tags: self.report_tags.clone(),
            };
            reporter.report(&report).await;
        }

        let response = result.map_err(|source| RolloutError::Completion {
            partial: self.trajectory.clone(),
            source,
        })?;

        let choice = match response.first_choice() {
            Ok(choice) => choice.clone(),
            Err(source) => {
                return Err(RolloutError::Completion {
                    partial: self.trajectory.clone(),
                    source,
                })
            }
        };

        if choice.hit_length_limit() {
            return Err(RolloutError::ResponseTooLong {
                partial: self.trajectory.clone(),
            });
        }

        self.trajectory.push_choice(choice.clone());
        self.last_completion_id = Some(response.id);
        Ok(choice)
    }

    /// The identifier of the most recent completion, for telemetry updates.
    pub fn last_completion_id(&self) -> Option<&str> {
        self.last_completion_id.as_deref()
    }

    /// Read access to the trajectory built so far.
    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// Record a scalar metric on the trajectory.
    pub fn record_metric(&mut self, name: &str, value: f64) {
        self.trajectory.metrics.insert(name.to_string(), value);
    }

    /// Conclude the rollout: seal the trajectory with its reward.
    pub fn seal(mut self, reward: f64) -> Trajectory {
        self.trajectory.seal(reward);
        self.trajectory
    }

    /// Seal the trajectory and mirror its reward and metrics back to the
    /// reporting client, keyed by the last completion id and narrowed to this
    /// model's entries. Without a reporter (or before any completion
    /// succeeded) this is plain [`RolloutContext::seal`].
    pub async fn seal_and_report(mut self, reward: f64) -> Trajectory {
        self.trajectory.seal(reward);
        if let (Some(reporter), Some(id)) =
            (self.reporter.as_ref(), self.last_completion_id.as_deref())
        {
            let filters = [MetadataFilter::equals("model", &self.model_name)];
            reporter
                .update_metadata(id, &filters, &reward_metadata(&self.trajectory))
                .await;
        }
        self.trajectory
    }

    /// Abort the rollout; the partial trajectory rides in the error.
    pub fn abort(self, reason: impl Into<String>) -> RolloutError {
        RolloutError::Aborted {
            partial: self.trajectory,
            reason: reason.into(),
        }
    }
}

/// Metadata mirrored back after sealing: the reward plus every recorded
/// metric, stringified for the reporting service.
fn reward_metadata(trajectory: &Trajectory) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    if let Some(reward) = trajectory.reward() {
        metadata.insert("reward".to_string(), reward.to_string());
    }
    for (name, value) in &trajectory.metrics {
        metadata.insert(name.clone(), value.to_string());
    }
    metadata
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Re-run a rollout up to `max_retries` extra times on retryable failures.
///
/// Non-retryable failures are returned immediately. The whole rollout is
/// re-executed from scratch on each attempt; partial trajectories from failed
/// attempts are discarded with the error that carried them.
pub async fn retry<F, Fut, T>(max_retries: usize, mut rollout: F) -> Result<T, RolloutError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RolloutError>>,
{
    let mut attempt = 0usize;
    loop {
        match rollout().await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() && attempt < max_retries => {
                attempt += 1;
                warn!(attempt, max_retries, error = %err, "retrying rollout");
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::api::Usage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays a fixed sequence of responses, one per call.
    struct ScriptedClient {
        responses: Mutex<Vec<anyhow::Result<ChatResponse>>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<anyhow::Result<ChatResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    impl CompletionClient for ScriptedClient {
        async fn chat_completion(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _params: &CompletionParams,
        ) -> anyhow::Result<ChatResponse> {
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn response(content: &str, finish_reason: &str) -> ChatResponse {
        ChatResponse {
            id: format!("chatcmpl-{content}"),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::assistant(content),
                finish_reason: Some(finish_reason.into()),
                logprobs: None,
            }],
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 4,
                total_tokens: 14,
            },
        }
    }

    #[tokio::test]
    async fn completion_appends_exchange() {
        let client = ScriptedClient::new(vec![Ok(response("<move>A1</move>", "stop"))]);
        let mut ctx = RolloutContext::with_client(client, "agent-001", CompletionParams::default());
        ctx.system("play tic-tac-toe");

        let choice = ctx.completion("| | | |").await.unwrap();
        assert_eq!(choice.message.content, "<move>A1</move>");
        assert_eq!(ctx.trajectory().messages_and_choices.len(), 3);
        assert!(ctx.trajectory().has_valid_turn_order());
        assert_eq!(ctx.last_completion_id(), Some("chatcmpl-<move>A1</move>"));
    }

    #[tokio::test]
    async fn length_finish_reason_is_retryable() {
        let client = ScriptedClient::new(vec![Ok(response("truncat", "length"))]);
        let mut ctx = RolloutContext::with_client(client, "agent-001", CompletionParams::default());
        ctx.system("sys");

        let err = ctx.completion("board").await.unwrap_err();
        assert!(err.is_retryable());
        // The partial holds the system + user message but no choice.
        assert_eq!(err.partial().messages_and_choices.len(), 2);
    }

    #[tokio::test]
    async fn completion_failure_carries_partial() {
        let client = ScriptedClient::new(vec![Err(anyhow::anyhow!("connection refused"))]);
        let mut ctx = RolloutContext::with_client(client, "agent-001", CompletionParams::default());
        ctx.system("sys");

        let err = ctx.completion("board").await.unwrap_err();
        assert!(!err.is_retryable());
        let record = err.to_failure_record();
        assert!(record.message.contains("connection refused"));
        assert_eq!(record.partial.unwrap().messages_and_choices.len(), 2);
    }

    #[tokio::test]
    async fn seal_concludes_rollout() {
        let client = ScriptedClient::new(vec![Ok(response("<move>B2</move>", "stop"))]);
        let mut ctx = RolloutContext::with_client(client, "agent-001", CompletionParams::default());
        ctx.system("sys");
        ctx.completion("board").await.unwrap();
        ctx.record_metric("num_moves", 1.0);

        let trajectory = ctx.seal(1.0);
        assert_eq!(trajectory.reward(), Some(1.0));
        assert_eq!(trajectory.metrics["num_moves"], 1.0);
    }

    #[tokio::test]
    async fn seal_and_report_seals_without_reporter() {
        let client = ScriptedClient::new(vec![Ok(response("<move>C3</move>", "stop"))]);
        let mut ctx = RolloutContext::with_client(client, "agent-001", CompletionParams::default());
        ctx.system("sys");
        ctx.completion("board").await.unwrap();
        ctx.record_metric("win", 1.0);

        let trajectory = ctx.seal_and_report(1.0).await;
        assert_eq!(trajectory.reward(), Some(1.0));
    }

    #[test]
    fn reward_metadata_includes_reward_and_metrics() {
        let mut trajectory = Trajectory::new();
        trajectory.metrics.insert("win".into(), 1.0);
        trajectory.metrics.insert("num_moves".into(), 3.0);
        trajectory.seal(1.0);

        let metadata = reward_metadata(&trajectory);
        assert_eq!(metadata["reward"], "1");
        assert_eq!(metadata["win"], "1");
        assert_eq!(metadata["num_moves"], "3");
    }

    #[tokio::test]
    async fn retry_reruns_retryable_failures() {
        let attempts = AtomicUsize::new(0);
        let result = retry(2, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RolloutError::ResponseTooLong {
                        partial: Trajectory::new(),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_passes_through_non_retryable() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), _> = retry(5, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(RolloutError::Aborted {
                    partial: Trajectory::new(),
                    reason: "invalid state".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_exhaustion_returns_last_error() {
        let result: Result<(), _> = retry(1, || async {
            Err(RolloutError::ResponseTooLong {
                partial: Trajectory::new(),
            })
        })
        .await;
        assert!(matches!(
            result.unwrap_err(),
            RolloutError::ResponseTooLong { .. }
        ));
    }
}
