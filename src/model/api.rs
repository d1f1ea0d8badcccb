//! OpenAI-compatible chat completion client.
//!
//! Provides the typed request/response structures exchanged with the serving
//! endpoint. Rollouts call [`LlmClient::chat_completion`] and append the
//! returned choice to their trajectory; when training needs importance ratios,
//! completions are requested with per-token log-probabilities enabled.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author: `"system"`, `"user"`, or `"assistant"`.
    pub role: String,
    /// The textual content of the message.
    pub content: String,
}

impl ChatMessage {
    /// Convenience constructor for a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Convenience constructor for a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Convenience constructor for an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Token-level log-probability information returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLogProb {
    /// The token string.
    pub token: String,
    /// The log probability of this token.
    pub logprob: f64,
}

/// Log-probability information attached to a choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceLogProbs {
    /// Per-token log-probability entries.
    pub content: Option<Vec<TokenLogProb>>,
}

/// A single completion choice returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Zero-based index of this choice within the response.
    pub index: usize,
    /// The generated message.
    pub message: ChatMessage,
    /// The reason the model stopped generating (e.g. `"stop"`, `"length"`).
    pub finish_reason: Option<String>,
    /// Optional log-probability information (present when requested).
    #[serde(default)]
    pub logprobs: Option<ChoiceLogProbs>,
}

impl Choice {
    /// Whether generation was cut off by the completion-token cap.
    ///
    /// Rollouts treat this as retryable: a truncated completion is not a
    /// usable agent action, but resampling usually produces one that fits.
    pub fn hit_length_limit(&self) -> bool {
        self.finish_reason.as_deref() == Some("length")
    }

    /// Sum of the per-token log probabilities, if logprobs were requested.
    pub fn total_log_prob(&self) -> Option<f64> {
        self.logprobs
            .as_ref()
            .and_then(|lp| lp.content.as_ref())
            .map(|tokens| tokens.iter().map(|t| t.logprob).sum())
    }

    /// Number of generated tokens, if logprobs were requested.
    pub fn completion_token_count(&self) -> Option<usize> {
        self.logprobs
            .as_ref()
            .and_then(|lp| lp.content.as_ref())
            .map(|tokens| tokens.len())
    }
}

/// Token usage statistics for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: usize,
    /// Tokens generated in the completion.
    pub completion_tokens: usize,
    /// Total tokens (prompt + completion).
    pub total_tokens: usize,
}

/// A chat completion response from the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Unique identifier for this completion.
    pub id: String,
    /// The list of generated choices.
    pub choices: Vec<Choice>,
    /// Token usage statistics.
    pub usage: Usage,
}

impl ChatResponse {
    /// The first choice, which is the one rollouts act on.
    pub fn first_choice(&self) -> Result<&Choice> {
        self.choices
            .first()
            .context("completion response contained no choices")
    }
}

/// Sampling parameters for a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionParams {
    /// Sampling temperature.
    pub temperature: f64,
    /// Cap on generated tokens.
    pub max_completion_tokens: usize,
    /// Whether to request per-token log probabilities.
    pub logprobs: bool,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_completion_tokens: 128,
            logprobs: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for an OpenAI-compatible chat completions API.
///
/// Wraps [`reqwest::Client`] with the base URL and API key needed to call
/// `POST {base_url}/chat/completions`.
#[derive(Debug, Clone)]
pub struct LlmClient {
    api_base: String,
    api_key: String,
    http: reqwest::Client,
}

impl LlmClient {
    /// Create a new client pointing at `base_url` (e.g. `"https://api.openai.com/v1"`).
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_base: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        }
    }

    /// The configured API base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Send a chat completion request and return the parsed response.
    pub async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        debug!(
            model,
            temperature = params.temperature,
            max_completion_tokens = params.max_completion_tokens,
            logprobs = params.logprobs,
            "sending chat completion request"
        );

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": params.temperature,
            "max_completion_tokens": params.max_completion_tokens,
        });
        if params.logprobs {
            body["logprobs"] = serde_json::Value::Bool(true);
        }

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to send chat completion request")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("chat completion API returned {status}: {text}");
        }

        let chat_response: ChatResponse = resp
            .json()
            .await
            .context("failed to parse chat completion response")?;

        info!(
            model,
            id = %chat_response.id,
            prompt_tokens = chat_response.usage.prompt_tokens,
            completion_tokens = chat_response.usage.completion_tokens,
            "chat completion succeeded"
        );

        Ok(chat_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choice_with(finish_reason: &str, logprobs: Option<ChoiceLogProbs>) -> Choice {
        Choice {
            index: 0,
            message: ChatMessage::assistant("<move>A1</move>"),
            finish_reason: Some(finish_reason.into()),
            logprobs,
        }
    }

    #[test]
    fn test_chat_message_constructors() {
        let sys = ChatMessage::system("You are a tic-tac-toe player.");
        assert_eq!(sys.role, "system");

        let usr = ChatMessage::user("| |x| |");
        assert_eq!(usr.role, "user");

        let asst = ChatMessage::assistant("<move>B2</move>");
        assert_eq!(asst.role, "assistant");
        assert_eq!(asst.content, "<move>B2</move>");
    }

    #[test]
    fn test_hit_length_limit() {
        assert!(choice_with("length", None).hit_length_limit());
        assert!(!choice_with("stop", None).hit_length_limit());
    }

    #[test]
    fn test_total_log_prob_absent() {
        assert!(choice_with("stop", None).total_log_prob().is_none());
    }

    #[test]
    fn test_total_log_prob_present() {
        let choice = choice_with(
            "stop",
            Some(ChoiceLogProbs {
                content: Some(vec![
                    TokenLogProb {
                        token: "<move>".into(),
                        logprob: -0.5,
                    },
                    TokenLogProb {
                        token: "A1".into(),
                        logprob: -1.2,
                    },
                ]),
            }),
        );
        let total = choice.total_log_prob().unwrap();
        assert!((total - (-1.7)).abs() < 1e-9);
        assert_eq!(choice.completion_token_count(), Some(2));
    }

    #[test]
    fn test_chat_response_serialization_roundtrip() {
        let resp = ChatResponse {
            id: "chatcmpl-abc".into(),
            choices: vec![choice_with("stop", None)],
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
        };
        let json = serde_json::to_string(&resp).unwrap();
        let parsed: ChatResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, resp.id);
        assert_eq!(parsed.choices.len(), 1);
        assert_eq!(parsed.usage.total_tokens, 15);
    }

    #[test]
    fn test_first_choice_empty() {
        let resp = ChatResponse {
            id: "chatcmpl-empty".into(),
            choices: Vec::new(),
            usage: Usage {
                prompt_tokens: 1,
                completion_tokens: 0,
                total_tokens: 1,
            },
        };
        assert!(resp.first_choice().is_err());
    }
}
