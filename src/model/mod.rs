//! Model descriptors and the OpenAI-compatible API client.
//!
//! A [`Model`] names an inference endpoint; swapping a third-party hosted
//! model for a self-hosted trained one is a change of endpoint and identifier
//! only. A [`TrainableModel`] additionally names the frozen base model its
//! LoRA adapters are trained against.

pub mod api;

pub use api::{ChatMessage, ChatResponse, Choice, CompletionParams, LlmClient};

use serde::{Deserialize, Serialize};

/// A named model served by an OpenAI-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    /// Name of the model within its project (e.g. `"agent-001"`).
    pub name: String,
    /// Project the model belongs to (groups checkpoints and logs).
    pub project: String,
    /// Base URL of the inference API.
    pub inference_api_base: String,
    /// API key for the inference endpoint.
    pub inference_api_key: String,
    /// Identifier sent in completion requests when it differs from `name`
    /// (e.g. a provider-assigned deployment id).
    pub inference_model_id: Option<String>,
}

impl Model {
    /// Create a model descriptor for a hosted endpoint.
    pub fn new(name: &str, project: &str, api_base: &str, api_key: &str) -> Self {
        Self {
            name: name.to_string(),
            project: project.to_string(),
            inference_api_base: api_base.to_string(),
            inference_api_key: api_key.to_string(),
            inference_model_id: None,
        }
    }

    /// The identifier to use in completion requests.
    pub fn inference_name(&self) -> &str {
        self.inference_model_id.as_deref().unwrap_or(&self.name)
    }

    /// Build an API client for this model's endpoint.
    pub fn openai_client(&self) -> LlmClient {
        LlmClient::new(&self.inference_api_base, &self.inference_api_key)
    }
}

/// A model whose LoRA adapters are trained by the training server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainableModel {
    /// Name of the model within its project.
    pub name: String,
    /// Project the model belongs to.
    pub project: String,
    /// The frozen base model the adapters are layered onto.
    pub base_model: String,
}

impl TrainableModel {
    /// Create a trainable model descriptor.
    pub fn new(name: &str, project: &str, base_model: &str) -> Self {
        Self {
            name: name.to_string(),
            project: project.to_string(),
            base_model: base_model.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inference_name_defaults_to_name() {
        let model = Model::new("agent-001", "tic-tac-toe", "http://localhost:8000/v1", "");
        assert_eq!(model.inference_name(), "agent-001");
    }

    #[test]
    fn test_inference_name_override() {
        let mut model = Model::new("agent-001", "tic-tac-toe", "http://localhost:8000/v1", "");
        model.inference_model_id = Some("deploy/agent-001-step-42".into());
        assert_eq!(model.inference_name(), "deploy/agent-001-step-42");
    }

    #[test]
    fn test_trainable_model_roundtrip() {
        let model = TrainableModel::new(
            "agent-001",
            "tic-tac-toe",
            "meta-llama/Meta-Llama-3.1-8B-Instruct",
        );
        let json = serde_json::to_string(&model).unwrap();
        let parsed: TrainableModel = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.base_model, model.base_model);
    }
}
