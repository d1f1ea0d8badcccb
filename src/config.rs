use serde::{Deserialize, Serialize};

/// Complete configuration for the trainer and its serving endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtConfig {
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub rollout: RolloutConfig,
    pub server: ServerConfig,
    pub checkpoints: CheckpointConfig,
    pub telemetry: TelemetryConfig,
}

/// Model endpoints and identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL for the OpenAI-compatible inference API.
    pub inference_api_base: String,
    /// API key for the inference endpoint.
    pub inference_api_key: String,
    /// Model identifier used in completion requests.
    pub inference_model_id: String,
    /// The frozen base model the LoRA adapters are layered onto.
    pub base_model: String,
}

/// GRPO training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Learning rate forwarded to the policy tuner (default: 1e-5).
    pub learning_rate: f64,
    /// PPO clipping epsilon (default: 0.2).
    pub clip_epsilon: f64,
    /// KL divergence coefficient beta (default: 0.01).
    pub kl_coeff: f64,
    /// Number of rollouts per trajectory group (default: 48).
    pub group_size: usize,
    /// Total training steps for a run (default: 42).
    pub num_steps: usize,
}

/// Client-side rollout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Sampling temperature for agent completions (default: 1.0).
    pub temperature: f64,
    /// Per-completion token cap (default: 128).
    pub max_completion_tokens: usize,
    /// How many times a retryable rollout failure is retried (default: 3).
    pub max_retries: usize,
    /// Fraction of failed rollouts a group tolerates before the gather
    /// aborts (default: 0.5).
    pub max_failure_fraction: f64,
}

/// Training server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host for the HTTP control surface.
    pub host: String,
    /// Bind port (default: 2218).
    pub port: u16,
    /// External command (program plus leading arguments) invoked to apply
    /// weight updates. When unset, updates are recorded to the checkpoint
    /// directory without touching weights.
    pub tuner_command: Option<Vec<String>>,
}

/// Checkpoint store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Root directory holding one zero-padded subdirectory per step.
    pub root: String,
    /// Metric name used to keep the best checkpoint during deletion, if any.
    pub keep_best_benchmark: Option<String>,
    /// Exponential smoothing factor applied to the benchmark metric when
    /// ranking checkpoints (1.0 = no smoothing).
    pub benchmark_smoothing: f64,
}

/// Best-effort request/response reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Base URL of the reporting service.
    pub api_base: String,
    /// API key; reporting is disabled when empty.
    pub api_key: String,
}

impl Default for ArtConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                inference_api_base: "http://localhost:8000/v1".into(),
                inference_api_key: String::new(),
                inference_model_id: "agent-001".into(),
                base_model: "meta-llama/Meta-Llama-3.1-8B-Instruct".into(),
            },
            train: TrainConfig {
                learning_rate: 1e-5,
                clip_epsilon: 0.2,
                kl_coeff: 0.01,
                group_size: 48,
                num_steps: 42,
            },
            rollout: RolloutConfig {
                temperature: 1.0,
                max_completion_tokens: 128,
                max_retries: 3,
                max_failure_fraction: 0.5,
            },
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: 2218,
                tuner_command: None,
            },
            checkpoints: CheckpointConfig {
                root: ".art/checkpoints".into(),
                keep_best_benchmark: None,
                benchmark_smoothing: 1.0,
            },
            telemetry: TelemetryConfig {
                api_base: "https://api.openpipe.ai/api/v1".into(),
                api_key: String::new(),
            },
        }
    }
}
