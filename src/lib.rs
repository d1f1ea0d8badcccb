//! ART: Agent Reinforcement Trainer
//!
//! Run agentic LLM workflows against an OpenAI-compatible endpoint while a
//! training server performs GRPO fine-tuning over LoRA adapters in the
//! background. Rollouts accumulate message/choice exchanges into trajectories,
//! sealed trajectories are aggregated into groups, and each submitted batch
//! drives one blocking training step followed by an atomic checkpoint swap.

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod model;
pub mod rollout;
pub mod server;
pub mod telemetry;
pub mod tictactoe;
pub mod training;
pub mod trajectory;
