//! Core trajectory data types.
//!
//! A [`Trajectory`] records one agent run as the ordered sequence of chat
//! messages the caller supplied and the completion choices the model produced,
//! plus a scalar reward sealed at rollout end and an open metric bag. Sealed
//! trajectories are aggregated into immutable [`TrajectoryGroup`]s, the unit
//! the training server consumes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::api::{ChatMessage, Choice};

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// A scalar metadata value attached to trajectories and groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Null,
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

// ---------------------------------------------------------------------------
// Message-or-choice entries
// ---------------------------------------------------------------------------

/// One entry in a trajectory: either a structured chat message supplied by
/// the caller, or a completion choice produced by the model.
///
/// Keeping the raw [`Choice`] (rather than flattening it to a message at
/// append time) preserves finish reasons and token log-probabilities for the
/// GRPO importance ratio.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageOrChoice {
    Choice(Choice),
    Message(ChatMessage),
}

impl MessageOrChoice {
    /// The chat message view of this entry (a choice reads as its generated
    /// assistant message).
    pub fn as_message(&self) -> &ChatMessage {
        match self {
            Self::Message(m) => m,
            Self::Choice(c) => &c.message,
        }
    }

    /// The role of this entry's message.
    pub fn role(&self) -> &str {
        &self.as_message().role
    }
}

// ---------------------------------------------------------------------------
// Trajectory
// ---------------------------------------------------------------------------

/// The recorded message/choice sequence of one agent run plus its reward.
///
/// Owned exclusively by the rollout that produces it until it is handed to
/// the aggregator. The reward is sealed exactly once at rollout end; sealing
/// again is a no-op, so a sealed trajectory's reward never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    /// Unique identifier (UUID v4).
    pub id: String,
    /// Ordered message/choice entries.
    pub messages_and_choices: Vec<MessageOrChoice>,
    /// The sealed reward, or `None` while the rollout is still running.
    reward: Option<f64>,
    /// Open bag of scalar metrics (e.g. `"win"`, `"num_moves"`).
    pub metrics: HashMap<String, f64>,
    /// Open bag of metadata tags.
    pub metadata: HashMap<String, MetadataValue>,
}

impl Trajectory {
    /// Create an empty trajectory for a new rollout.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages_and_choices: Vec::new(),
            reward: None,
            metrics: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Append a caller-supplied chat message.
    pub fn push_message(&mut self, message: ChatMessage) {
        self.messages_and_choices
            .push(MessageOrChoice::Message(message));
    }

    /// Append a model-produced completion choice.
    pub fn push_choice(&mut self, choice: Choice) {
        self.messages_and_choices
            .push(MessageOrChoice::Choice(choice));
    }

    /// Flatten the entries into plain chat messages (choices become their
    /// assistant messages), e.g. for resubmitting as a completion request.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages_and_choices
            .iter()
            .map(|entry| entry.as_message().clone())
            .collect()
    }

    /// Seal the trajectory with its final reward.
    ///
    /// The first call sets the reward; later calls are ignored and return
    /// `false`. Reward assignment is idempotent once set.
    pub fn seal(&mut self, reward: f64) -> bool {
        if self.reward.is_some() {
            return false;
        }
        self.reward = Some(reward);
        true
    }

    /// The sealed reward, if the rollout has concluded.
    pub fn reward(&self) -> Option<f64> {
        self.reward
    }

    /// Whether the trajectory has been sealed.
    pub fn is_sealed(&self) -> bool {
        self.reward.is_some()
    }

    /// The choices produced by the model, in order.
    pub fn choices(&self) -> impl Iterator<Item = &Choice> {
        self.messages_and_choices.iter().filter_map(|e| match e {
            MessageOrChoice::Choice(c) => Some(c),
            MessageOrChoice::Message(_) => None,
        })
    }

    /// Sum of choice log-probabilities: `log P(completions | prompts)` under
    /// the sampling policy. `None` when no choice carried logprobs.
    pub fn total_log_prob(&self) -> Option<f64> {
        let mut total = 0.0;
        let mut any = false;
        for choice in self.choices() {
            if let Some(lp) = choice.total_log_prob() {
                total += lp;
                any = true;
            }
        }
        any.then_some(total)
    }

    /// Check that the message sequence starts with a system message and then
    /// strictly alternates user/assistant content.
    pub fn has_valid_turn_order(&self) -> bool {
        let mut entries = self.messages_and_choices.iter();
        match entries.next() {
            Some(first) if first.role() == "system" => {}
            _ => return false,
        }
        let mut expect_user = true;
        for entry in entries {
            let expected = if expect_user { "user" } else { "assistant" };
            if entry.role() != expected {
                return false;
            }
            expect_user = !expect_user;
        }
        true
    }
}

impl Default for Trajectory {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Rollout failure record
// ---------------------------------------------------------------------------

/// A record of a rollout that failed during aggregation.
///
/// The partially built trajectory travels with the failure instead of being
/// stashed in ambient state, so callers can inspect exactly how far the run
/// got before it aborted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Human-readable description of the failure.
    pub message: String,
    /// The partial trajectory at the time of failure, when available.
    pub partial: Option<Trajectory>,
}

// ---------------------------------------------------------------------------
// Trajectory group
// ---------------------------------------------------------------------------

/// A finite, immutable batch of sealed trajectories for one GRPO update.
///
/// Group-relative advantage estimation compares rewards within the group, so
/// all trajectories in a group should come from rollouts of the same scenario
/// under the same policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryGroup {
    /// The trajectories that completed successfully.
    pub trajectories: Vec<Trajectory>,
    /// Rollouts that failed while the group was being gathered.
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
    /// Open bag of metadata tags.
    #[serde(default)]
    pub metadata: HashMap<String, MetadataValue>,
}

impl TrajectoryGroup {
    /// Create a group from completed trajectories.
    pub fn new(trajectories: Vec<Trajectory>) -> Self {
        Self {
            trajectories,
            failures: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Number of trajectories in the group.
    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    /// Whether the group holds no trajectories.
    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    /// Mean reward across the group (unsealed trajectories count as 0).
    pub fn mean_reward(&self) -> f64 {
        if self.trajectories.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .trajectories
            .iter()
            .map(|t| t.reward().unwrap_or(0.0))
            .sum();
        sum / self.trajectories.len() as f64
    }

    /// Population standard deviation of rewards within the group.
    pub fn reward_std(&self) -> f64 {
        if self.trajectories.is_empty() {
            return 0.0;
        }
        let mean = self.mean_reward();
        let var: f64 = self
            .trajectories
            .iter()
            .map(|t| (t.reward().unwrap_or(0.0) - mean).powi(2))
            .sum::<f64>()
            / self.trajectories.len() as f64;
        var.sqrt()
    }

    /// Group-relative advantage for each trajectory: the z-score of its
    /// reward within the group. All-identical rewards yield all zeros.
    pub fn advantages(&self) -> Vec<f64> {
        let mean = self.mean_reward();
        let std = self.reward_std();
        if std < 1e-8 {
            return vec![0.0; self.trajectories.len()];
        }
        self.trajectories
            .iter()
            .map(|t| (t.reward().unwrap_or(0.0) - mean) / std)
            .collect()
    }
}
