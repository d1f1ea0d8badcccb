//! Group Relative Policy Optimization over trajectory groups.
//!
//! The objective for one group of G trajectories:
//!
//!   J(theta) = E[ 1/G * sum_i min(rho_i * A_i, clip(rho_i, 1-eps, 1+eps) * A_i)
//!              - beta * D_KL(pi_theta || pi_ref) ]
//!
//! where rho_i is the importance ratio between the current and sampling
//! policies and A_i the group-relative advantage of trajectory i. The trainer
//! computes the loss terms analytically; applying the weight update to the
//! LoRA adapter is the policy tuner's job (see `server::service`).

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TrainConfig;
use crate::trajectory::types::{Trajectory, TrajectoryGroup};

use super::advantage::{clip_ratio, compute_group_advantages, importance_ratio};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One trajectory prepared for a GRPO update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpoSample {
    /// Identifier of the source trajectory.
    pub trajectory_id: String,
    /// The trajectory's sealed reward.
    pub reward: f64,
    /// Group-relative advantage A_i.
    pub advantage: f64,
    /// log pi_theta(completions | prompts) under the current policy.
    pub current_log_prob: f64,
    /// log pi_old(completions | prompts) under the sampling policy.
    pub old_log_prob: f64,
    /// log pi_ref(completions | prompts) under the reference policy, for the
    /// KL penalty.
    pub ref_log_prob: f64,
}

/// Metrics from a single GRPO step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpoStepResult {
    /// Negated mean clipped surrogate objective.
    pub policy_loss: f64,
    /// Mean KL divergence from the reference policy.
    pub kl_divergence: f64,
    /// `policy_loss + beta * kl_divergence`.
    pub total_loss: f64,
    /// Mean advantage across all samples.
    pub mean_advantage: f64,
    /// Mean importance ratio across all samples.
    pub mean_ratio: f64,
    /// Fraction of ratios clipped by the epsilon bound.
    pub clip_fraction: f64,
    /// Number of groups in the step.
    pub num_groups: usize,
    /// Number of trajectories in the step.
    pub num_trajectories: usize,
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Computes the GRPO loss for batches of trajectory groups.
pub struct GrpoTrainer {
    config: TrainConfig,
}

impl GrpoTrainer {
    /// Create a trainer with the given training configuration.
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Prepare one group for the update: compute group-relative advantages
    /// and extract per-trajectory log probabilities.
    ///
    /// Collection is on-policy, so the sampling log-prob equals the current
    /// one at this point (ratio 1); trajectories whose choices carried no
    /// logprobs get a neutral placeholder. The tuner backend recomputes
    /// current-policy logprobs as the weights move during the update.
    pub fn build_samples(&self, group: &TrajectoryGroup) -> Vec<GrpoSample> {
        let rewards: Vec<f64> = group
            .trajectories
            .iter()
            .map(|t| t.reward().unwrap_or(0.0))
            .collect();
        let advantages = compute_group_advantages(&rewards);

        group
            .trajectories
            .iter()
            .zip(advantages)
            .map(|(trajectory, advantage)| sample_from_trajectory(trajectory, advantage))
            .collect()
    }

    /// Compute the loss terms for one prepared group.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty group.
    pub fn compute_group_loss(&self, samples: &[GrpoSample]) -> Result<GrpoStepResult> {
        if samples.is_empty() {
            bail!("cannot compute GRPO loss for an empty group");
        }

        let g = samples.len() as f64;
        let epsilon = self.config.clip_epsilon;
        let beta = self.config.kl_coeff;

        let mut total_objective = 0.0;
        let mut total_kl = 0.0;
        let mut total_ratio = 0.0;
        let mut total_advantage = 0.0;
        let mut num_clipped = 0usize;

        for sample in samples {
            let ratio = importance_ratio(sample.current_log_prob, sample.old_log_prob);
            let clipped = clip_ratio(ratio, epsilon);
            if (clipped - ratio).abs() > 1e-10 {
                num_clipped += 1;
            }

            // Pessimistic bound of the clipped surrogate.
            let objective = (ratio * sample.advantage).min(clipped * sample.advantage);
            total_objective += objective;
            total_kl += sample.current_log_prob - sample.ref_log_prob;
            total_ratio += ratio;
            total_advantage += sample.advantage;
        }

        let policy_loss = -(total_objective / g);
        let kl_divergence = total_kl / g;

        Ok(GrpoStepResult {
            policy_loss,
            kl_divergence,
            total_loss: policy_loss + beta * kl_divergence,
            mean_advantage: total_advantage / g,
            mean_ratio: total_ratio / g,
            clip_fraction: num_clipped as f64 / g,
            num_groups: 1,
            num_trajectories: samples.len(),
        })
    }

    /// Compute the loss for a full batch of groups, averaging the per-group
    /// terms. The batch is consumed as one atomic training step.
    ///
    /// Groups that hold fewer than two trajectories are skipped: a singleton
    /// has no baseline to be relative to.
    pub fn train_step(&self, groups: &[TrajectoryGroup]) -> Result<GrpoStepResult> {
        let prepared: Vec<Vec<GrpoSample>> = groups
            .iter()
            .filter(|g| g.len() >= 2)
            .map(|g| self.build_samples(g))
            .collect();

        if prepared.is_empty() {
            bail!("no group in the batch has enough trajectories for a GRPO step");
        }

        let mut aggregate = GrpoStepResult {
            policy_loss: 0.0,
            kl_divergence: 0.0,
            total_loss: 0.0,
            mean_advantage: 0.0,
            mean_ratio: 0.0,
            clip_fraction: 0.0,
            num_groups: prepared.len(),
            num_trajectories: 0,
        };

        for samples in &prepared {
            let result = self.compute_group_loss(samples)?;
            aggregate.policy_loss += result.policy_loss;
            aggregate.kl_divergence += result.kl_divergence;
            aggregate.total_loss += result.total_loss;
            aggregate.mean_advantage += result.mean_advantage;
            aggregate.mean_ratio += result.mean_ratio;
            aggregate.clip_fraction += result.clip_fraction;
            aggregate.num_trajectories += result.num_trajectories;
        }

        let n = prepared.len() as f64;
        aggregate.policy_loss /= n;
        aggregate.kl_divergence /= n;
        aggregate.total_loss /= n;
        aggregate.mean_advantage /= n;
        aggregate.mean_ratio /= n;
        aggregate.clip_fraction /= n;

        debug!(
            groups = aggregate.num_groups,
            trajectories = aggregate.num_trajectories,
            total_loss = aggregate.total_loss,
            kl = aggregate.kl_divergence,
            clip_fraction = aggregate.clip_fraction,
            "GRPO loss computed"
        );

        Ok(aggregate)
    }
}

/// Build a sample from a sealed trajectory and its group advantage.
fn sample_from_trajectory(trajectory: &Trajectory, advantage: f64) -> GrpoSample {
    // On-policy collection: sampling policy == current policy, and without an
    // explicit reference pass the KL term starts at zero.
    let log_prob = trajectory.total_log_prob().unwrap_or(-1.0);
    GrpoSample {
        trajectory_id: trajectory.id.clone(),
        reward: trajectory.reward().unwrap_or(0.0),
        advantage,
        current_log_prob: log_prob,
        old_log_prob: log_prob,
        ref_log_prob: log_prob,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::types::Trajectory;

    fn config() -> TrainConfig {
        TrainConfig {
            learning_rate: 1e-5,
            clip_epsilon: 0.2,
            kl_coeff: 0.01,
            group_size: 4,
            num_steps: 1,
        }
    }

    fn sample(reward: f64, advantage: f64, current: f64, old: f64, refp: f64) -> GrpoSample {
        GrpoSample {
            trajectory_id: uuid::Uuid::new_v4().to_string(),
            reward,
            advantage,
            current_log_prob: current,
            old_log_prob: old,
            ref_log_prob: refp,
        }
    }

    fn sealed(reward: f64) -> Trajectory {
        let mut t = Trajectory::new();
        t.seal(reward);
        t
    }

    #[test]
    fn test_on_policy_loss_is_zero_for_balanced_group() {
        let trainer = GrpoTrainer::new(config());
        // Ratio 1 everywhere, advantages symmetric: objective averages to 0.
        let samples = vec![
            sample(0.0, -1.0, -2.0, -2.0, -2.0),
            sample(1.0, 1.0, -2.0, -2.0, -2.0),
            sample(0.0, -1.0, -2.0, -2.0, -2.0),
            sample(1.0, 1.0, -2.0, -2.0, -2.0),
        ];
        let result = trainer.compute_group_loss(&samples).unwrap();
        assert!(result.policy_loss.abs() < 1e-9);
        assert!(result.kl_divergence.abs() < 1e-9);
        assert!((result.mean_ratio - 1.0).abs() < 1e-9);
        assert!(result.clip_fraction.abs() < 1e-9);
    }

    #[test]
    fn test_kl_penalty_enters_total_loss() {
        let trainer = GrpoTrainer::new(config());
        // Current policy drifted from the reference by 0.5 nats.
        let samples = vec![
            sample(0.0, -1.0, -1.5, -1.5, -2.0),
            sample(1.0, 1.0, -1.5, -1.5, -2.0),
        ];
        let result = trainer.compute_group_loss(&samples).unwrap();
        assert!((result.kl_divergence - 0.5).abs() < 1e-9);
        assert!((result.total_loss - (result.policy_loss + 0.01 * 0.5)).abs() < 1e-12);
    }

    #[test]
    fn test_large_ratio_is_clipped() {
        let trainer = GrpoTrainer::new(config());
        // exp(2) ~ 7.4, far outside [0.8, 1.2].
        let samples = vec![
            sample(0.0, -1.0, -1.0, -3.0, -2.0),
            sample(1.0, 1.0, -1.0, -3.0, -2.0),
        ];
        let result = trainer.compute_group_loss(&samples).unwrap();
        assert!((result.clip_fraction - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_group_is_rejected() {
        let trainer = GrpoTrainer::new(config());
        assert!(trainer.compute_group_loss(&[]).is_err());
    }

    #[test]
    fn test_build_samples_uses_group_advantages() {
        let trainer = GrpoTrainer::new(config());
        let group = TrajectoryGroup::new(vec![sealed(1.0), sealed(0.0)]);
        let samples = trainer.build_samples(&group);
        assert_eq!(samples.len(), 2);
        assert!((samples[0].advantage - 1.0).abs() < 1e-9);
        assert!((samples[1].advantage + 1.0).abs() < 1e-9);
        // No logprobs on the choices: neutral placeholder, ratio 1.
        assert!((samples[0].current_log_prob - samples[0].old_log_prob).abs() < 1e-9);
    }

    #[test]
    fn test_train_step_skips_singleton_groups() {
        let trainer = GrpoTrainer::new(config());
        let groups = vec![
            TrajectoryGroup::new(vec![sealed(1.0)]),
            TrajectoryGroup::new(vec![sealed(1.0), sealed(0.0), sealed(0.5)]),
        ];
        let result = trainer.train_step(&groups).unwrap();
        assert_eq!(result.num_groups, 1);
        assert_eq!(result.num_trajectories, 3);
    }

    #[test]
    fn test_train_step_rejects_all_singletons() {
        let trainer = GrpoTrainer::new(config());
        let groups = vec![TrajectoryGroup::new(vec![sealed(1.0)])];
        assert!(trainer.train_step(&groups).is_err());
    }

    #[test]
    fn test_train_step_averages_across_groups() {
        let trainer = GrpoTrainer::new(config());
        let groups = vec![
            TrajectoryGroup::new(vec![sealed(1.0), sealed(0.0)]),
            TrajectoryGroup::new(vec![sealed(0.5), sealed(0.5)]),
        ];
        let result = trainer.train_step(&groups).unwrap();
        assert_eq!(result.num_groups, 2);
        assert_eq!(result.num_trajectories, 4);
        // Second group has zero advantages; on-policy ratios are 1 in both,
        // so the averaged policy loss stays 0.
        assert!(result.policy_loss.abs() < 1e-9);
    }
}
