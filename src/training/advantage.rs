//! Group-relative advantage estimation.
//!
//! GRPO samples G rollouts for the same scenario and scores each against the
//! group baseline:
//!
//!   A_i = (R_i - mean({R_j}_{j=1}^G)) / std({R_j}_{j=1}^G)
//!
//! plus the importance-ratio and PPO-clip primitives used by the surrogate
//! objective.

/// Compute group-relative advantages for a group of G rewards.
///
/// Each advantage is the z-score of the reward within the group, using the
/// population standard deviation (the group is the whole population being
/// normalized over, not a sample of one).
///
/// # Edge cases
///
/// - An empty slice yields an empty vector.
/// - Identical rewards (std = 0) yield all-zero advantages: when every
///   rollout scored the same, none should be preferred.
pub fn compute_group_advantages(rewards: &[f64]) -> Vec<f64> {
    if rewards.is_empty() {
        return Vec::new();
    }

    let n = rewards.len() as f64;
    let mean = rewards.iter().sum::<f64>() / n;
    let variance = rewards.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();

    if std < 1e-8 {
        return vec![0.0; rewards.len()];
    }

    rewards.iter().map(|r| (r - mean) / std).collect()
}

/// Importance sampling ratio between the current and sampling policies,
/// computed in log space:
///
///   rho = exp(log pi_theta - log pi_old)
pub fn importance_ratio(current_log_prob: f64, old_log_prob: f64) -> f64 {
    (current_log_prob - old_log_prob).exp()
}

/// Clamp an importance ratio to `[1 - epsilon, 1 + epsilon]`.
pub fn clip_ratio(ratio: f64, epsilon: f64) -> f64 {
    ratio.clamp(1.0 - epsilon, 1.0 + epsilon)
}
