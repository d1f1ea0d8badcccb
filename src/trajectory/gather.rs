//! Aggregation of concurrent rollouts into trajectory groups.
//!
//! Many rollouts run in parallel, each owning its own trajectory; the gather
//! awaits them all and assembles the sealed results into immutable
//! [`TrajectoryGroup`]s for the training step. Individual rollout failures are
//! tolerated up to a per-group fraction and recorded in the group rather than
//! aborting the batch.

use anyhow::{bail, Result};
use futures::future::join_all;
use tracing::{info, warn};

use crate::rollout::RolloutError;
use crate::trajectory::types::{Trajectory, TrajectoryGroup};

/// Options controlling a gather.
#[derive(Debug, Clone)]
pub struct GatherOptions {
    /// Fraction of failed rollouts a group tolerates. When the failure
    /// fraction exceeds this, the whole gather aborts: a group with too few
    /// survivors gives a meaningless advantage baseline.
    pub max_failure_fraction: f64,
}

impl Default for GatherOptions {
    fn default() -> Self {
        Self {
            max_failure_fraction: 0.5,
        }
    }
}

/// Await the rollout futures of every group concurrently and assemble the
/// results into [`TrajectoryGroup`]s.
///
/// Each inner `Vec` is one group of rollouts of the same scenario. Failed
/// rollouts are recorded in the group's `failures` (their partial
/// trajectories included) as long as the failure fraction stays within
/// bounds. Rollouts must return sealed trajectories.
pub async fn gather_trajectory_groups<Fut>(
    groups: Vec<Vec<Fut>>,
    options: &GatherOptions,
) -> Result<Vec<TrajectoryGroup>>
where
    Fut: std::future::Future<Output = Result<Trajectory, RolloutError>>,
{
    let results = join_all(groups.into_iter().map(join_all)).await;

    let mut gathered = Vec::with_capacity(results.len());
    let mut reward_sum = 0.0;
    let mut trajectory_count = 0usize;
    let mut failure_count = 0usize;

    for (group_index, group_results) in results.into_iter().enumerate() {
        let total = group_results.len();
        let mut group = TrajectoryGroup::new(Vec::with_capacity(total));

        for result in group_results {
            match result {
                Ok(mut trajectory) => {
                    if !trajectory.is_sealed() {
                        bail!(
                            "rollout in group {group_index} returned an unsealed trajectory \
                             (id {})",
                            trajectory.id
                        );
                    }
                    record_completion_tokens(&mut trajectory);
                    reward_sum += trajectory.reward().unwrap_or(0.0);
                    trajectory_count += 1;
                    group.trajectories.push(trajectory);
                }
                Err(err) => {
                    warn!(group = group_index, error = %err, "rollout failed during gather");
                    group.failures.push(err.to_failure_record());
                    failure_count += 1;
                }
            }
        }

        if total > 0 {
            let failure_fraction = group.failures.len() as f64 / total as f64;
            if failure_fraction > options.max_failure_fraction {
                bail!(
                    "group {group_index} lost {:.0}% of its rollouts \
                     (threshold {:.0}%)",
                    failure_fraction * 100.0,
                    options.max_failure_fraction * 100.0
                );
            }
        }

        gathered.push(group);
    }

    info!(
        groups = gathered.len(),
        trajectories = trajectory_count,
        failures = failure_count,
        mean_reward = if trajectory_count > 0 {
            reward_sum / trajectory_count as f64
        } else {
            0.0
        },
        "gather complete"
    );

    Ok(gathered)
}

/// Record the mean completion-token count per choice as a trajectory metric,
/// when the choices carried logprobs.
fn record_completion_tokens(trajectory: &mut Trajectory) {
    let counts: Vec<usize> = trajectory
        .choices()
        .filter_map(|c| c.completion_token_count())
        .collect();
    if counts.is_empty() {
        return;
    }
    let mean = counts.iter().sum::<usize>() as f64 / counts.len() as f64;
    trajectory.metrics.insert("completion_tokens".into(), mean);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::api::{ChatMessage, Choice, ChoiceLogProbs, TokenLogProb};
    use futures::future::BoxFuture;
    use futures::FutureExt;

    type RolloutFut = BoxFuture<'static, Result<Trajectory, RolloutError>>;

    fn sealed(reward: f64) -> Trajectory {
        let mut t = Trajectory::new();
        t.seal(reward);
        t
    }

    fn failure() -> RolloutError {
        RolloutError::Aborted {
            partial: Trajectory::new(),
            reason: "opponent crashed".into(),
        }
    }

    #[tokio::test]
    async fn gather_assembles_groups() {
        let groups: Vec<Vec<RolloutFut>> = vec![
            vec![
                async { Ok(sealed(1.0)) }.boxed(),
                async { Ok(sealed(0.0)) }.boxed(),
            ],
            vec![
                async { Ok(sealed(0.5)) }.boxed(),
                async { Ok(sealed(0.5)) }.boxed(),
            ],
        ];
        let gathered = gather_trajectory_groups(groups, &GatherOptions::default())
            .await
            .unwrap();
        assert_eq!(gathered.len(), 2);
        assert_eq!(gathered[0].len(), 2);
        assert!((gathered[0].mean_reward() - 0.5).abs() < 1e-9);
        assert!(gathered[1].failures.is_empty());
    }

    #[tokio::test]
    async fn gather_records_tolerated_failures() {
        let groups: Vec<Vec<RolloutFut>> = vec![vec![
            async { Ok(sealed(1.0)) }.boxed(),
            async { Ok(sealed(0.0)) }.boxed(),
            async { Ok(sealed(0.5)) }.boxed(),
            async { Err(failure()) }.boxed(),
        ]];
        let gathered = gather_trajectory_groups(groups, &GatherOptions::default())
            .await
            .unwrap();
        assert_eq!(gathered[0].len(), 3);
        assert_eq!(gathered[0].failures.len(), 1);
        assert!(gathered[0].failures[0].message.contains("opponent crashed"));
    }

    #[tokio::test]
    async fn gather_aborts_past_failure_threshold() {
        let groups: Vec<Vec<RolloutFut>> = vec![vec![
            async { Ok(sealed(1.0)) }.boxed(),
            async { Err(failure()) }.boxed(),
            async { Err(failure()) }.boxed(),
        ]];
        let result = gather_trajectory_groups(groups, &GatherOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn gather_rejects_unsealed_trajectories() {
        let groups = vec![vec![async { Ok(Trajectory::new()) }]];
        let result = gather_trajectory_groups(groups, &GatherOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn gather_derives_completion_token_metric() {
        let mut t = Trajectory::new();
        let mut choice = Choice {
            index: 0,
            message: ChatMessage::assistant("<move>A1</move>"),
            finish_reason: Some("stop".into()),
            logprobs: Some(ChoiceLogProbs {
                content: Some(vec![
                    TokenLogProb {
                        token: "<move>".into(),
                        logprob: -0.2,
                    },
                    TokenLogProb {
                        token: "A1".into(),
                        logprob: -0.4,
                    },
                ]),
            }),
        };
        t.push_choice(choice.clone());
        choice.logprobs = Some(ChoiceLogProbs {
            content: Some(vec![TokenLogProb {
                token: "<move>B2</move>".into(),
                logprob: -0.9,
            }]),
        });
        t.push_choice(choice);
        t.seal(1.0);

        let gathered = gather_trajectory_groups(vec![vec![async { Ok(t) }]], &GatherOptions::default())
            .await
            .unwrap();
        let metric = gathered[0].trajectories[0].metrics["completion_tokens"];
        assert!((metric - 1.5).abs() < 1e-9);
    }
}
