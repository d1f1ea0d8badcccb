//! Trajectory recording and aggregation.
//!
//! [`types`] defines the trajectory data model (message/choice entries,
//! seal-once rewards, groups); [`gather`] awaits parallel rollouts and
//! assembles their sealed trajectories into groups for training.

pub mod gather;
pub mod types;

pub use gather::{gather_trajectory_groups, GatherOptions};
pub use types::{FailureRecord, MessageOrChoice, MetadataValue, Trajectory, TrajectoryGroup};
