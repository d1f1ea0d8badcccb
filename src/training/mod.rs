//! GRPO policy-update computation.
//!
//! [`advantage`] holds the group-relative estimation primitives; [`grpo`]
//! assembles trajectory groups into samples and computes the clipped
//! surrogate loss for each training step.

pub mod advantage;
pub mod grpo;

pub use grpo::{GrpoSample, GrpoStepResult, GrpoTrainer};
