//! Checkpoint persistence.
//!
//! [`store`] manages the on-disk layout of versioned LoRA adapters and their
//! retention policy.

pub mod store;

pub use store::{Checkpoint, CheckpointMetadata, CheckpointStore, StagedCheckpoint};
