//! Model registry and training step execution.
//!
//! The service owns one checkpoint store and one phase gate per registered
//! model. A training step is blocking from the model's point of view:
//! inference drains, the GRPO loss is computed, the policy tuner applies the
//! update into a staged checkpoint, the checkpoint is committed atomically,
//! and queued requests are released against the new version.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, ensure, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::{CheckpointConfig, TrainConfig};
use crate::model::TrainableModel;
use crate::training::{GrpoSample, GrpoStepResult, GrpoTrainer};
use crate::trajectory::TrajectoryGroup;

use super::state::{InferenceGate, ServePhase};

// ---------------------------------------------------------------------------
// Policy tuner seam
// ---------------------------------------------------------------------------

/// Everything a tuner needs to apply one weight update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneSpec {
    pub model_name: String,
    pub base_model: String,
    pub learning_rate: f64,
    /// Loss terms computed for this step.
    pub step: GrpoStepResult,
    /// Per-trajectory samples the loss was computed from.
    pub samples: Vec<GrpoSample>,
}

/// Applies GRPO weight updates to LoRA adapter artifacts.
///
/// The loss computation is in-process; moving the actual weights is
/// delegated here so a GPU trainer can live in a separate process. The
/// futures are `Send` so the service can run inside the HTTP server.
pub trait PolicyTuner {
    /// Write an initial adapter for a freshly registered model into
    /// `output_dir`.
    fn initialize(
        &self,
        model: &TrainableModel,
        output_dir: &Path,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Apply one update: read the adapter at `previous`, move its weights
    /// per `spec`, and write the result into `output_dir`.
    fn apply(
        &self,
        spec: &TuneSpec,
        previous: Option<&Path>,
        output_dir: &Path,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Tuner that records each update as JSON instead of moving weights.
///
/// Used when no external tuner command is configured; keeps the full
/// checkpoint and serving lifecycle exercisable without a GPU.
#[derive(Debug, Clone, Default)]
pub struct RecordingTuner;

impl PolicyTuner for RecordingTuner {
    async fn initialize(&self, model: &TrainableModel, output_dir: &Path) -> Result<()> {
        let manifest = serde_json::json!({
            "model_name": model.name,
            "base_model": model.base_model,
        });
        std::fs::write(
            output_dir.join("adapter_manifest.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;
        Ok(())
    }

    async fn apply(
        &self,
        spec: &TuneSpec,
        previous: Option<&Path>,
        output_dir: &Path,
    ) -> Result<()> {
        // Carry the manifest forward so every checkpoint is self-describing.
        if let Some(previous) = previous {
            let manifest = previous.join("adapter_manifest.json");
            if manifest.is_file() {
                std::fs::copy(&manifest, output_dir.join("adapter_manifest.json"))?;
            }
        }
        std::fs::write(
            output_dir.join("grpo_update.json"),
            serde_json::to_string_pretty(spec)?,
        )?;
        Ok(())
    }
}

/// Tuner that shells out to an external trainer process.
///
/// The spec is written to a JSON file inside the output directory and the
/// command is invoked with `init`/`step` subcommands and explicit paths.
#[derive(Debug, Clone)]
pub struct CommandTuner {
    program: String,
    args: Vec<String>,
}

impl CommandTuner {
    pub fn new(command: &[String]) -> Result<Self> {
        ensure!(!command.is_empty(), "tuner command must not be empty");
        Ok(Self {
            program: command[0].clone(),
            args: command[1..].to_vec(),
        })
    }

    async fn run(&self, extra: &[&str]) -> Result<()> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .args(extra)
            .output()
            .await
            .with_context(|| format!("failed to spawn tuner command {}", self.program))?;
        if !output.status.success() {
            bail!(
                "tuner command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl PolicyTuner for CommandTuner {
    async fn initialize(&self, model: &TrainableModel, output_dir: &Path) -> Result<()> {
        self.run(&[
            "init",
            "--base-model",
            &model.base_model,
            "--output",
            &output_dir.display().to_string(),
        ])
        .await
    }

    async fn apply(
        &self,
        spec: &TuneSpec,
        previous: Option<&Path>,
        output_dir: &Path,
    ) -> Result<()> {
        let spec_path = output_dir.join("tune_spec.json");
        std::fs::write(&spec_path, serde_json::to_string_pretty(spec)?)?;

        let spec_arg = spec_path.display().to_string();
        let output_arg = output_dir.display().to_string();
        let mut args = vec!["step", "--spec", &spec_arg, "--output", &output_arg];
        let previous_arg = previous.map(|p| p.display().to_string());
        if let Some(previous_arg) = previous_arg.as_deref() {
            args.push("--previous");
            args.push(previous_arg);
        }
        self.run(&args).await
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Outcome of one training step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainResult {
    /// Version of the checkpoint the step committed.
    pub step: u64,
    /// Step metrics, as persisted in the checkpoint metadata.
    pub metrics: HashMap<String, f64>,
}

/// Observable state of one registered model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatus {
    pub name: String,
    pub phase: ServePhase,
    pub serving_version: Option<u64>,
    pub queue_depth: usize,
    pub in_flight: usize,
}

#[derive(Clone)]
struct ModelEntry {
    model: TrainableModel,
    store: CheckpointStore,
    gate: InferenceGate,
}

/// The training server's core: a registry of models, each with its own
/// checkpoint store and serving gate.
pub struct TrainingService<T: PolicyTuner> {
    root: PathBuf,
    train: TrainConfig,
    checkpoints: CheckpointConfig,
    tuner: T,
    models: Mutex<HashMap<String, ModelEntry>>,
    // Serializes register() so concurrent calls for the same model cannot
    // both initialize a store or replace each other's gate.
    registration: tokio::sync::Mutex<()>,
}

impl<T: PolicyTuner> TrainingService<T> {
    pub fn new(train: TrainConfig, checkpoints: CheckpointConfig, tuner: T) -> Self {
        Self {
            root: PathBuf::from(&checkpoints.root),
            train,
            checkpoints,
            tuner,
            models: Mutex::new(HashMap::new()),
            registration: tokio::sync::Mutex::new(()),
        }
    }

    fn model_dir(&self, model: &TrainableModel) -> PathBuf {
        self.root.join(&model.project).join(&model.name)
    }

    fn entry(&self, name: &str) -> Result<ModelEntry> {
        self.models
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .with_context(|| format!("model {name} is not registered"))
    }

    /// Register a model, creating its checkpoint store and committing an
    /// initial adapter if none exists. Idempotent; returns the current step.
    pub async fn register(&self, model: TrainableModel) -> Result<u64> {
        let _registering = self.registration.lock().await;
        if let Ok(entry) = self.entry(&model.name) {
            return Ok(entry.store.latest_version()?.unwrap_or(0));
        }

        let store = CheckpointStore::open(self.model_dir(&model).join("checkpoints"))?;
        if store.latest_version()?.is_none() {
            let staged = store.stage()?;
            self.tuner.initialize(&model, staged.path()).await?;
            store.commit(staged, &model.name, &model.base_model, HashMap::new())?;
        }

        let version = store.latest_version()?;
        let gate = InferenceGate::new(version);
        info!(model = %model.name, step = version, "model registered");

        self.models.lock().unwrap().insert(
            model.name.clone(),
            ModelEntry { model, store, gate },
        );
        Ok(version.unwrap_or(0))
    }

    /// The model's current training step (its latest checkpoint version).
    pub fn get_step(&self, name: &str) -> Result<u64> {
        let entry = self.entry(name)?;
        Ok(entry.store.latest_version()?.unwrap_or(0))
    }

    /// The serving gate for a registered model.
    pub fn gate(&self, name: &str) -> Result<InferenceGate> {
        Ok(self.entry(name)?.gate)
    }

    /// Observable serving state for a registered model.
    pub fn status(&self, name: &str) -> Result<ModelStatus> {
        let entry = self.entry(name)?;
        Ok(ModelStatus {
            name: name.to_string(),
            phase: entry.gate.phase(),
            serving_version: entry.gate.serving_version(),
            queue_depth: entry.gate.queue_depth(),
            in_flight: entry.gate.in_flight(),
        })
    }

    /// Run one blocking training step over a batch of trajectory groups.
    ///
    /// Drains in-flight inference, computes the GRPO loss, applies the
    /// update via the tuner, commits the checkpoint, and resumes serving at
    /// the new version. On failure serving resumes at the previous version.
    pub async fn train(&self, name: &str, groups: &[TrajectoryGroup]) -> Result<TrainResult> {
        let entry = self.entry(name)?;
        ensure!(!groups.is_empty(), "cannot train on an empty batch");

        entry.gate.begin_training().await?;
        match self.run_step(&entry, groups).await {
            Ok(result) => {
                entry.gate.finish_training(result.step)?;
                info!(
                    model = name,
                    step = result.step,
                    total_loss = result.metrics.get("total_loss"),
                    "training step committed"
                );
                Ok(result)
            }
            Err(e) => {
                warn!(model = name, error = %e, "training step failed, resuming serving");
                let _ = entry.gate.abort_training();
                Err(e)
            }
        }
    }

    async fn run_step(&self, entry: &ModelEntry, groups: &[TrajectoryGroup]) -> Result<TrainResult> {
        let trainer = GrpoTrainer::new(self.train.clone());
        let step = trainer.train_step(groups)?;

        let samples: Vec<GrpoSample> = groups
            .iter()
            .filter(|g| g.len() >= 2)
            .flat_map(|g| trainer.build_samples(g))
            .collect();
        let spec = TuneSpec {
            model_name: entry.model.name.clone(),
            base_model: entry.model.base_model.clone(),
            learning_rate: self.train.learning_rate,
            step: step.clone(),
            samples,
        };

        let previous = entry.store.latest()?.map(|c| c.path);
        let staged = entry.store.stage()?;
        self.tuner
            .apply(&spec, previous.as_deref(), staged.path())
            .await?;

        let metrics = step_metrics(&step, groups);
        let checkpoint = entry.store.commit(
            staged,
            &entry.model.name,
            &entry.model.base_model,
            metrics.clone(),
        )?;
        Ok(TrainResult {
            step: checkpoint.version,
            metrics,
        })
    }

    /// Append trajectory groups to the model's JSONL log for a split.
    /// Returns the number of trajectories written.
    pub fn log(&self, name: &str, groups: &[TrajectoryGroup], split: &str) -> Result<usize> {
        let entry = self.entry(name)?;
        let dir = self.model_dir(&entry.model).join("logs");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{split}.jsonl"));
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        let step = entry.store.latest_version()?.unwrap_or(0);
        let mut written = 0;
        for group in groups {
            for trajectory in &group.trajectories {
                let line = LogRecord {
                    recorded_at: Utc::now(),
                    step,
                    split,
                    trajectory: serde_json::to_value(trajectory)?,
                };
                writeln!(file, "{}", serde_json::to_string(&line)?)?;
                written += 1;
            }
        }
        info!(model = name, split, step, trajectories = written, "trajectories logged");
        Ok(written)
    }

    /// Delete superseded checkpoints per the retention policy.
    pub fn delete_checkpoints(&self, name: &str) -> Result<Vec<u64>> {
        let entry = self.entry(name)?;
        entry.store.delete_checkpoints(
            self.checkpoints.keep_best_benchmark.as_deref(),
            self.checkpoints.benchmark_smoothing,
        )
    }
}

#[derive(Serialize)]
struct LogRecord<'a> {
    recorded_at: DateTime<Utc>,
    step: u64,
    split: &'a str,
    trajectory: serde_json::Value,
}

/// Flatten a step result and the batch's mean reward into checkpoint metrics.
fn step_metrics(step: &GrpoStepResult, groups: &[TrajectoryGroup]) -> HashMap<String, f64> {
    let mut metrics = HashMap::from([
        ("policy_loss".to_string(), step.policy_loss),
        ("kl_divergence".to_string(), step.kl_divergence),
        ("total_loss".to_string(), step.total_loss),
        ("mean_advantage".to_string(), step.mean_advantage),
        ("mean_ratio".to_string(), step.mean_ratio),
        ("clip_fraction".to_string(), step.clip_fraction),
        ("num_trajectories".to_string(), step.num_trajectories as f64),
    ]);

    let rewards: Vec<f64> = groups
        .iter()
        .filter(|g| !g.is_empty())
        .map(|g| g.mean_reward())
        .collect();
    if !rewards.is_empty() {
        let mean = rewards.iter().sum::<f64>() / rewards.len() as f64;
        metrics.insert("reward".to_string(), mean);
    }
    metrics
}
