//! Versioned LoRA checkpoint store.
//!
//! Each training step commits one adapter artifact under the store root as a
//! zero-padded numeric directory (`0000`, `0001`, ...). A commit writes into
//! a staging directory and renames it into place, so a partially written
//! adapter is never observable and versions are strictly increasing. The
//! serving side always picks up `latest()`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Name of the metadata file that marks a checkpoint directory as committed.
const METADATA_FILE: &str = "metadata.json";

/// Metadata persisted alongside every committed adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Monotonically increasing step number; doubles as the version.
    pub version: u64,
    /// Name of the trained model.
    pub model_name: String,
    /// The frozen base model the adapter is layered onto.
    pub base_model: String,
    /// Commit timestamp.
    pub created_at: DateTime<Utc>,
    /// Step metrics recorded at commit time (losses, benchmarks).
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

/// A committed checkpoint: its version, on-disk location, and metadata.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub version: u64,
    pub path: PathBuf,
    pub metadata: CheckpointMetadata,
}

/// A staging directory holding artifacts for a checkpoint that has not been
/// committed yet. Removed on drop unless committed.
#[derive(Debug)]
pub struct StagedCheckpoint {
    path: PathBuf,
    committed: bool,
}

impl StagedCheckpoint {
    /// Directory adapter artifacts should be written into.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedCheckpoint {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

/// Filesystem-backed store of versioned adapter artifacts.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create checkpoint root {}", root.display()))?;
        Ok(Self { root })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a given version lives in.
    pub fn dir_for(&self, version: u64) -> PathBuf {
        self.root.join(format!("{version:04}"))
    }

    /// All committed versions, ascending.
    pub fn versions(&self) -> Result<Vec<u64>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("failed to read checkpoint root {}", self.root.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(version) = name.parse::<u64>() else {
                continue;
            };
            // Only directories carrying metadata count as committed.
            if entry.path().join(METADATA_FILE).is_file() {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// The highest committed version, if any.
    pub fn latest_version(&self) -> Result<Option<u64>> {
        Ok(self.versions()?.into_iter().next_back())
    }

    /// Load a committed checkpoint by version.
    pub fn load(&self, version: u64) -> Result<Checkpoint> {
        let path = self.dir_for(version);
        let text = fs::read_to_string(path.join(METADATA_FILE))
            .with_context(|| format!("checkpoint {version:04} has no readable metadata"))?;
        let metadata: CheckpointMetadata = serde_json::from_str(&text)
            .with_context(|| format!("checkpoint {version:04} has malformed metadata"))?;
        Ok(Checkpoint {
            version,
            path,
            metadata,
        })
    }

    /// The highest committed checkpoint, if any.
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        match self.latest_version()? {
            Some(version) => Ok(Some(self.load(version)?)),
            None => Ok(None),
        }
    }

    /// Open a staging directory for the next checkpoint's artifacts.
    ///
    /// The staging directory is invisible to `versions()`; it becomes a
    /// checkpoint only through [`CheckpointStore::commit`], and is removed
    /// on drop if never committed.
    pub fn stage(&self) -> Result<StagedCheckpoint> {
        let path = self.root.join(format!(".staging-{}", Uuid::new_v4()));
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create staging dir {}", path.display()))?;
        Ok(StagedCheckpoint {
            path,
            committed: false,
        })
    }

    /// Commit a staged checkpoint at the next version.
    ///
    /// Writes the metadata file into the staging directory and renames it
    /// into its final versioned location. The rename is the commit point: a
    /// checkpoint either exists completely or not at all.
    pub fn commit(
        &self,
        mut staged: StagedCheckpoint,
        model_name: &str,
        base_model: &str,
        metrics: HashMap<String, f64>,
    ) -> Result<Checkpoint> {
        let version = match self.latest_version()? {
            Some(latest) => latest + 1,
            None => 0,
        };

        let metadata = CheckpointMetadata {
            version,
            model_name: model_name.to_string(),
            base_model: base_model.to_string(),
            created_at: Utc::now(),
            metrics,
        };
        let text = serde_json::to_string_pretty(&metadata)?;
        fs::write(staged.path.join(METADATA_FILE), text)?;

        let final_dir = self.dir_for(version);
        fs::rename(&staged.path, &final_dir)
            .with_context(|| format!("failed to commit checkpoint {version:04} into place"))?;
        staged.committed = true;

        info!(version, path = %final_dir.display(), "checkpoint committed");
        Ok(Checkpoint {
            version,
            path: final_dir,
            metadata,
        })
    }

    /// Stage, populate via `write_artifacts`, and commit in one call.
    pub fn commit_next<F>(
        &self,
        model_name: &str,
        base_model: &str,
        metrics: HashMap<String, f64>,
        write_artifacts: F,
    ) -> Result<Checkpoint>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let staged = self.stage()?;
        write_artifacts(staged.path()).context("adapter artifact write failed")?;
        self.commit(staged, model_name, base_model, metrics)
    }

    /// Delete superseded checkpoints.
    ///
    /// The latest checkpoint is always kept. When `benchmark` names a metric,
    /// the checkpoint with the best exponentially smoothed value of that
    /// metric is kept too (`smoothing` = 1.0 means raw values). Returns the
    /// deleted versions.
    pub fn delete_checkpoints(
        &self,
        benchmark: Option<&str>,
        smoothing: f64,
    ) -> Result<Vec<u64>> {
        let versions = self.versions()?;
        let Some(&latest) = versions.last() else {
            return Ok(Vec::new());
        };

        let mut keep = vec![latest];
        if let Some(metric) = benchmark {
            if let Some(best) = self.best_by_smoothed_metric(&versions, metric, smoothing)? {
                keep.push(best);
            }
        }

        let mut deleted = Vec::new();
        for version in versions {
            if keep.contains(&version) {
                continue;
            }
            let dir = self.dir_for(version);
            match fs::remove_dir_all(&dir) {
                Ok(()) => deleted.push(version),
                Err(e) => warn!(version, error = %e, "failed to delete checkpoint"),
            }
        }

        if !deleted.is_empty() {
            info!(deleted = ?deleted, kept = ?keep, "checkpoints deleted");
        }
        Ok(deleted)
    }

    /// The version with the best exponentially smoothed benchmark value.
    fn best_by_smoothed_metric(
        &self,
        versions: &[u64],
        metric: &str,
        smoothing: f64,
    ) -> Result<Option<u64>> {
        let mut smoothed: Option<f64> = None;
        let mut best: Option<(u64, f64)> = None;

        for &version in versions {
            let checkpoint = self.load(version)?;
            let Some(&value) = checkpoint.metadata.metrics.get(metric) else {
                continue;
            };
            let current = match smoothed {
                Some(prev) => smoothing * value + (1.0 - smoothing) * prev,
                None => value,
            };
            smoothed = Some(current);
            if best.is_none_or(|(_, b)| current > b) {
                best = Some((version, current));
            }
        }

        Ok(best.map(|(version, _)| version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(
        store: &CheckpointStore,
        metrics: HashMap<String, f64>,
    ) -> Checkpoint {
        store
            .commit_next("agent-001", "base", metrics, |dir| {
                fs::write(dir.join("adapter.safetensors"), b"weights")?;
                Ok(())
            })
            .unwrap()
    }

    fn benchmark(value: f64) -> HashMap<String, f64> {
        HashMap::from([("val/reward".to_string(), value)])
    }

    #[test]
    fn test_versions_increase_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();

        assert_eq!(store.latest_version().unwrap(), None);
        assert_eq!(commit(&store, HashMap::new()).version, 0);
        assert_eq!(commit(&store, HashMap::new()).version, 1);
        assert_eq!(commit(&store, HashMap::new()).version, 2);
        assert_eq!(store.latest_version().unwrap(), Some(2));
        assert_eq!(store.versions().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_commit_writes_artifacts_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();

        let checkpoint = commit(&store, benchmark(0.5));
        assert!(checkpoint.path.join("adapter.safetensors").is_file());

        let loaded = store.load(checkpoint.version).unwrap();
        assert_eq!(loaded.metadata.model_name, "agent-001");
        assert_eq!(loaded.metadata.metrics["val/reward"], 0.5);
    }

    #[test]
    fn test_failed_commit_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();

        let result = store.commit_next("agent-001", "base", HashMap::new(), |_| {
            anyhow::bail!("tuner crashed")
        });
        assert!(result.is_err());
        assert_eq!(store.versions().unwrap(), Vec::<u64>::new());
        // No staging leftovers either.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_uncommitted_dirs_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        commit(&store, HashMap::new());

        // A directory without metadata is not a committed checkpoint.
        fs::create_dir(dir.path().join("0007")).unwrap();
        assert_eq!(store.latest_version().unwrap(), Some(0));
    }

    #[test]
    fn test_delete_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        for _ in 0..4 {
            commit(&store, HashMap::new());
        }

        let deleted = store.delete_checkpoints(None, 1.0).unwrap();
        assert_eq!(deleted, vec![0, 1, 2]);
        assert_eq!(store.versions().unwrap(), vec![3]);
    }

    #[test]
    fn test_delete_keeps_best_benchmark() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        commit(&store, benchmark(0.2));
        commit(&store, benchmark(0.9));
        commit(&store, benchmark(0.4));

        let deleted = store.delete_checkpoints(Some("val/reward"), 1.0).unwrap();
        assert_eq!(deleted, vec![0]);
        // Best (1) and latest (2) survive.
        assert_eq!(store.versions().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_delete_with_smoothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        // A single spike at step 1; heavy smoothing favors the sustained
        // values at the tail.
        commit(&store, benchmark(0.5));
        commit(&store, benchmark(1.0));
        commit(&store, benchmark(0.8));
        commit(&store, benchmark(0.8));

        // smoothing 0.5: [0.5, 0.75, 0.775, 0.7875] -> best is step 3 (also
        // latest), so everything else is deleted.
        let deleted = store.delete_checkpoints(Some("val/reward"), 0.5).unwrap();
        assert_eq!(deleted, vec![0, 1, 2]);
    }
}
