//! Agent reinforcement trainer.
//!
//! Provides subcommands for each side of the loop:
//!
//! - `serve`     -- Run the training server (checkpoints, GRPO steps)
//! - `train`     -- Drive the client loop: roll out, gather, train
//! - `benchmark` -- Play seeded tic-tac-toe games and report outcomes
//! - `inspect`   -- Inspect a model's checkpoint store

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use art::backend::BackendClient;
use art::checkpoint::CheckpointStore;
use art::config::ArtConfig;
use art::model::{Model, TrainableModel};
use art::server::{CommandTuner, RecordingTuner, TrainingService};
use art::telemetry::ReportClient;
use art::tictactoe;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Agent reinforcement trainer: GRPO fine-tuning for LLM agents.
#[derive(Parser)]
#[command(name = "art", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Project name grouping checkpoints and logs.
    #[arg(long, global = true, default_value = "tic-tac-toe")]
    project: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the training server.
    Serve,

    /// Run the client training loop against a training server.
    Train {
        /// Base URL of the training server.
        #[arg(long, default_value = "http://localhost:2218")]
        server: String,

        /// Trajectory groups rolled out per training step.
        #[arg(long, default_value_t = 2)]
        groups: usize,

        /// Keep all checkpoints instead of applying the retention policy.
        #[arg(long, default_value_t = false)]
        keep_all: bool,
    },

    /// Play seeded benchmark games against the inference endpoint.
    Benchmark {
        /// Number of games to play.
        #[arg(long, default_value_t = 48)]
        games: usize,

        /// Base seed; game i uses seed + i.
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },

    /// Inspect a model's checkpoint store.
    Inspect {
        /// Model name within the project.
        #[arg(default_value = "agent-001")]
        model: String,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load or create configuration.
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<ArtConfig>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => ArtConfig::default(),
    };

    // Fill in API keys from environment variables when not set in the config file.
    if config.model.inference_api_key.is_empty() {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.model.inference_api_key = key;
        }
    }
    if config.telemetry.api_key.is_empty() {
        if let Ok(key) = std::env::var("OPENPIPE_API_KEY") {
            config.telemetry.api_key = key;
        }
    }

    match cli.command {
        Commands::Serve => cmd_serve(&config).await,
        Commands::Train {
            server,
            groups,
            keep_all,
        } => cmd_train(&config, &cli.project, &server, groups, keep_all).await,
        Commands::Benchmark { games, seed } => {
            cmd_benchmark(&config, &cli.project, games, seed).await
        }
        Commands::Inspect { model } => cmd_inspect(&config, &cli.project, &model),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_serve(config: &ArtConfig) -> Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "Starting training server"
    );

    match &config.server.tuner_command {
        Some(command) => {
            let tuner = CommandTuner::new(command)?;
            let service = Arc::new(TrainingService::new(
                config.train.clone(),
                config.checkpoints.clone(),
                tuner,
            ));
            art::server::serve(&config.server, service).await
        }
        None => {
            tracing::warn!("No tuner command configured; updates will be recorded, not applied");
            let service = Arc::new(TrainingService::new(
                config.train.clone(),
                config.checkpoints.clone(),
                RecordingTuner,
            ));
            art::server::serve(&config.server, service).await
        }
    }
}

async fn cmd_train(
    config: &ArtConfig,
    project: &str,
    server: &str,
    groups: usize,
    keep_all: bool,
) -> Result<()> {
    let model = Model::new(
        &config.model.inference_model_id,
        project,
        &config.model.inference_api_base,
        &config.model.inference_api_key,
    );
    let trainable = TrainableModel::new(&model.name, project, &config.model.base_model);

    let backend = BackendClient::new(server);
    let reporter = ReportClient::new(&config.telemetry);
    let start = backend.register(&trainable).await?;
    tracing::info!(model = %model.name, step = start, "Registered with training server");

    let group_size = config.train.group_size;
    let rollouts_per_step = (groups * group_size) as u64;
    for step in start..config.train.num_steps as u64 {
        tracing::info!(step, "Gathering rollouts");
        let batch = tictactoe::gather_batch(
            &model,
            &config.rollout,
            &reporter,
            groups,
            group_size,
            step * rollouts_per_step,
        )
        .await?;

        backend.log(&model.name, &batch, "train").await?;
        let result = backend.train(&model.name, &batch).await?;
        tracing::info!(
            step = result.step,
            total_loss = result.metrics.get("total_loss"),
            reward = result.metrics.get("reward"),
            "Training step finished"
        );
    }

    if !keep_all {
        let deleted = backend.delete_checkpoints(&model.name).await?;
        tracing::info!(deleted = deleted.len(), "Applied checkpoint retention");
    }

    tracing::info!("Training loop finished");
    Ok(())
}

async fn cmd_benchmark(config: &ArtConfig, project: &str, games: usize, seed: u64) -> Result<()> {
    let model = Model::new(
        &config.model.inference_model_id,
        project,
        &config.model.inference_api_base,
        &config.model.inference_api_key,
    );

    tracing::info!(model = %model.name, games, seed, "Running benchmark");
    let report = tictactoe::run_benchmark(&model, &config.rollout, games, seed).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_inspect(config: &ArtConfig, project: &str, model: &str) -> Result<()> {
    let root = PathBuf::from(&config.checkpoints.root)
        .join(project)
        .join(model)
        .join("checkpoints");
    let store = CheckpointStore::open(&root)?;
    let versions = store.versions()?;

    println!("Checkpoint store: {}", root.display());
    println!("  Checkpoints: {}", versions.len());

    for version in versions {
        let checkpoint = store.load(version)?;
        println!(
            "  {version:04}  {}",
            checkpoint.metadata.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        let mut metrics: Vec<_> = checkpoint.metadata.metrics.iter().collect();
        metrics.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in metrics {
            println!("    {name}: {value:.4}");
        }
    }

    Ok(())
}
