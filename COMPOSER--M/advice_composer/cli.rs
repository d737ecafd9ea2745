use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use advice_composer::{
    orchestration_entry::seed_demo, ComposerConfig, ComposerRuntime, InstanceOutcome,
};
use anyhow::{Context, Result};
use blackboard_client::MemoryBlackboard;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::{runtime::Runtime, sync::watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "advice-composer",
    version,
    about = "Arbitrates drilling advisor proposals into one decision per function"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the tick loop against an in-memory blackboard until Ctrl-C.
    Run {
        #[arg(long, default_value = "composer.toml")]
        config: PathBuf,
        /// Stops after this many ticks.
        #[arg(long)]
        ticks: Option<u64>,
        /// Seeds the blackboard with the demo rig first.
        #[arg(long)]
        demo: bool,
    },
    /// Runs one tick over the demo rig and prints the tick report.
    Demo {
        #[arg(long, default_value = "composer.toml")]
        config: PathBuf,
    },
    /// Writes a default configuration file.
    InitConfig {
        #[arg(long, default_value = "composer.toml")]
        config: PathBuf,
        /// Overwrites an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Loads and validates a configuration file.
    Validate {
        #[arg(long, default_value = "composer.toml")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            ticks,
            demo,
        } => run(&config, ticks, demo),
        Commands::Demo { config } => demo(&config),
        Commands::InitConfig { config, force } => init_config(&config, force),
        Commands::Validate { config } => {
            let loaded = ComposerConfig::load_or_init(&config)?;
            println!("{} is valid", config.display());
            println!("{}", toml::to_string_pretty(&loaded)?);
            Ok(())
        }
    }
}

fn run(path: &Path, ticks: Option<u64>, demo: bool) -> Result<()> {
    let config = ComposerConfig::load_or_init(path)?;
    let board = MemoryBlackboard::new(1024);
    if demo {
        seed_demo(&board, &config.capability_query, Utc::now());
    }
    let runtime = ComposerRuntime::bootstrap(config, Arc::new(board))?;
    let rt = Runtime::new().context("starting tokio runtime")?;
    rt.block_on(async move {
        let (shutdown, receiver) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                let _ = shutdown.send(true);
            }
        });
        let ran = runtime.run(receiver, ticks).await?;
        println!("composer stopped after {ran} ticks");
        Ok::<(), anyhow::Error>(())
    })
}

fn demo(path: &Path) -> Result<()> {
    let config = ComposerConfig::load_or_init(path)?;
    let board = MemoryBlackboard::new(1024);
    let now = Utc::now();
    seed_demo(&board, &config.capability_query, now);
    let mut runtime = ComposerRuntime::bootstrap(config, Arc::new(board.clone()))?;
    let report = runtime.tick(now);
    for instance in &report.instances {
        if matches!(
            instance.outcome,
            InstanceOutcome::NoWinner | InstanceOutcome::EnvelopeExhausted
        ) {
            warn!(name = %instance.name, "nothing published");
        }
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    for update in board.written() {
        println!("{} <- {}", update.node, update.value);
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("{} already exists, use --force to overwrite", path.display());
        return Ok(());
    }
    ComposerConfig::default().save(path)?;
    println!("wrote {}", path.display());
    Ok(())
}
