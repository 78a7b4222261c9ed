use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use oblivion::config::{load_config, Config};
use oblivion::proxy::TrafficUnit;
use oblivion::Engine;

/// Oblivion stealth egress engine
#[derive(Parser)]
#[command(name = "oblivion", version)]
#[command(about = "Rule-based traffic filtering with stealth egress")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine and run until Ctrl-C
    Run {
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },
    /// Validate a configuration file
    Check {
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },
    /// Read JSON traffic units from stdin (one per line) and print decisions
    Eval {
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },
}

fn init_tracing(config: Option<&Config>) {
    let fallback = config.map_or("info", |c| c.log.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &PathBuf) -> Result<Config> {
    let path = path.to_string_lossy();
    load_config(&path).with_context(|| format!("load {}", path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => {
            let config = load(&config)?;
            init_tracing(Some(&config));
            run(config).await
        }
        Commands::Check { config } => {
            init_tracing(None);
            let config = load(&config)?;
            let engine = Engine::new(config)?;
            println!(
                "config ok: {} rules, {} upstreams",
                engine.rules().len(),
                engine.config().upstreams.len()
            );
            Ok(())
        }
        Commands::Eval { config } => {
            let config = load(&config)?;
            init_tracing(Some(&config));
            eval(config).await
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let engine = Engine::new(config)?;
    engine.start()?;
    info!("oblivion running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    let open = engine.stop().await?;
    info!(open_connections = open, "shutdown complete");
    println!("{}", serde_json::to_string_pretty(&engine.metrics_snapshot())?);
    Ok(())
}

async fn eval(config: Config) -> Result<()> {
    let engine = Engine::new(config)?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut unit: TrafficUnit = match serde_json::from_str(line) {
            Ok(unit) => unit,
            Err(e) => {
                warn!(error = %e, "skipping malformed traffic unit");
                continue;
            }
        };
        let decision = engine.pipeline().decide(&mut unit).await;
        println!("{}", serde_json::to_string(&decision)?);
    }
    Ok(())
}
