//! Heatline CLI
//!
//! - `serve`: run the fan-out hub
//! - `record`: record a hub endpoint to a file
//! - `replay`: serve a recording to websocket clients
//! - `config`: print the default configuration

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use heatline::broker::MemoryBroker;
use heatline::config::{generate_default_config, Config, LoggingConfig};
use heatline::hub::{self, AppState};
use heatline::recorder::{self, ReplayState};
use heatline::source::Source;

#[derive(Parser)]
#[command(name = "heatline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Live competition event hub")]
#[command(long_about = "Heatline follows competition, distance and heat activations on a message broker\nand pushes the raw events to websocket clients.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the fan-out hub
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// JSON-lines file to seed the memory broker with
        #[arg(long)]
        seed: Option<PathBuf>,
    },

    /// Record frames from a hub endpoint
    Record {
        /// Competition ID to record (default: the competition list)
        #[arg(long)]
        competition: Option<String>,
        /// Hub base URL
        #[arg(long)]
        url: Option<String>,
        /// Recording file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Replay a recording to websocket clients
    Replay {
        /// Recording file
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Divide the waits between frames by this factor
        #[arg(short, long)]
        speed: Option<u32>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("Failed to write {:?}", path))?;
                println!("Wrote default config to {:?}", path);
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default()?,
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { port, seed } => {
            if let Some(port) = port {
                config.hub.port = port;
            }
            if let Some(seed) = seed {
                config.broker.seed_file = Some(seed.to_string_lossy().to_string());
            }
            run_hub(config).await
        }
        Commands::Record {
            competition,
            url,
            file,
        } => {
            if competition.is_some() {
                config.recorder.competition = competition;
            }
            if let Some(url) = url {
                config.recorder.url = url;
            }
            if let Some(file) = file {
                config.recorder.file = file.to_string_lossy().to_string();
            }
            run_record(config).await
        }
        Commands::Replay { file, speed, port } => {
            if let Some(file) = file {
                config.recorder.file = file.to_string_lossy().to_string();
            }
            if let Some(speed) = speed {
                config.recorder.speed = speed;
            }
            if let Some(port) = port {
                config.recorder.port = port;
            }
            config.validate()?;
            run_replay(config).await
        }
        Commands::Config { .. } => Ok(()),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("heatline={},tower_http=info", logging.level).into()
    });
    let registry = tracing_subscriber::registry().with(filter);

    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run_hub(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting Heatline hub v{}", env!("CARGO_PKG_VERSION"));

    let broker = Arc::new(MemoryBroker::new());
    if let Some(seed) = &config.broker.seed_file {
        broker
            .load_seed(Path::new(seed))
            .await
            .with_context(|| format!("Failed to seed broker from {}", seed))?;
    }

    let source = Source::new(broker);
    // Root-level source failure is fatal: probe it before accepting clients.
    let probe = CancellationToken::new();
    source
        .competition_activations(&probe, config.hub.history())
        .await
        .context("Failed to subscribe to competition activations")?;
    probe.cancel();

    let state = AppState::new(source, config.hub.clone());
    hub::serve(state).await?;
    Ok(())
}

async fn run_record(config: Config) -> anyhow::Result<()> {
    let url = config.recorder.endpoint();
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        hub::shutdown_signal().await;
        signal_token.cancel();
    });

    let stats = recorder::record(&url, Path::new(&config.recorder.file), &token)
        .await
        .with_context(|| format!("Failed to record {}", url))?;
    println!("Recorded {} frames ({} skipped)", stats.frames, stats.skipped);
    Ok(())
}

async fn run_replay(config: Config) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.recorder.addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.recorder.addr()))?;
    let state = ReplayState::new(
        &config.recorder.file,
        config.recorder.speed,
        config.hub.keepalive(),
    );
    recorder::replay::serve_on(listener, state, hub::shutdown_signal()).await?;
    Ok(())
}
