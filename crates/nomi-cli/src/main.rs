use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use nomi_agent::room::WsRoomConnector;
use nomi_agent::worker::JobProcess;
use nomi_agent::{JobRequest, Worker, worker_options};
use nomi_core::config::Config;
use nomi_providers::jllm::{JLLM_AUTH_ENV, JLLM_URL};

mod logging;

#[derive(Parser)]
#[command(
    name = "nomi",
    about = "Nomi, a witty voice agent for multiplayer chat rooms",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent worker and join rooms
    Start {
        /// Room to join (repeatable; default: worker.rooms or "global")
        #[arg(short, long = "room")]
        rooms: Vec<String>,

        /// Room relay WebSocket URL (overrides room.url)
        #[arg(long)]
        url: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show agent status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    logging::init(&config.logging.clone().unwrap_or_default(), cli.verbose)?;

    match cli.command {
        Commands::Start { rooms, url } => {
            let (warnings, errors) = config.validate();
            for warning in &warnings {
                tracing::warn!("{warning}");
            }
            if !errors.is_empty() {
                for error in &errors {
                    tracing::error!("{error}");
                }
                anyhow::bail!("invalid configuration in {}", config_path.display());
            }
            run_worker(config, rooms, url).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Config OK");
            }
        },
        Commands::Status => {
            let credential = if std::env::var(JLLM_AUTH_ENV).is_ok() {
                JLLM_AUTH_ENV
            } else {
                "built-in default"
            };
            println!("Nomi v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Completions: {JLLM_URL} (credential: {credential})");
            println!(
                "Room relay: {}",
                config.room().url.as_deref().unwrap_or("not configured")
            );
            println!("Rooms: {}", config.startup_rooms().join(", "));
        }
    }

    Ok(())
}

async fn run_worker(config: Config, rooms: Vec<String>, url: Option<String>) -> anyhow::Result<()> {
    let mut room_config = config.room();
    if url.is_some() {
        room_config.url = url;
    }
    let connector = Arc::new(WsRoomConnector::from_config(&room_config)?);
    let rooms = if rooms.is_empty() {
        config.startup_rooms()
    } else {
        rooms
    };

    let cancel = CancellationToken::new();
    let (job_tx, job_rx) = mpsc::channel(rooms.len().max(1));
    for room in rooms {
        tracing::info!(room = %room, "Dispatching room job");
        job_tx.send(JobRequest::new(room)).await?;
    }
    drop(job_tx);

    let process = JobProcess::new(Arc::new(config));
    let worker = Worker::new(worker_options(connector), process).with_cancel_token(cancel.clone());
    let mut run = tokio::spawn(worker.run(job_rx));

    tokio::select! {
        result = &mut run => return result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Received Ctrl-C, shutting down");
            cancel.cancel();
        }
    }
    run.await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_with_rooms() {
        let cli = Cli::try_parse_from(["nomi", "-v", "start", "--room", "global", "-r", "lobby"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Start { rooms, url } => {
                assert_eq!(rooms, vec!["global", "lobby"]);
                assert!(url.is_none());
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["nomi", "config", "show", "--config", "/tmp/nomi.json"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("/tmp/nomi.json"));
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Show
            }
        ));
    }
}
