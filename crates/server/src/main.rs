//! CLI driver.
//!
//! Exit codes: 0 success, 1 invalid input, 2 store unavailable, 3 queue
//! unavailable, 4 LLM runtime unavailable, 64 usage error.

mod api;
mod doc;
mod router;
mod startup;
mod state;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mailpipe_core::config::{load_dotenv, Config};
use mailpipe_core::OpCtx;
use mailpipe_ingest::IngestPort;

use startup::ServeError;

const EXIT_OK: u8 = 0;
const EXIT_INVALID_INPUT: u8 = 1;
const EXIT_STORE_UNAVAILABLE: u8 = 2;
const EXIT_QUEUE_UNAVAILABLE: u8 = 3;
const EXIT_LLM_UNAVAILABLE: u8 = 4;
const EXIT_USAGE: u8 = 64;

#[derive(Parser)]
#[command(name = "mailpipe-server", about = "Adaptive three-phase email analysis pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server and worker pools (default).
    Serve,
    /// Backfill a JSON file of normalized email records.
    Import {
        /// Path to a JSON array of normalized email records.
        file: PathBuf,
    },
    /// Probe the three backends and exit with the matching code.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help/version are not usage errors.
            if e.use_stderr() {
                eprintln!("{}", e);
                return ExitCode::from(EXIT_USAGE);
            }
            println!("{}", e);
            return ExitCode::from(EXIT_OK);
        }
    };

    let config = Config::from_env();
    let code = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Import { file } => import(config, file).await,
        Command::Check => check(config).await,
    };
    ExitCode::from(code)
}

async fn serve(config: Config) -> u8 {
    match startup::serve(config).await {
        Ok(()) => EXIT_OK,
        Err(ServeError::Store(msg)) => {
            error!(%msg, "store unavailable");
            EXIT_STORE_UNAVAILABLE
        }
        Err(ServeError::Queue(msg)) => {
            error!(%msg, "queue unavailable");
            EXIT_QUEUE_UNAVAILABLE
        }
        Err(ServeError::Other(msg)) => {
            error!(%msg, "server failed");
            EXIT_INVALID_INPUT
        }
    }
}

/// Resumable batch backfill: ingest is idempotent on message id, so a
/// partially imported file can simply be imported again.
async fn import(config: Config, file: PathBuf) -> u8 {
    let raw = match std::fs::read_to_string(&file) {
        Ok(raw) => raw,
        Err(e) => {
            error!(file = %file.display(), error = %e, "cannot read import file");
            return EXIT_INVALID_INPUT;
        }
    };
    let records: Vec<mailpipe_core::email::NormalizedEmail> = match serde_json::from_str(&raw) {
        Ok(records) => records,
        Err(e) => {
            error!(file = %file.display(), error = %e, "import file is not a JSON array of emails");
            return EXIT_INVALID_INPUT;
        }
    };

    let backends = match startup::connect_backends(&config).await {
        Ok(b) => b,
        Err(ServeError::Store(msg)) => {
            error!(%msg, "store unavailable");
            return EXIT_STORE_UNAVAILABLE;
        }
        Err(ServeError::Queue(msg)) => {
            error!(%msg, "queue unavailable");
            return EXIT_QUEUE_UNAVAILABLE;
        }
        Err(ServeError::Other(msg)) => {
            error!(%msg, "backend setup failed");
            return EXIT_INVALID_INPUT;
        }
    };

    let ingest = IngestPort::new(
        backends.store,
        backends.queue,
        backends.chains,
        backends.metrics,
    );
    let ctx = OpCtx::new();
    let results = ingest.ingest_batch(&ctx, &records).await;

    let accepted = results.iter().filter(|r| r.status == "pending").count();
    let duplicates = results.iter().filter(|r| r.status == "duplicate").count();
    let rejected = results.iter().filter(|r| r.status == "rejected").count();
    info!(
        total = records.len(),
        accepted, duplicates, rejected, "import finished"
    );
    for r in results.iter().filter(|r| r.status == "rejected") {
        error!(message_id = %r.internet_message_id, error = ?r.error, "record rejected");
    }

    if rejected > 0 { EXIT_INVALID_INPUT } else { EXIT_OK }
}

/// Backend reachability probe for operators and scripts.
async fn check(config: Config) -> u8 {
    let backends = match startup::connect_backends(&config).await {
        Ok(b) => b,
        Err(ServeError::Store(msg)) => {
            error!(%msg, "store unreachable");
            return EXIT_STORE_UNAVAILABLE;
        }
        Err(ServeError::Queue(msg)) => {
            error!(%msg, "queue unreachable");
            return EXIT_QUEUE_UNAVAILABLE;
        }
        Err(ServeError::Other(msg)) => {
            error!(%msg, "check failed");
            return EXIT_INVALID_INPUT;
        }
    };

    if backends.store.ping().await.is_err() {
        return EXIT_STORE_UNAVAILABLE;
    }
    if backends.queue.ping().await.is_err() {
        return EXIT_QUEUE_UNAVAILABLE;
    }
    let adapter = startup::build_adapter(&config, backends.metrics);
    if !adapter.ping().await {
        error!("LLM runtime unreachable");
        return EXIT_LLM_UNAVAILABLE;
    }
    info!("store, queue, and LLM runtime reachable");
    EXIT_OK
}
