//! meterlog command-line interface

mod config;
mod push;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use meterlog_ingest::IngestService;
use meterlog_storage::{MemoryReportStore, PgReportStore, ReportStore};
use meterlog_web::{AppState, BearerTokenAuth};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::push::{read_payload, PayloadKind, PushClient};

#[derive(Debug, Parser)]
#[command(name = "meterlog")]
#[command(about = "Flow-meter batch report recorder")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run migrations, check the natural-key index, and serve the HTTP API.
    Serve {
        /// Keep reports in process memory instead of PostgreSQL.
        #[arg(long)]
        in_memory: bool,
    },
    /// Apply migrations and create the natural-key index.
    Migrate,
    /// POST a JSON payload file to a running server.
    Push {
        file: PathBuf,
        #[arg(long, default_value = "http://127.0.0.1:8000")]
        url: String,
        /// The file holds a single report rather than a batch submission.
        #[arg(long)]
        single: bool,
        #[arg(long, env = "METERLOG_TOKEN")]
        token: Option<String>,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve { in_memory: false }) {
        Commands::Serve { in_memory } => {
            let config = AppConfig::load().context("loading configuration")?;
            serve(config, in_memory).await?;
        }
        Commands::Migrate => {
            let config = AppConfig::load().context("loading configuration")?;
            let store = connect(&config).await?;
            let state = store
                .ensure_key_index()
                .await
                .context("creating natural-key index")?;
            println!("migrations applied; natural-key index: {state:?}");
        }
        Commands::Push {
            file,
            url,
            single,
            token,
            timeout_secs,
        } => {
            let payload = read_payload(&file)?;
            let kind = if single {
                PayloadKind::Single
            } else {
                PayloadKind::Batch
            };
            let client = PushClient::new(&url, token, Duration::from_secs(timeout_secs))?;
            let response = client
                .push(kind, &payload)
                .await
                .with_context(|| format!("pushing {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}

async fn connect(config: &AppConfig) -> Result<PgReportStore> {
    let Some(url) = config.database.url.as_deref() else {
        bail!("DATABASE_URL not set (database not configured)");
    };
    let store = PgReportStore::connect(&config.database.store_config(url))
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

async fn serve(config: AppConfig, in_memory: bool) -> Result<()> {
    let store: Option<Arc<dyn ReportStore>> = if in_memory {
        info!("serving from the in-memory report store");
        Some(Arc::new(MemoryReportStore::new()))
    } else if config.database.url.is_some() {
        Some(Arc::new(connect(&config).await?))
    } else {
        warn!("no database configured; report endpoints will answer 500");
        None
    };

    let ingest = match store {
        Some(store) => Some(
            IngestService::bootstrap(store, config.ingest.clone())
                .await
                .context("checking natural-key index")?,
        ),
        None => None,
    };

    let mut state = AppState::new(ingest);
    if let Some(token) = &config.auth.bearer_token {
        state = state.with_auth(BearerTokenAuth::new(token.clone()));
    }
    meterlog_web::serve(config.server.addr()?, state).await
}
