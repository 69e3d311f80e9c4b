//! labwarden CLI - watches lab servers and reclaims abandoned labs.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use labwarden::config::{MessagingArgs, ServiceArgs, Settings, StoreArgs};
use labwarden::platform::LabPlatform;
use labwarden::store::{grant_extension, RecordKey, RecordStore};
use labwarden::{CycleRunner, FileRecordStore, VirlClient};
use notify::{Identity, Messenger, WebexMessenger};

/// labwarden - warn lab owners about long-running labs and reclaim the ones
/// nobody extends.
#[derive(Parser)]
#[command(name = "labwarden")]
#[command(about = "Lab lifecycle monitor for VIRL / CML servers")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run cycles forever, sleeping between them
    Run(ServiceArgs),

    /// Run a single cycle and print its report (for cron use)
    Once(ServiceArgs),

    /// Print tracked lab records as JSON
    Records {
        #[command(flatten)]
        store: StoreArgs,

        /// Only records for this server
        #[arg(long)]
        server: Option<String>,
    },

    /// Extend a warned lab, restarting its countdown
    Renew {
        /// Server the lab runs on, as configured in SERVER_LIST
        #[arg(long)]
        server: String,

        /// Lab owner as known to the lab server (usually an e-mail)
        #[arg(long)]
        owner: String,

        /// Lab id
        #[arg(long)]
        lab: String,

        /// Messaging identity of the owner; looked up from --owner if omitted
        #[arg(long)]
        identity: Option<String>,

        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        messaging: MessagingArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match cli.command {
        Commands::Run(args) => {
            let settings = args.validate().context("Invalid configuration")?;
            let runner = build_runner(&settings).await?;
            info!(
                servers = ?settings.servers,
                alert_secs = settings.engine.thresholds.alert_secs(),
                dead_secs = settings.engine.thresholds.dead_secs(),
                interval_secs = settings.cycle_interval.as_secs(),
                termination = ?settings.engine.termination,
                "Starting labwarden"
            );
            runner.run_forever(settings.cycle_interval).await;
            Ok(())
        }
        Commands::Once(args) => {
            let settings = args.validate().context("Invalid configuration")?;
            let runner = build_runner(&settings).await?;
            let report = runner.run_cycle(Utc::now()).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Records { store, server } => {
            let records = open_store(&store.state_file)
                .await?
                .list(server.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        Commands::Renew {
            server,
            owner,
            lab,
            identity,
            store,
            messaging,
        } => {
            let identity = match identity {
                Some(identity) => Identity::new(identity),
                None => {
                    let settings = messaging.validate().context("Invalid configuration")?;
                    WebexMessenger::new(settings.token, settings.api_base, settings.timeout)?
                        .resolve_identity(&owner)
                        .await
                        .with_context(|| format!("Failed to resolve owner {owner}"))?
                }
            };

            let record_store = open_store(&store.state_file).await?;
            let key = RecordKey::new(server, identity, lab);
            let record = grant_extension(&record_store, &key, Utc::now())
                .await
                .context("Cannot extend lab")?;
            info!(
                server = %record.key.server_id,
                lab = %record.key.lab_id,
                owner = %owner,
                "Lab extended"
            );
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose {
        "labwarden=debug,notify=debug,info"
    } else {
        "labwarden=info,notify=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(filter);

    // stdout is reserved for command output
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

async fn open_store(path: &Path) -> Result<FileRecordStore> {
    FileRecordStore::open(path)
        .await
        .with_context(|| format!("Failed to open record store {}", path.display()))
}

async fn build_runner(settings: &Settings) -> Result<CycleRunner> {
    let store = open_store(&settings.state_file).await?;

    let messenger = WebexMessenger::new(
        settings.messaging.token.clone(),
        settings.messaging.api_base.clone(),
        settings.messaging.timeout,
    )
    .context("Failed to create Webex client")?;

    let mut platforms: Vec<Arc<dyn LabPlatform>> = Vec::with_capacity(settings.servers.len());
    for server in &settings.servers {
        let client = VirlClient::new(
            server.clone(),
            settings.credentials.clone(),
            settings.http_timeout(),
            settings.accept_invalid_certs,
        )
        .with_context(|| format!("Failed to create client for {server}"))?;
        platforms.push(Arc::new(client));
    }

    Ok(CycleRunner::new(
        platforms,
        Arc::new(messenger),
        Arc::new(store),
        settings.engine,
    ))
}
