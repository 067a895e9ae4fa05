//! Main entry point for the xdb server.
//!
//! Starts the API service, the async service, or both, with configuration
//! from a YAML file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use xdb::config::{Config, LogConfig, LogFormat};
use xdb::engine::{HttpNotifier, InProcessNotifier, TaskNotifier};
use xdb::persistence::{postgres, PgProcessStore};
use xdb::service::{ApiServer, ApiState, AsyncService};

const API_SERVICE_NAME: &str = "api";
const ASYNC_SERVICE_NAME: &str = "async";

/// CLI args for the xdb server.
#[derive(Parser, Debug)]
#[command(name = "xdb-server", about = "Run the xdb process execution engine.")]
struct Args {
    /// Path to the YAML config file.
    #[arg(long)]
    config: PathBuf,

    /// Comma-separated services to start (api, async).
    #[arg(long, default_value = "api,async")]
    service: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("unable to load config from {}", args.config.display()))?;
    init_tracing(&config.log);
    info!(config_path = %args.config.display(), "config loaded");

    let services: Vec<&str> = args
        .service
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if services.is_empty() {
        bail!("no services specified for starting");
    }
    for service in &services {
        if *service != API_SERVICE_NAME && *service != ASYNC_SERVICE_NAME {
            bail!("unsupported service {service}");
        }
    }
    let run_api = services.contains(&API_SERVICE_NAME);
    let run_async = services.contains(&ASYNC_SERVICE_NAME);

    let pool = postgres::connect(
        &config.database.sql.url,
        config.database.sql.max_connections,
    )
    .await
    .context("error on persistence setup")?;
    postgres::apply_schema(&pool)
        .await
        .context("error applying storage schema")?;
    info!("database ready");

    let store = Arc::new(PgProcessStore::new(pool));

    let in_process_notifier = Arc::new(InProcessNotifier::new());
    let mut async_service = None;
    if run_async {
        async_service = Some(
            AsyncService::start(
                &config.async_service,
                store.clone(),
                in_process_notifier.clone(),
            )
            .await?,
        );
    }

    let mut api_server = None;
    if run_api {
        // with the async service in-process the nudge is a direct wake;
        // otherwise it goes over HTTP to the async service
        let notifier: Arc<dyn TaskNotifier> = if run_async {
            in_process_notifier.clone()
        } else {
            Arc::new(HttpNotifier::new(format!(
                "http://127.0.0.1:{}",
                config.async_service.port
            )))
        };
        api_server = Some(
            ApiServer::start(
                config.api_service.port,
                ApiState {
                    store: store.clone(),
                    notifier,
                },
            )
            .await?,
        );
    }

    info!(services = ?services, "xdb server started, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    if let Some(api_server) = api_server {
        api_server.stop().await;
    }
    if let Some(async_service) = async_service {
        async_service.stop().await;
    }

    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    match log.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}
