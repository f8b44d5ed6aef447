//! Operator entry point (§6 "CLI surface"), grounded on `xtask::Cli`/`Commands`:
//! one `clap::Parser` binary, one subcommand per operational concern, a
//! diagnostic on `Err` and a non-zero exit courtesy of `main`'s own
//! `Result` return.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::RangerConfig;
use ranger_datastore::Datastore;
use ranger_flows::FlowRegistry;
use ranger_foreman::Foreman;
use ranger_proto::Subject;
use ranger_queue::QueueManager;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ranger")]
#[command(about = "Fleet forensics engine: worker, frontend, and operator tooling")]
struct Cli {
    /// Optional TOML config file; falls back to `RANGER_`-prefixed env vars.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sanity-check the configuration and the flow registry this binary
    /// would serve.
    Build,
    /// Provision the configured datastore (runs migrations against
    /// `database_url`; a no-op against the in-memory backend).
    Deploy,
    /// Run a worker loop claiming from one queue.
    Worker {
        #[arg(long)]
        queue: Option<String>,
    },
    /// Run the client check-in HTTP endpoint.
    Frontend {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Dump one session's results collection to a file.
    Export {
        /// Datastore subject the results live on, e.g. `flows/F:abc123`.
        #[arg(long)]
        collection: String,
        #[arg(long)]
        output: PathBuf,
    },
}

/// `ranger-datastore`'s two backends behind one trait object: Postgres when
/// `database_url` is configured, otherwise an in-process store.
async fn open_datastore(config: &RangerConfig) -> anyhow::Result<Arc<dyn Datastore>> {
    match &config.database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .connect(url)
                .await
                .with_context(|| format!("connecting to datastore at {url}"))?;
            Ok(Arc::new(ranger_datastore::postgres::PostgresDatastore::new(pool)))
        }
        None => {
            tracing::warn!("no database_url configured, running against an in-memory datastore");
            Ok(Arc::new(ranger_datastore::in_memory::InMemoryDatastore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("ranger=info,tower_http=info,warn").init();

    let cli = Cli::parse();
    let config = RangerConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Build => build(&config).await,
        Commands::Deploy => deploy(&config).await,
        Commands::Worker { queue } => worker(&config, queue).await,
        Commands::Frontend { bind } => frontend(&config, bind).await,
        Commands::Export { collection, output } => export(&config, &collection, &output).await,
    }
}

/// Flow classes this deployment serves are registered by whoever embeds
/// this engine — the collection-action catalog itself is explicitly out of
/// scope here, so `build` validates an empty registry rather than a real
/// one. A deployment with real flow classes replaces this with its own
/// `FlowRegistry::register` calls before handing the registry to
/// `worker`/`frontend`.
fn registry() -> FlowRegistry {
    FlowRegistry::new()
}

async fn build(config: &RangerConfig) -> anyhow::Result<()> {
    let registry = registry();
    println!("config OK: worker_queue={}, bind_addr={}", config.worker_queue, config.bind_addr);
    println!("flow registry OK: {} flow class(es) registered", registry.len());
    Ok(())
}

async fn deploy(config: &RangerConfig) -> anyhow::Result<()> {
    match &config.database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .connect(url)
                .await
                .with_context(|| format!("connecting to datastore at {url}"))?;
            let datastore = ranger_datastore::postgres::PostgresDatastore::new(pool);
            datastore.run_migrations().await.context("running datastore migrations")?;
            println!("migrations applied to {url}");
        }
        None => println!("no database_url configured; nothing to deploy against an in-memory datastore"),
    }
    Ok(())
}

async fn worker(config: &RangerConfig, queue: Option<String>) -> anyhow::Result<()> {
    let datastore = open_datastore(config).await?;
    let queue_manager = Arc::new(QueueManager::new(datastore.clone()));
    let registry = Arc::new(registry());

    let queue_name = queue.unwrap_or_else(|| config.worker_queue.clone());
    let mut worker_config = ranger_worker::WorkerConfig::new(queue_name);
    worker_config.claim_batch_size = config.claim_batch_size;

    let worker = Arc::new(ranger_worker::Worker::new(datastore, queue_manager, registry, worker_config));
    worker.run().await.context("worker loop")?;
    Ok(())
}

async fn frontend(config: &RangerConfig, bind: Option<String>) -> anyhow::Result<()> {
    let datastore = open_datastore(config).await?;
    let queue_manager = Arc::new(QueueManager::new(datastore.clone()));
    let message_router = Arc::new(ranger_flows::MessageRouter::new(datastore.clone(), queue_manager.clone(), config.worker_queue.clone()));
    let foreman = Arc::new(Foreman::new(datastore.clone(), queue_manager.clone()));

    let state = ranger_frontend::AppState::new(
        datastore,
        queue_manager,
        message_router,
        foreman,
        Arc::new(ranger_frontend::AcceptAllVerifier),
        ranger_frontend::FrontendConfig::default(),
    );

    let bind_addr = bind.unwrap_or_else(|| config.bind_addr.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!(%bind_addr, "frontend listening");
    axum::serve(listener, ranger_frontend::router(state)).await.context("frontend server")?;
    Ok(())
}

async fn export(config: &RangerConfig, collection: &str, output: &PathBuf) -> anyhow::Result<()> {
    let datastore = open_datastore(config).await?;
    let subject = Subject::new(collection.to_string());
    let attrs = datastore
        .resolve_regex(&subject, "^results:", ranger_proto::ReadMode::Newest, None)
        .await
        .with_context(|| format!("reading results collection `{collection}`"))?;

    let mut lines = String::new();
    for attr in &attrs {
        let payload: ranger_proto::TypedPayload = serde_json::from_slice(&attr.value).with_context(|| format!("decoding result on `{collection}`"))?;
        lines.push_str(&serde_json::to_string(&payload)?);
        lines.push('\n');
    }

    tokio::fs::write(output, lines).await.with_context(|| format!("writing {}", output.display()))?;
    println!("wrote {} result(s) from `{collection}` to {}", attrs.len(), output.display());
    Ok(())
}
