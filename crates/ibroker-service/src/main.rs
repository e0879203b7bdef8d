use clap::{Parser, ValueEnum};
use ibroker_core::{StoreConfig, WorkflowConfig};
use ibroker_service::{build_router, sweep::spawn_expiry_sweep, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "ibrokerd", version, about = "iBroker workflow engine REST service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8094
    #[arg(long, default_value = "127.0.0.1:8094")]
    listen: SocketAddr,
    /// Record store backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StoreMode::Auto, env = "IBROKER_STORE")]
    store: StoreMode,
    /// PostgreSQL url for record persistence.
    #[arg(long, env = "IBROKER_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "IBROKER_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Seconds between expiry sweep passes.
    #[arg(long, default_value_t = 120, env = "IBROKER_SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,
    /// SLA window (hours) for the first agent response.
    #[arg(long, default_value_t = 24)]
    sla_response_hours: i64,
    /// Coverage tenure (months) stamped at activation.
    #[arg(long, default_value_t = 12)]
    tenure_months: u32,
}

fn resolve_store(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let store = match cli.store {
        StoreMode::Memory => StoreConfig::Memory,
        StoreMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("store=postgres requires --database-url or DATABASE_URL")
            })?;
            StoreConfig::postgres(database_url, cli.pg_max_connections)
        }
        StoreMode::Auto => match resolved_url {
            Some(database_url) => StoreConfig::postgres(database_url, cli.pg_max_connections),
            None => StoreConfig::Memory,
        },
    };

    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ibroker_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let store = resolve_store(&cli)?;
    info!(backend = store.label(), "record store selected");

    let workflow = WorkflowConfig {
        sla_response_hours: cli.sla_response_hours,
        tenure_months: cli.tenure_months,
        ..WorkflowConfig::default()
    };
    let state = ServiceState::bootstrap(ServiceConfig {
        store,
        workflow,
        seed_catalog: Vec::new(),
    })
    .await?;

    let sweep = spawn_expiry_sweep(
        state.engine.clone(),
        Duration::from_secs(cli.sweep_interval_secs.max(1)),
    );

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("ibroker-service REST listening on {}", listener.local_addr()?);

    let served = axum::serve(listener, app).await;
    sweep.abort();
    served?;

    Ok(())
}
