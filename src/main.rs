use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sentra::api::{create_router, AppState};
use sentra::engine::recovery::RecoveryLoop;
use sentra::engine::scheduler::WorkerEngine;
use sentra::engine::EngineContext;
use sentra::gateway::{GatewayBars, GatewayClient, GatewayProbe, PaperGateway};
use sentra::marketdata::MarketDataCache;
use sentra::rules::RulesConfig;
use sentra::store::SentraStore;
use sentra::AppConfig;

#[derive(Parser)]
#[command(name = "sentra", about = "Conditional-trading execution engine")]
struct Args {
    /// Path to the app config TOML
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the database and exit
    InitDb,
    /// Run the engine and API server (default)
    Serve,
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load_from(&args.config)?;
    init_tracing(&config);

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!("config error: {problem}");
        }
        anyhow::bail!("invalid configuration ({} problems)", problems.len());
    }

    let store = SentraStore::connect(
        &config.runtime.resolved_db_path(),
        config.limits.max_conditions_per_strategy,
    )
    .await?;
    store.migrate().await?;

    if let Command::InitDb = args.command.unwrap_or(Command::Serve) {
        info!("database initialized");
        return Ok(());
    }

    if config.ib_gateway.is_live() {
        warn!("trading_mode=live configured; this build ships the paper gateway adapter only");
    }
    let gateway: Arc<dyn GatewayClient> = Arc::new(PaperGateway::new(true));
    let probe = GatewayProbe::new(
        &config.ib_gateway.host,
        config.ib_gateway.api_port(),
        config.ib_gateway.timeout_seconds,
    );

    let cache = Arc::new(
        MarketDataCache::connect(
            &config.runtime.resolved_market_cache_db_path(),
            Arc::new(GatewayBars::new(gateway.clone())),
        )
        .await?,
    );

    let rules_path = config
        .runtime
        .condition_rules_path
        .clone()
        .unwrap_or_else(|| "config/condition_rules.json".to_string());
    let rules = RulesConfig::load_from(Some(std::path::Path::new(&rules_path)))?;

    let ctx = Arc::new(EngineContext::new(
        store,
        cache,
        gateway,
        Some(probe),
        config.clone(),
        rules,
    ));

    RecoveryLoop::run(&ctx).await?;

    let engine = WorkerEngine::new(ctx.clone());
    engine.start_if_enabled();

    let app = create_router(AppState::new(ctx, engine.clone()));
    let address = format!("0.0.0.0:{}", config.api_port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(address, "api server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    engine.stop();
    Ok(())
}
