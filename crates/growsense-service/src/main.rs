//! GrowSense Service - HTTP API for plant sensors.
//!
//! Run with: `cargo run -p growsense-service`

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use growsense_service::{AppState, Config, api, config::default_config_path};
use growsense_store::Store;

/// GrowSense Service - HTTP REST API for plant sensors.
#[derive(Parser, Debug)]
#[command(name = "growsense-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long, global = true)]
    bind: Option<String>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the service in the foreground (default behavior).
    Run,

    /// Validate the configuration and exit.
    CheckConfig,

    /// Write a default configuration file if none exists.
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Command::CheckConfig) => check_config(&args),
        Some(Command::InitConfig) => init_config(&args),
        Some(Command::Run) | None => run_server(args).await,
    }
}

/// Load the configuration with CLI and environment overrides applied.
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(db_path) = &args.database {
        config.storage.path = db_path.clone();
    }
    config.apply_env();
    config.validate()?;

    Ok(config)
}

fn check_config(args: &Args) -> anyhow::Result<()> {
    let config = load_config(args)?;
    println!("Configuration OK");
    println!("  bind:     {}", config.server.bind);
    println!("  database: {}", config.storage.path.display());
    println!("  advice:   {:?}", config.advice.provider);
    println!("  users:    {}", config.security.users.len());
    Ok(())
}

fn init_config(args: &Args) -> anyhow::Result<()> {
    let path = args.config.clone().unwrap_or_else(default_config_path);
    if path.exists() {
        println!("Configuration already exists at {}", path.display());
        return Ok(());
    }
    Config::default().save(&path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

async fn run_server(args: Args) -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("growsense_service=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let config = load_config(&args)?;
    if config.security.users.is_empty() {
        warn!("No [[security.users]] configured; every user route will return 401");
    }

    // Open the database
    info!("Opening database at {:?}", config.storage.path);
    let store = Store::open(&config.storage.path)?;

    let addr: SocketAddr = config.server.bind.parse()?;
    let state = AppState::new(store, config);
    info!("Advice generator: {}", state.advisor.generator().name());

    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
