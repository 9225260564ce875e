//! Root assembler: wires the runtime adapter, sandbox manager, pool,
//! session registry, and health probes from environment configuration,
//! then serves the boundary HTTP demonstration.

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

use clap::{Parser, Subcommand};
use liberator::config::{self, Config};
use liberator::coordinator::ExecutionCoordinator;
use liberator::health::HealthProbes;
use liberator::http;
use liberator::pool::Pool;
use liberator::runtime::local::LocalRuntime;
use liberator::sandbox_manager::SandboxManager;
use liberator::security::FilePolicy;
use liberator::session::SessionRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "liberator")]
#[command(about = "Multi-language code execution dispatch service")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server.
    Serve {
        #[arg(long, default_value = "8080")]
        port: u16,
        #[arg(long, default_value = "/var/lib/liberator")]
        base_dir: PathBuf,
    },
    /// Validate configuration and print the resulting report without serving.
    CheckConfig,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let config = Config::from_env();

    match args.command {
        Commands::CheckConfig => {
            let report = config::validate(&config);
            for w in &report.warnings {
                tracing::warn!("{w}");
            }
            for e in &report.errors {
                error!("{e}");
            }
            std::process::exit(if report.is_ok() { 0 } else { 1 });
        }
        Commands::Serve { port, base_dir } => {
            if !nix::unistd::geteuid().is_root() {
                eprintln!("Error: must run as root (needed for sandbox namespaces)");
                std::process::exit(1);
            }

            let report = config::validate(&config);
            for w in &report.warnings {
                tracing::warn!("{w}");
            }
            if !report.is_ok() {
                for e in &report.errors {
                    error!("{e}");
                }
                std::process::exit(1);
            }

            run_server(port, base_dir, config).await;
        }
    }
}

async fn run_server(port: u16, base_dir: PathBuf, config: Config) {
    let runtime = Arc::new(LocalRuntime::new(base_dir, config.image.registry.clone(), config.image.per_language_overrides.clone()));

    let manager = match SandboxManager::new(runtime, config.clone()) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            error!(error = %e, "failed to construct sandbox manager");
            std::process::exit(1);
        }
    };

    let pool = Arc::new(Pool::new(manager.clone(), &config.pool_target_sizes, config.warmup_on_startup));
    pool.warmup_all().await;
    let _refill_handle = liberator::pool::spawn_refill_loop(pool.clone(), Duration::from_secs(2));

    let sessions = SessionRegistry::new(Duration::from_secs(300));
    let sweep_sessions = sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let expired = sweep_sessions.sweep_expired().await;
            if !expired.is_empty() {
                info!(count = expired.len(), "swept expired sessions");
            }
        }
    });

    let coordinator = Arc::new(ExecutionCoordinator::new(sessions.clone(), pool.clone(), manager.clone(), FilePolicy::default_policy()));
    let health = Arc::new(HealthProbes::new(None, None, Some(pool.clone())));

    let state = http::AppState { sessions, coordinator, health };
    let app = http::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting liberator");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("bind address");
    axum::serve(listener, app).await.expect("serve");
}
