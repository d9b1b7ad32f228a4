//! Keel - declarative control plane for external infrastructure
//!
//! Usage:
//!   # All configuration from the environment (DB_PASSWORD is required)
//!   keeld
//!
//!   # Override the API bind address
//!   keeld --bind 127.0.0.1 --port 9000
//!
//! The daemon connects to PostgreSQL, applies pending schema migrations,
//! then runs the HTTP API, the event bus, and the reconciliation scheduler
//! until SIGINT/SIGTERM.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keel_admission::AdmissionChain;
use keel_controller::{ActionRegistry, ReconcilerContext, ReconcilerRegistry, Scheduler};
use keel_core::bus::EventBus;
use keel_core::config::Config;
use keel_server::{serve, AppState, WriteGateway};
use keel_store::{PgStore, Store};

#[derive(Parser, Debug)]
#[command(name = "keeld", version, about = "Keel control plane daemon")]
struct Cli {
    /// Bind address for the HTTP API (overrides API_BIND)
    #[arg(long)]
    bind: Option<String>,

    /// Port for the HTTP API (overrides API_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Log level filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Extension point for reconcilers compiled into this binary.
///
/// The stock daemon ships none; deployments embed their own, e.g.:
/// `registry.register(Arc::new(TerraformReconciler::new(...)))?`.
fn build_registry() -> keel_controller::Result<ReconcilerRegistry> {
    let registry = ReconcilerRegistry::new();
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env()?;
    if let Some(bind) = cli.bind {
        config.api.bind_address = bind;
    }
    if let Some(port) = cli.port {
        config.api.port = port;
    }

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting keeld");

    let pg = PgStore::connect(&config.db).await?;
    pg.migrate().await?;
    let store: Arc<dyn Store> = Arc::new(pg);

    let bus = Arc::new(EventBus::default());
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let registry = Arc::new(build_registry()?);
    if registry.is_empty() {
        warn!("No reconcilers registered; resource creation will be rejected");
    }

    let actions = Arc::new(ActionRegistry::new());
    let context = Arc::new(ReconcilerContext::new(
        store.clone(),
        actions,
        config.controller.drift_interval(),
        shutdown_tx.clone(),
    ));
    let admission = Arc::new(AdmissionChain::new(store.clone()));
    let gateway = Arc::new(WriteGateway::new(
        store.clone(),
        bus.clone(),
        admission,
        registry.clone(),
    ));
    let scheduler = Scheduler::new(
        store.clone(),
        bus.clone(),
        registry.clone(),
        context.clone(),
        config.controller.clone(),
        shutdown_tx.clone(),
    );

    let reconciler_handles = registry.start_all(context);

    let api_state = AppState {
        store,
        bus: bus.clone(),
        gateway,
    };
    let api_config = config.api.clone();
    let api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = serve(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server exited with error");
        }
    });

    let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received; stopping");
    let _ = shutdown_tx.send(());

    let grace = config.controller.shutdown_grace();
    registry.stop_all(reconciler_handles, grace).await;

    for (name, handle) in [("scheduler", scheduler_handle), ("api", api_handle)] {
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task = name, error = %e, "Task panicked during shutdown"),
            Err(_) => warn!(task = name, "Task did not stop within the grace period"),
        }
    }

    bus.shutdown();
    info!("keeld stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
