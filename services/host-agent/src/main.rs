//! kiln Host Agent
//!
//! Runs the reconciliation controller for the microVMs declared on this
//! host. Specs live in the local SQLite database; the API layer that writes
//! them shares the process through the event bus.

use std::sync::Arc;

use anyhow::{Context, Result};
use kiln_agent::config::{Config, NetworkBackend};
use kiln_agent::mock::{
    CallLog, MockDiskService, MockImageService, MockNetworkService, MockProvider,
};
use kiln_agent::network::TapNetworkService;
use kiln_agent::ports::NetworkService;
use kiln_agent::{
    Controller, ControllerError, Executor, PlanContext, ProviderRegistry, SqliteRepository,
};
use kiln_events::EventBus;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        data_dir = %config.data_dir.display(),
        state_db = %config.state_db.display(),
        default_provider = %config.default_provider,
        network_backend = ?config.network_backend,
        disable_reconcile = config.reconcile.disable_reconcile,
        "Starting kiln host agent"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let repo = Arc::new(
        SqliteRepository::open(&config.state_db)
            .with_context(|| format!("opening state db {}", config.state_db.display()))?,
    );

    // Hypervisor, image and disk adapters are mocks for now
    let log = CallLog::new();
    let providers = ProviderRegistry::new().with(Arc::new(MockProvider::new(
        config.default_provider.clone(),
        log.clone(),
    )));
    let network: Arc<dyn NetworkService> = match config.network_backend {
        NetworkBackend::Mock => Arc::new(MockNetworkService::new(log.clone())),
        NetworkBackend::Tap => Arc::new(TapNetworkService::new()),
    };
    let executor = Executor::new(
        network,
        Arc::new(MockImageService::new(log.clone())),
        Arc::new(MockDiskService::new(log)),
    );

    let bus = EventBus::new();
    let controller = Controller::new(
        config.reconcile.clone(),
        repo,
        providers,
        executor,
        bus.clone(),
        PlanContext {
            data_dir: config.data_dir.clone(),
            bridge_name: config.bridge_name.clone(),
        },
    );

    let cancel = CancellationToken::new();
    let mut controller_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { controller.run(cancel).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            bus.close();
            controller_exit(result)?;
            info!("Controller exited");
            return Ok(());
        }
    }

    cancel.cancel();
    let result = controller_exit(controller_handle.await);
    bus.close();
    result?;

    info!("Host agent shutdown complete");
    Ok(())
}

/// Turn the controller task's result into the process result.
fn controller_exit(result: Result<Result<(), ControllerError>, JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "Controller failed");
            Err(e).context("controller stopped with an error")
        }
        Err(e) => {
            error!(error = %e, "Controller task panicked");
            Err(e).context("controller task panicked")
        }
    }
}
