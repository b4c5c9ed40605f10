//! escrow_hub service
//!
//! ```text
//! custody webhook ──▶ PaymentReconciler ──▶ obligations / ledger / trades
//!                             │
//!                             ▼
//! HTTP clients ──▶ gateway ──▶ EscrowAddressManager ──▶ custody provider
//!                             │
//!                      MaintenanceWorker (sweeps)
//!
//! HTTP clients ──▶ gateway ──▶ SessionRegistry ──▶ {data_dir}/{user}.json
//! ```

use std::sync::Arc;

use anyhow::Context;

use escrow_hub::config::AppConfig;
use escrow_hub::core_types::{Clock, SystemClock};
use escrow_hub::db::Database;
use escrow_hub::escrow::{CustodyClient, HttpCustodyClient, MockCustody};
use escrow_hub::gateway::{self, state::AppState};
use escrow_hub::logging;
use escrow_hub::worker::{MaintenanceWorker, WorkerConfig};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = logging::init_logging(&app_config);

    tracing::info!(env = %env, version = env!("CARGO_PKG_VERSION"), "Starting escrow_hub");

    let db = match &app_config.postgres_url {
        Some(url) => {
            let db = Database::connect_and_migrate(url)
                .await
                .context("Failed to prepare PostgreSQL")?;
            Some(Arc::new(db))
        }
        None => {
            tracing::warn!("postgres_url not set, running on in-memory stores");
            None
        }
    };

    let custody: Arc<dyn CustodyClient> = if app_config.custody.is_mock() {
        tracing::warn!("custody.base_url not set, using the mock custody provider");
        Arc::new(MockCustody::new())
    } else {
        Arc::new(
            HttpCustodyClient::new(&app_config.custody)
                .context("Failed to build custody client")?,
        )
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = Arc::new(AppState::build(&app_config, db, custody, clock.clone()));

    let worker = MaintenanceWorker::new(
        state.manager.clone(),
        state.obligations.clone(),
        clock,
        WorkerConfig::from_app(&app_config.escrow),
    )
    .with_sessions(state.sessions.clone());
    tokio::spawn(async move {
        worker.run().await;
    });

    let port = get_port_override().unwrap_or(app_config.gateway.port);
    gateway::run_server(&app_config.gateway.host, port, state).await
}
