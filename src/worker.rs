//! Maintenance Worker
//!
//! Background sweeper that purges dead escrow addresses, expires
//! obligations nobody paid and drops stale payment sessions.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::EscrowConfig;
use crate::core_types::Clock;
use crate::escrow::EscrowAddressManager;
use crate::reconcile::ObligationStore;
use crate::session::SessionRegistry;
use crate::store::with_retry;

/// Configuration for the maintenance worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to sweep
    pub sweep_interval: Duration,
    /// Age after which a pending obligation expires
    pub obligation_ttl: chrono::Duration,
    pub storage_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            obligation_ttl: chrono::Duration::hours(24),
            storage_retries: 3,
        }
    }
}

impl WorkerConfig {
    pub fn from_app(escrow: &EscrowConfig) -> Self {
        Self {
            sweep_interval: escrow.sweep_interval(),
            obligation_ttl: escrow.obligation_ttl(),
            storage_retries: escrow.storage_retries,
        }
    }
}

/// Counts from one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub addresses_purged: u64,
    pub obligations_expired: u64,
    pub sessions_purged: u64,
}

pub struct MaintenanceWorker {
    manager: Arc<EscrowAddressManager>,
    obligations: Arc<dyn ObligationStore>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    sessions: Option<Arc<SessionRegistry>>,
}

impl MaintenanceWorker {
    pub fn new(
        manager: Arc<EscrowAddressManager>,
        obligations: Arc<dyn ObligationStore>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            manager,
            obligations,
            clock,
            config,
            sessions: None,
        }
    }

    /// Also purge expired sessions on every sweep
    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Run the sweep loop forever
    pub async fn run(&self) -> ! {
        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            obligation_ttl_secs = self.config.obligation_ttl.num_seconds(),
            "Starting maintenance worker"
        );

        loop {
            self.sweep_once().await;
            tokio::time::sleep(self.config.sweep_interval).await;
        }
    }

    /// Run a single sweep. A failing step is logged and does not stop the
    /// others.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.manager.expire_stale().await {
            Ok(n) => report.addresses_purged = n,
            Err(e) => error!(error = %e, "Escrow address purge failed"),
        }

        let cutoff = self.clock.now() - self.config.obligation_ttl;
        match with_retry(self.config.storage_retries, "expire_pending", || {
            self.obligations.expire_pending(cutoff)
        })
        .await
        {
            Ok(n) => report.obligations_expired = n,
            Err(e) => error!(error = %e, "Obligation expiry failed"),
        }

        if let Some(sessions) = &self.sessions {
            report.sessions_purged = sessions.purge_expired() as u64;
        }

        if report == SweepReport::default() {
            debug!("Nothing to sweep");
        } else {
            info!(
                addresses_purged = report.addresses_purged,
                obligations_expired = report.obligations_expired,
                sessions_purged = report.sessions_purged,
                "Maintenance sweep done"
            );
        }
        report
    }
}
