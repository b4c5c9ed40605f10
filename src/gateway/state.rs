use std::sync::Arc;

use crate::config::AppConfig;
use crate::core_types::Clock;
use crate::db::Database;
use crate::escrow::{
    AddressLedger, CustodyClient, EscrowAddressManager, EscrowStatusNotifier, ManagerConfig,
    MemoryAddressLedger, PgAddressLedger,
};
use crate::funding::FundingService;
use crate::reconcile::{
    MemoryObligationStore, ObligationStore, PaymentReconciler, PgObligationStore,
    ReconcilerConfig,
};
use crate::rates::{FixedRates, RateService};
use crate::session::SessionRegistry;
use crate::trade::{MemoryTradeRepository, PgTradeRepository, TradeRepository, TradeStateMachine};

/// Gateway shared state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<EscrowAddressManager>,
    pub notifier: Arc<EscrowStatusNotifier>,
    pub reconciler: Arc<PaymentReconciler>,
    pub funding: Arc<FundingService>,
    pub machine: Arc<TradeStateMachine>,
    pub obligations: Arc<dyn ObligationStore>,
    /// Per-user resumable sessions, durable tier under `sessions.data_dir`
    pub sessions: Arc<SessionRegistry>,
    pub rates: Arc<RateService>,
    pub clock: Arc<dyn Clock>,
    /// PostgreSQL database; `None` when running on in-memory stores
    pub db: Option<Arc<Database>>,
}

impl AppState {
    /// Wire every component onto PostgreSQL when `db` is given, otherwise
    /// onto in-memory stores.
    pub fn build(
        config: &AppConfig,
        db: Option<Arc<Database>>,
        custody: Arc<dyn CustodyClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (ledger, trades, obligations): (
            Arc<dyn AddressLedger>,
            Arc<dyn TradeRepository>,
            Arc<dyn ObligationStore>,
        ) = match &db {
            Some(db) => (
                Arc::new(PgAddressLedger::new(db.pool().clone(), clock.clone())),
                Arc::new(PgTradeRepository::new(db.pool().clone())),
                Arc::new(PgObligationStore::new(db.pool().clone())),
            ),
            None => {
                let ledger: Arc<dyn AddressLedger> =
                    Arc::new(MemoryAddressLedger::new(clock.clone()));
                let trades: Arc<dyn TradeRepository> =
                    Arc::new(MemoryTradeRepository::new(clock.clone()));
                let obligations = Arc::new(MemoryObligationStore::new(
                    trades.clone(),
                    ledger.clone(),
                ));
                (ledger, trades, obligations)
            }
        };

        let manager = Arc::new(EscrowAddressManager::new(
            ledger.clone(),
            custody,
            ManagerConfig::from_app(&config.escrow, &config.custody),
        ));
        let notifier = Arc::new(EscrowStatusNotifier::new(ledger));
        let reconciler = Arc::new(
            PaymentReconciler::new(
                obligations.clone(),
                clock.clone(),
                ReconcilerConfig::from_app(&config.escrow),
            )
            .with_notifier(notifier.clone()),
        );
        let funding = Arc::new(FundingService::new(
            manager.clone(),
            obligations.clone(),
            trades.clone(),
            clock.clone(),
            config.escrow.storage_retries,
        ));
        let machine = Arc::new(TradeStateMachine::new(trades));
        let sessions = Arc::new(SessionRegistry::new(&config.sessions, clock.clone()));
        let rates = RateService::from_config(&config.rates, clock.clone()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Rate feed unusable, serving fixed rates only");
            RateService::new(
                Arc::new(FixedRates::new(config.rates.fixed.clone())),
                clock.clone(),
                config.rates.ttl(),
            )
        });

        Self {
            manager,
            notifier,
            reconciler,
            funding,
            machine,
            obligations,
            sessions,
            rates: Arc::new(rates),
            clock,
            db,
        }
    }
}
