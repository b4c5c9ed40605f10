//! Payment Reconciler
//!
//! Matches confirmed transfer events to pending obligations.
//!
//! # Flow
//!
//! ```text
//! event ─► confirmed? ─no─► Ignored
//!            │
//!            ▼
//!        key seen? ─yes─► Duplicate
//!            │
//!            ▼
//!   pending obligation on address? ─no─► Unmatched
//!            │
//!            ▼
//!   within tolerance? ─no─► record discrepancy ─► Mismatched (stays pending)
//!            │
//!            ▼
//!   settle (key + obligation + effect, one unit) ─► Completed
//! ```
//!
//! The key check up front is only a fast path. The store's settlement
//! re-checks the key and the obligation's `pending` status inside the same
//! unit of work, so two racing deliveries credit at most once.

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::ReconcileError;
use super::event::{TransferEvent, WebhookPayload};
use super::obligation::{
    Discrepancy, ObligationKind, ObligationStore, PendingObligation, SettleOutcome, Settlement,
};
use crate::config::EscrowConfig;
use crate::core_types::{Clock, ObligationId};
use crate::escrow::EscrowStatusNotifier;
use crate::money;
use crate::store::with_retry;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Relative tolerance, 0.01 = 1%
    pub tolerance: Decimal,
    /// Upper bound on one event
    pub timeout: Duration,
    pub storage_retries: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tolerance: Decimal::new(1, 2),
            timeout: Duration::from_secs(5),
            storage_retries: 3,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_app(escrow: &EscrowConfig) -> Self {
        Self {
            tolerance: escrow.tolerance,
            timeout: escrow.reconcile_timeout(),
            storage_retries: escrow.storage_retries,
        }
    }
}

/// Outcome of one transfer event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconciliationResult {
    Completed {
        obligation_id: ObligationId,
        received_amount: Decimal,
    },
    Duplicate,
    Unmatched,
    Mismatched {
        obligation_id: ObligationId,
        expected: Decimal,
        received: Decimal,
        delta: Decimal,
    },
    Ignored {
        state: String,
    },
}

impl ReconciliationResult {
    pub fn status(&self) -> &'static str {
        match self {
            ReconciliationResult::Completed { .. } => "completed",
            ReconciliationResult::Duplicate => "duplicate",
            ReconciliationResult::Unmatched => "unmatched",
            ReconciliationResult::Mismatched { .. } => "mismatched",
            ReconciliationResult::Ignored { .. } => "ignored",
        }
    }
}

pub struct PaymentReconciler {
    obligations: Arc<dyn ObligationStore>,
    notifier: Option<Arc<EscrowStatusNotifier>>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

impl PaymentReconciler {
    pub fn new(
        obligations: Arc<dyn ObligationStore>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            obligations,
            notifier: None,
            clock,
            config,
        }
    }

    /// Push escrow status changes to subscribers after each applied event
    pub fn with_notifier(mut self, notifier: Arc<EscrowStatusNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn obligations(&self) -> &Arc<dyn ObligationStore> {
        &self.obligations
    }

    /// Reconcile one event within the configured time bound
    pub async fn handle_transfer_event(
        &self,
        event: &TransferEvent,
    ) -> Result<ReconciliationResult, ReconcileError> {
        let result = tokio::time::timeout(self.config.timeout, self.reconcile(event))
            .await
            .map_err(|_| {
                warn!(tx_hash = %event.tx_hash, address = %event.address, "Reconciliation timed out");
                ReconcileError::ProviderUnavailable(format!(
                    "reconciliation exceeded {:?}",
                    self.config.timeout
                ))
            })??;

        info!(
            tx_hash = %event.tx_hash,
            address = %event.address,
            asset = %event.asset,
            outcome = result.status(),
            "Transfer event reconciled"
        );
        Ok(result)
    }

    /// Decode a notification and reconcile each transfer it carries, in order
    pub async fn handle_webhook(
        &self,
        payload: WebhookPayload,
    ) -> Result<Vec<ReconciliationResult>, ReconcileError> {
        let kind = payload.kind.clone();
        let events = payload.into_events()?;
        if events.is_empty() {
            debug!(kind = %kind, "Notification carries no transfers");
        }

        let mut results = Vec::with_capacity(events.len());
        for event in &events {
            results.push(self.handle_transfer_event(event).await?);
        }
        Ok(results)
    }

    async fn reconcile(&self, event: &TransferEvent) -> Result<ReconciliationResult, ReconcileError> {
        if !event.state.is_confirmed() {
            debug!(tx_hash = %event.tx_hash, state = %event.state, "Ignoring non-confirmed transfer");
            return Ok(ReconciliationResult::Ignored {
                state: event.state.to_string(),
            });
        }

        let retries = self.config.storage_retries;
        let key = event.key();

        if with_retry(retries, "is_processed", || self.obligations.is_processed(&key)).await? {
            return Ok(ReconciliationResult::Duplicate);
        }

        let obligation = with_retry(retries, "find_pending_by_address", || {
            self.obligations.find_pending_by_address(&event.address)
        })
        .await?;

        let Some(obligation) = obligation else {
            warn!(tx_hash = %event.tx_hash, address = %event.address, "No pending obligation for transfer");
            return Ok(ReconciliationResult::Unmatched);
        };

        if obligation.asset != event.asset {
            warn!(
                obligation_id = %obligation.id,
                expected_asset = %obligation.asset,
                event_asset = %event.asset,
                "Transfer asset differs from obligation"
            );
            return Ok(ReconciliationResult::Unmatched);
        }

        let received = money::to_whole_units(event.amount, obligation.asset.decimals())
            .map_err(|e| ReconcileError::Malformed(format!("transfer value: {}", e)))?;

        match money::check_tolerance(obligation.expected_amount, received, self.config.tolerance) {
            Ok(()) => self.settle(event, &obligation, received).await,
            Err(mismatch) => {
                let discrepancy = Discrepancy {
                    obligation_id: obligation.id.clone(),
                    tx_hash: event.tx_hash.clone(),
                    address: event.address.clone(),
                    expected: mismatch.expected,
                    received: mismatch.received,
                    delta: mismatch.delta,
                    recorded_at: self.clock.now(),
                };

                let recorded = with_retry(retries, "record_mismatch", || {
                    self.obligations
                        .record_mismatch(&key, &discrepancy, event.confirmations)
                })
                .await?;
                if !recorded {
                    return Ok(ReconciliationResult::Duplicate);
                }

                warn!(
                    obligation_id = %obligation.id,
                    tx_hash = %event.tx_hash,
                    expected = %mismatch.expected,
                    received = %mismatch.received,
                    delta = %mismatch.delta,
                    "Amount outside tolerance, held for manual reconciliation"
                );
                self.publish(&obligation).await;

                Ok(ReconciliationResult::Mismatched {
                    obligation_id: obligation.id,
                    expected: mismatch.expected,
                    received: mismatch.received,
                    delta: mismatch.delta,
                })
            }
        }
    }

    async fn settle(
        &self,
        event: &TransferEvent,
        obligation: &PendingObligation,
        received: Decimal,
    ) -> Result<ReconciliationResult, ReconcileError> {
        let settlement = Settlement {
            key: event.key(),
            obligation_id: obligation.id.clone(),
            received,
            confirmations: event.confirmations,
            confirmed_at: self.clock.now(),
        };

        let outcome = with_retry(self.config.storage_retries, "settle", || {
            self.obligations.settle(&settlement)
        })
        .await?;

        match outcome {
            SettleOutcome::Applied => {
                self.publish(obligation).await;
                Ok(ReconciliationResult::Completed {
                    obligation_id: obligation.id.clone(),
                    received_amount: received,
                })
            }
            SettleOutcome::AlreadyProcessed => Ok(ReconciliationResult::Duplicate),
            SettleOutcome::NotPending => Ok(ReconciliationResult::Unmatched),
            SettleOutcome::Rejected(e) => {
                warn!(obligation_id = %obligation.id, error = %e, "Escrow transition rejected, obligation left pending");
                Err(e.into())
            }
        }
    }

    async fn publish(&self, obligation: &PendingObligation) {
        let (Some(notifier), ObligationKind::TradeEscrow { trade_id }) =
            (&self.notifier, &obligation.kind)
        else {
            return;
        };
        if let Err(e) = notifier.publish(trade_id).await {
            warn!(trade_id, error = %e, "Escrow status publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{Asset, ManualClock};
    use chrono::{TimeZone, Utc};
    use crate::escrow::ledger::{AddressLedger, AddressStatus, MemoryAddressLedger};
    use crate::reconcile::event::{EventKey, TransferState};
    use crate::reconcile::obligation::{MemoryObligationStore, ObligationStatus};
    use crate::store::StoreError;
    use crate::trade::{EscrowStatus, MemoryTradeRepository, TradeRecord, TradeRepository};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        reconciler: Arc<PaymentReconciler>,
        store: Arc<MemoryObligationStore>,
        trades: Arc<MemoryTradeRepository>,
        ledger: Arc<MemoryAddressLedger>,
        notifier: Arc<EscrowStatusNotifier>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap()));
        let trades = Arc::new(MemoryTradeRepository::new(clock.clone()));
        let ledger = Arc::new(MemoryAddressLedger::new(clock.clone()));
        let store = Arc::new(MemoryObligationStore::new(trades.clone(), ledger.clone()));
        let notifier = Arc::new(EscrowStatusNotifier::new(ledger.clone()));
        let reconciler = Arc::new(
            PaymentReconciler::new(store.clone(), clock.clone(), ReconcilerConfig::default())
                .with_notifier(notifier.clone()),
        );

        trades
            .insert(&TradeRecord::new("trade-1", "buyer", "seller", Asset::Btc, dec("0.01"), clock.now()))
            .await
            .unwrap();
        ledger
            .record("trade-1", Asset::Btc, "tb1qescrow", chrono::Duration::hours(24))
            .await
            .unwrap();
        store
            .insert(&PendingObligation::new(
                "ob-1",
                "buyer",
                ObligationKind::TradeEscrow {
                    trade_id: "trade-1".into(),
                },
                dec("0.01"),
                Asset::Btc,
                "tb1qescrow",
                clock.now(),
            ))
            .await
            .unwrap();

        Fixture {
            clock,
            reconciler,
            store,
            trades,
            ledger,
            notifier,
        }
    }

    fn event(tx: &str, sats: i64) -> TransferEvent {
        TransferEvent {
            asset: Asset::Btc,
            address: "tb1qescrow".into(),
            amount: Decimal::from(sats),
            tx_hash: tx.into(),
            confirmations: 2,
            state: TransferState::Confirmed,
        }
    }

    #[tokio::test]
    async fn test_within_tolerance_completes_then_duplicate() {
        let f = fixture().await;

        let result = f.reconciler.handle_transfer_event(&event("tx1", 990_000)).await.unwrap();
        assert_eq!(
            result,
            ReconciliationResult::Completed {
                obligation_id: "ob-1".into(),
                received_amount: dec("0.0099"),
            }
        );

        let again = f.reconciler.handle_transfer_event(&event("tx1", 990_000)).await.unwrap();
        assert_eq!(again, ReconciliationResult::Duplicate);

        let o = f.store.get("ob-1").await.unwrap().unwrap();
        assert_eq!(o.status, ObligationStatus::Completed);
        assert_eq!(o.received_amount, Some(dec("0.0099")));
        assert_eq!(o.confirmed_at, Some(f.clock.now()));
        assert_eq!(
            f.trades.get("trade-1").await.unwrap().unwrap().escrow_status,
            EscrowStatus::CryptoReceived
        );
        assert_eq!(
            f.ledger.get("trade-1", Asset::Btc).await.unwrap().unwrap().status,
            AddressStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn test_short_deposit_is_mismatched() {
        let f = fixture().await;

        let result = f.reconciler.handle_transfer_event(&event("tx1", 850_000)).await.unwrap();
        assert_eq!(
            result,
            ReconciliationResult::Mismatched {
                obligation_id: "ob-1".into(),
                expected: dec("0.01"),
                received: dec("0.0085"),
                delta: dec("-0.0015"),
            }
        );
        assert_eq!(
            f.store.get("ob-1").await.unwrap().unwrap().status,
            ObligationStatus::Pending
        );
        assert_eq!(
            f.trades.get("trade-1").await.unwrap().unwrap().escrow_status,
            EscrowStatus::Pending
        );
        let recorded = f.store.discrepancies("ob-1").await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].recorded_at, f.clock.now());

        // redelivery of the same mismatched event records nothing new
        assert_eq!(
            f.reconciler.handle_transfer_event(&event("tx1", 850_000)).await.unwrap(),
            ReconciliationResult::Duplicate
        );
        assert_eq!(f.store.discrepancies("ob-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tolerance_boundary() {
        // exactly 1% over accepts
        let f = fixture().await;
        assert!(matches!(
            f.reconciler.handle_transfer_event(&event("tx1", 1_010_000)).await.unwrap(),
            ReconciliationResult::Completed { .. }
        ));

        // one satoshi beyond rejects
        let f = fixture().await;
        assert!(matches!(
            f.reconciler.handle_transfer_event(&event("tx1", 1_010_001)).await.unwrap(),
            ReconciliationResult::Mismatched { .. }
        ));
    }

    #[tokio::test]
    async fn test_unconfirmed_is_ignored() {
        let f = fixture().await;
        let mut e = event("tx1", 990_000);
        e.state = TransferState::Unconfirmed;
        assert_eq!(
            f.reconciler.handle_transfer_event(&e).await.unwrap(),
            ReconciliationResult::Ignored {
                state: "unconfirmed".into()
            }
        );
        assert!(!f.store.is_processed(&e.key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_address_and_wrong_asset_unmatched() {
        let f = fixture().await;
        let mut e = event("tx1", 990_000);
        e.address = "tb1qunknown".into();
        assert_eq!(
            f.reconciler.handle_transfer_event(&e).await.unwrap(),
            ReconciliationResult::Unmatched
        );

        let mut e = event("tx2", 990_000);
        e.asset = Asset::Eth;
        assert_eq!(
            f.reconciler.handle_transfer_event(&e).await.unwrap(),
            ReconciliationResult::Unmatched
        );
    }

    #[tokio::test]
    async fn test_completed_obligation_ignores_later_transfer() {
        let f = fixture().await;
        f.reconciler.handle_transfer_event(&event("tx1", 990_000)).await.unwrap();
        assert_eq!(
            f.reconciler.handle_transfer_event(&event("tx2", 990_000)).await.unwrap(),
            ReconciliationResult::Unmatched
        );
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_credit_once() {
        let f = fixture().await;
        let store = Arc::new(MemoryObligationStore::new(f.trades.clone(), f.ledger.clone()));
        f.ledger
            .record("credit-c1", Asset::Btc, "tb1qcredit", chrono::Duration::hours(24))
            .await
            .unwrap();
        store
            .insert(&PendingObligation::new(
                "c1",
                "alice",
                ObligationKind::CreditPurchase { credits: 50 },
                dec("0.01"),
                Asset::Btc,
                "tb1qcredit",
                Utc::now(),
            ))
            .await
            .unwrap();
        let reconciler = Arc::new(PaymentReconciler::new(
            store.clone(),
            Arc::new(ManualClock::new(Utc::now())),
            ReconcilerConfig::default(),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = reconciler.clone();
            handles.push(tokio::spawn(async move {
                let mut e = event("txc", 1_000_000);
                e.address = "tb1qcredit".into();
                r.handle_transfer_event(&e).await.unwrap()
            }));
        }

        let mut completed = 0;
        for h in handles {
            if matches!(h.await.unwrap(), ReconciliationResult::Completed { .. }) {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(store.credits("alice").await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_rejected_escrow_transition_surfaces() {
        let f = fixture().await;
        f.trades
            .update_escrow_status_if("trade-1", EscrowStatus::Pending, EscrowStatus::Disputed)
            .await
            .unwrap();

        let err = f.reconciler.handle_transfer_event(&event("tx1", 990_000)).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidTransition(_)));
        assert_eq!(
            f.store.get("ob-1").await.unwrap().unwrap().status,
            ObligationStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_subscribers_see_confirmation() {
        let f = fixture().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let confirmed = Arc::new(AtomicUsize::new(0));
        let (s, c) = (seen.clone(), confirmed.clone());
        let _sub = f
            .notifier
            .subscribe("trade-1", move |snap| {
                s.fetch_add(1, Ordering::SeqCst);
                if snap.confirmed {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();

        f.reconciler.handle_transfer_event(&event("tx1", 990_000)).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(confirmed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_webhook_body() {
        let f = fixture().await;
        let body = br#"{"type":"transfer","data":{"address":"tb1qescrow","value":990000,"coin":"tbtc","state":"confirmed","confirmations":1,"txHash":"tx1"}}"#;
        let results = f
            .reconciler
            .handle_webhook(WebhookPayload::parse(body).unwrap())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status(), "completed");
        assert_eq!(
            serde_json::to_value(&results[0]).unwrap()["status"],
            serde_json::json!("completed")
        );
    }

    /// Store whose reads never complete
    struct StalledStore;

    #[async_trait]
    impl ObligationStore for StalledStore {
        async fn insert(&self, _: &PendingObligation) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn get(&self, _: &str) -> Result<Option<PendingObligation>, StoreError> {
            std::future::pending().await
        }
        async fn find_pending_by_address(&self, _: &str) -> Result<Option<PendingObligation>, StoreError> {
            std::future::pending().await
        }
        async fn is_processed(&self, _: &EventKey) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn settle(&self, _: &Settlement) -> Result<SettleOutcome, StoreError> {
            std::future::pending().await
        }
        async fn record_mismatch(&self, _: &EventKey, _: &Discrepancy, _: u32) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn mark_mismatched(&self, _: &str) -> Result<bool, StoreError> {
            std::future::pending().await
        }
        async fn expire_pending(&self, _: chrono::DateTime<Utc>) -> Result<u64, StoreError> {
            std::future::pending().await
        }
        async fn discrepancies(&self, _: &str) -> Result<Vec<Discrepancy>, StoreError> {
            std::future::pending().await
        }
        async fn credits(&self, _: &str) -> Result<i64, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_store_times_out() {
        let config = ReconcilerConfig {
            timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let reconciler =
            PaymentReconciler::new(Arc::new(StalledStore), Arc::new(ManualClock::new(Utc::now())), config);
        let err = reconciler
            .handle_transfer_event(&event("tx1", 990_000))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::ProviderUnavailable(_)));
    }
}
