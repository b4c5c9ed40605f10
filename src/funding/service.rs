use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core_types::{Asset, Clock, ObligationId, UserId};
use crate::escrow::{EscrowAddressManager, EscrowError};
use crate::reconcile::{ObligationKind, ObligationStore, PendingObligation};
use crate::store::{StoreError, with_retry};
use crate::trade::TradeRepository;

/// Request to fund a credit purchase or a trade escrow
#[derive(Debug, Clone, Deserialize)]
pub struct FundingRequest {
    pub owner_id: UserId,
    pub asset: Asset,
    pub expected_amount: Decimal,
    #[serde(flatten)]
    pub kind: ObligationKind,
    /// Caller-chosen id makes credit purchases idempotent across retries
    #[serde(default)]
    pub obligation_id: Option<ObligationId>,
}

pub struct FundingService {
    manager: Arc<EscrowAddressManager>,
    obligations: Arc<dyn ObligationStore>,
    trades: Arc<dyn TradeRepository>,
    clock: Arc<dyn Clock>,
    storage_retries: u32,
}

impl FundingService {
    pub fn new(
        manager: Arc<EscrowAddressManager>,
        obligations: Arc<dyn ObligationStore>,
        trades: Arc<dyn TradeRepository>,
        clock: Arc<dyn Clock>,
        storage_retries: u32,
    ) -> Self {
        Self {
            manager,
            obligations,
            trades,
            clock,
            storage_retries,
        }
    }

    /// Open (or return the already open) obligation for a funding request.
    ///
    /// The deposit address comes from `get_or_allocate`, so a repeated
    /// request lands on the same address and finds the obligation already
    /// pending there. A repeat whose owner, asset, kind or amount differs
    /// from the open obligation is refused.
    pub async fn open(&self, req: FundingRequest) -> Result<PendingObligation, EscrowError> {
        validate(&req)?;

        let id = req
            .obligation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let ledger_key = req.kind.ledger_key(&id);

        let address = self
            .manager
            .get_or_allocate(&ledger_key, req.asset, Some(req.expected_amount))
            .await?;

        if let Some(existing) = self.find_pending(&address).await? {
            ensure_same(&existing, &req)?;
            info!(obligation_id = %existing.id, address = %address, "Funding request reused open obligation");
            return Ok(existing);
        }

        let obligation = PendingObligation::new(
            &id,
            &req.owner_id,
            req.kind.clone(),
            req.expected_amount,
            req.asset,
            &address,
            self.clock.now(),
        );

        match self.obligations.insert(&obligation).await {
            Ok(()) => {}
            Err(StoreError::Conflict(reason)) => {
                // lost a race with an identical request
                return match self.find_pending(&address).await? {
                    Some(existing) => {
                        ensure_same(&existing, &req)?;
                        Ok(existing)
                    }
                    None => Err(EscrowError::InvalidRequest(reason)),
                };
            }
            Err(e) => return Err(e.into()),
        }

        if let ObligationKind::TradeEscrow { trade_id } = &obligation.kind {
            let linked = with_retry(self.storage_retries, "set_escrow_address", || {
                self.trades.set_escrow_address(trade_id, &address)
            })
            .await?;
            if !linked {
                warn!(trade_id, address = %address, "Escrow funded for unknown trade");
            }
        }

        info!(
            obligation_id = %obligation.id,
            owner_id = %obligation.owner_id,
            kind = obligation.kind.as_str(),
            asset = %obligation.asset,
            expected = %obligation.expected_amount,
            address = %address,
            "Obligation opened"
        );
        Ok(obligation)
    }

    async fn find_pending(&self, address: &str) -> Result<Option<PendingObligation>, EscrowError> {
        Ok(with_retry(self.storage_retries, "find_pending_by_address", || {
            self.obligations.find_pending_by_address(address)
        })
        .await?)
    }
}

fn ensure_same(existing: &PendingObligation, req: &FundingRequest) -> Result<(), EscrowError> {
    if existing.owner_id == req.owner_id
        && existing.asset == req.asset
        && existing.kind == req.kind
        && existing.expected_amount == req.expected_amount
    {
        return Ok(());
    }
    warn!(
        obligation_id = %existing.id,
        owner_id = %req.owner_id,
        expected = %req.expected_amount,
        open_expected = %existing.expected_amount,
        "Funding request conflicts with the open obligation"
    );
    Err(EscrowError::InvalidRequest(format!(
        "obligation {} is already open with different terms",
        existing.id
    )))
}

fn validate(req: &FundingRequest) -> Result<(), EscrowError> {
    if req.expected_amount <= Decimal::ZERO {
        return Err(EscrowError::InvalidAmount);
    }
    if req.owner_id.trim().is_empty() {
        return Err(EscrowError::InvalidRequest("owner_id is empty".into()));
    }
    match &req.kind {
        ObligationKind::CreditPurchase { credits } if *credits <= 0 => {
            Err(EscrowError::InvalidRequest("credits must be positive".into()))
        }
        ObligationKind::TradeEscrow { trade_id } if trade_id.trim().is_empty() => {
            Err(EscrowError::InvalidRequest("trade_id is empty".into()))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::ManualClock;
    use chrono::{TimeZone, Utc};
    use crate::escrow::custody::{MockBehavior, MockCustody};
    use crate::escrow::ledger::MemoryAddressLedger;
    use crate::escrow::{CustodyError, ManagerConfig};
    use crate::reconcile::MemoryObligationStore;
    use crate::trade::{MemoryTradeRepository, TradeRecord};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        service: FundingService,
        custody: Arc<MockCustody>,
        trades: Arc<MemoryTradeRepository>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()));
        let ledger = Arc::new(MemoryAddressLedger::new(clock.clone()));
        let trades = Arc::new(MemoryTradeRepository::new(clock.clone()));
        let custody = Arc::new(MockCustody::new());
        let manager = Arc::new(EscrowAddressManager::new(
            ledger.clone(),
            custody.clone(),
            ManagerConfig::default(),
        ));
        let store = Arc::new(MemoryObligationStore::new(trades.clone(), ledger));
        Fixture {
            clock: clock.clone(),
            service: FundingService::new(manager, store, trades.clone(), clock, 3),
            custody,
            trades,
        }
    }

    fn escrow_request(trade_id: &str) -> FundingRequest {
        FundingRequest {
            owner_id: "buyer".into(),
            asset: Asset::Btc,
            expected_amount: dec("0.01"),
            kind: ObligationKind::TradeEscrow {
                trade_id: trade_id.into(),
            },
            obligation_id: None,
        }
    }

    #[tokio::test]
    async fn test_repeated_escrow_request_returns_same_obligation() {
        let f = fixture();
        f.trades
            .insert(&TradeRecord::new("t1", "buyer", "seller", Asset::Btc, dec("0.01"), f.clock.now()))
            .await
            .unwrap();

        let first = f.service.open(escrow_request("t1")).await.unwrap();
        let second = f.service.open(escrow_request("t1")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.payment_address, second.payment_address);
        assert_eq!(first.created_at, f.clock.now());
        assert_eq!(f.custody.allocation_count(), 1);
        assert_eq!(
            f.trades.get("t1").await.unwrap().unwrap().escrow_address,
            Some(first.payment_address.clone())
        );
    }

    #[tokio::test]
    async fn test_credit_purchase_with_caller_id_is_idempotent() {
        let f = fixture();
        let req = FundingRequest {
            owner_id: "alice".into(),
            asset: Asset::Usdt,
            expected_amount: dec("25"),
            kind: ObligationKind::CreditPurchase { credits: 250 },
            obligation_id: Some("cp-1".into()),
        };

        let first = f.service.open(req.clone()).await.unwrap();
        let second = f.service.open(req).await.unwrap();
        assert_eq!(first.id, "cp-1");
        assert_eq!(second.id, "cp-1");
        assert_eq!(f.custody.allocation_count(), 1);
    }

    #[tokio::test]
    async fn test_repeat_with_different_terms_is_refused() {
        let f = fixture();
        let first = f.service.open(escrow_request("t1")).await.unwrap();

        let mut bigger = escrow_request("t1");
        bigger.expected_amount = dec("0.02");
        assert!(matches!(
            f.service.open(bigger).await,
            Err(EscrowError::InvalidRequest(_))
        ));

        let mut other_owner = escrow_request("t1");
        other_owner.owner_id = "mallory".into();
        assert!(matches!(
            f.service.open(other_owner).await,
            Err(EscrowError::InvalidRequest(_))
        ));

        // the original terms still resolve to the open obligation
        assert_eq!(f.service.open(escrow_request("t1")).await.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let f = fixture();
        let mut req = escrow_request("t1");
        req.expected_amount = Decimal::ZERO;
        assert!(matches!(f.service.open(req).await, Err(EscrowError::InvalidAmount)));

        let req = FundingRequest {
            kind: ObligationKind::CreditPurchase { credits: 0 },
            ..escrow_request("t1")
        };
        assert!(matches!(f.service.open(req).await, Err(EscrowError::InvalidRequest(_))));
        assert_eq!(f.custody.allocation_count(), 0);
    }

    #[tokio::test]
    async fn test_allocation_failure_opens_nothing() {
        let f = fixture();
        f.custody
            .set_behavior(MockBehavior::Fail(CustodyError::Unreachable("down".into())));
        assert!(matches!(
            f.service.open(escrow_request("t1")).await,
            Err(EscrowError::Allocation(_))
        ));
    }

    #[test]
    fn test_request_wire_format() {
        let req: FundingRequest = serde_json::from_str(
            r#"{"owner_id":"u1","asset":"BTC","expected_amount":"0.01","kind":"trade_escrow","trade_id":"t9"}"#,
        )
        .unwrap();
        assert_eq!(
            req.kind,
            ObligationKind::TradeEscrow {
                trade_id: "t9".into()
            }
        );
        assert!(req.obligation_id.is_none());
    }
}
