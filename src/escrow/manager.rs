//! Escrow Address Manager
//!
//! Hands out deposit addresses and releases escrowed funds.
//!
//! Allocation is check-then-allocate: the ledger is consulted first and
//! the custody provider is only called when no live entry exists. The
//! provider call is bounded by a timeout and never retried here; retry
//! belongs to the initiating flow. Ledger reads and writes are retried a
//! bounded number of times on transient storage errors.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::custody::{AllocateRequest, CustodyClient, ReleaseRequest};
use super::error::{CustodyError, EscrowError};
use super::ledger::{AddressLedger, AddressStatus, EscrowAddress};
use crate::config::{CustodyConfig, EscrowConfig};
use crate::core_types::Asset;
use crate::money;
use crate::store::with_retry;

/// Manager tuning
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Lifetime of a freshly allocated address
    pub address_ttl: chrono::Duration,
    /// Upper bound on any single custody call
    pub provider_timeout: Duration,
    pub storage_retries: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            address_ttl: chrono::Duration::hours(24),
            provider_timeout: Duration::from_secs(10),
            storage_retries: 3,
        }
    }
}

impl ManagerConfig {
    pub fn from_app(escrow: &EscrowConfig, custody: &CustodyConfig) -> Self {
        Self {
            address_ttl: escrow.address_ttl(),
            provider_timeout: custody.timeout(),
            storage_retries: escrow.storage_retries,
        }
    }
}

pub struct EscrowAddressManager {
    ledger: Arc<dyn AddressLedger>,
    custody: Arc<dyn CustodyClient>,
    config: ManagerConfig,
}

impl EscrowAddressManager {
    pub fn new(
        ledger: Arc<dyn AddressLedger>,
        custody: Arc<dyn CustodyClient>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            ledger,
            custody,
            config,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn AddressLedger> {
        &self.ledger
    }

    /// Return the live address for (trade_id, asset), allocating one only
    /// when none exists.
    ///
    /// Repeated calls within the TTL return the identical address. Under a
    /// concurrent first allocation both callers receive the address that
    /// won the ledger write.
    pub async fn get_or_allocate(
        &self,
        trade_id: &str,
        asset: Asset,
        expected_amount: Option<Decimal>,
    ) -> Result<String, EscrowError> {
        if trade_id.trim().is_empty() {
            return Err(EscrowError::InvalidRequest("trade_id is empty".into()));
        }
        if matches!(expected_amount, Some(a) if a <= Decimal::ZERO) {
            return Err(EscrowError::InvalidAmount);
        }

        let retries = self.config.storage_retries;
        let existing = with_retry(retries, "ledger.lookup", || self.ledger.lookup(trade_id, asset)).await?;
        if let Some(record) = existing {
            info!(trade_id, %asset, address = %record.address, "Escrow address reused");
            return Ok(record.address);
        }

        let request = AllocateRequest {
            trade_id: trade_id.to_string(),
            asset,
            expected_amount,
        };
        let allocated = match tokio::time::timeout(
            self.config.provider_timeout,
            self.custody.allocate(&request),
        )
        .await
        {
            Err(_) => {
                warn!(trade_id, %asset, timeout_ms = self.config.provider_timeout.as_millis() as u64, "Address allocation timed out");
                return Err(EscrowError::ProviderUnavailable(format!(
                    "allocation timed out after {:?}",
                    self.config.provider_timeout
                )));
            }
            Ok(Err(e)) => {
                warn!(trade_id, %asset, error = %e, "Address allocation failed");
                return Err(EscrowError::Allocation(e.to_string()));
            }
            Ok(Ok(address)) => address.trim().to_string(),
        };

        if allocated.is_empty() {
            warn!(trade_id, %asset, "Custody provider returned an empty address");
            return Err(EscrowError::Allocation(
                CustodyError::Malformed("empty address".into()).to_string(),
            ));
        }

        let stored = with_retry(retries, "ledger.record", || {
            self.ledger
                .record(trade_id, asset, &allocated, self.config.address_ttl)
        })
        .await?;

        if stored.address != allocated {
            info!(
                trade_id,
                %asset,
                address = %stored.address,
                discarded = %allocated,
                "Escrow address reused (concurrent allocation won)"
            );
        } else {
            info!(trade_id, %asset, address = %stored.address, expires_at = %stored.expires_at, "Escrow address allocated");
        }
        Ok(stored.address)
    }

    /// Release confirmed escrow funds to `to_address`.
    ///
    /// The record is claimed (`confirmed -> released`) before the provider
    /// is called, so two concurrent releases cannot both send. Only a
    /// definite provider refusal restores `confirmed`. A timeout or a
    /// transport failure leaves the send outcome unknown, so the record
    /// stays `released` until an operator reconciles it with the provider.
    pub async fn release(
        &self,
        trade_id: &str,
        asset: Asset,
        to_address: &str,
        amount: Decimal,
    ) -> Result<String, EscrowError> {
        if to_address.trim().is_empty() {
            return Err(EscrowError::InvalidRequest("to_address is empty".into()));
        }
        money::to_base_units(amount, asset.decimals()).map_err(|e| match e {
            money::MoneyError::InvalidAmount => EscrowError::InvalidAmount,
            other => EscrowError::InvalidRequest(other.to_string()),
        })?;

        let retries = self.config.storage_retries;
        let record = with_retry(retries, "ledger.get", || self.ledger.get(trade_id, asset))
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("{} {}", trade_id, asset)))?;

        if record.status != AddressStatus::Confirmed {
            return Err(EscrowError::NotReleasable(format!(
                "escrow {} {} is {}",
                trade_id, asset, record.status
            )));
        }

        let claimed = with_retry(retries, "ledger.transition", || {
            self.ledger.transition(
                trade_id,
                asset,
                AddressStatus::Confirmed,
                AddressStatus::Released,
            )
        })
        .await?;
        if !claimed {
            return Err(EscrowError::NotReleasable(format!(
                "escrow {} {} changed concurrently",
                trade_id, asset
            )));
        }

        let request = ReleaseRequest {
            trade_id: trade_id.to_string(),
            asset,
            to_address: to_address.to_string(),
            amount,
        };
        let outcome = tokio::time::timeout(self.config.provider_timeout, self.custody.release(&request)).await;

        let refusal = match outcome {
            Ok(Ok(txid)) => {
                info!(trade_id, %asset, to = to_address, %amount, %txid, "Escrow released");
                return Ok(txid);
            }
            Ok(Err(e @ (CustodyError::Rejected(_) | CustodyError::UnsupportedAsset(_)))) => {
                EscrowError::Release(e.to_string())
            }
            Ok(Err(e)) => {
                error!(
                    trade_id, %asset, to = to_address, %amount, error = %e,
                    "CRITICAL: release outcome unknown, escrow left released for manual reconciliation"
                );
                return Err(EscrowError::ProviderUnavailable(format!(
                    "release outcome unknown: {}",
                    e
                )));
            }
            Err(_) => {
                error!(
                    trade_id, %asset, to = to_address, %amount,
                    timeout_ms = self.config.provider_timeout.as_millis() as u64,
                    "CRITICAL: release timed out, escrow left released for manual reconciliation"
                );
                return Err(EscrowError::ProviderUnavailable(format!(
                    "release outcome unknown after {:?}",
                    self.config.provider_timeout
                )));
            }
        };

        warn!(trade_id, %asset, error = %refusal, "Escrow release refused, restoring confirmed status");
        let restored = with_retry(retries, "ledger.transition", || {
            self.ledger.transition(
                trade_id,
                asset,
                AddressStatus::Released,
                AddressStatus::Confirmed,
            )
        })
        .await;
        if !matches!(restored, Ok(true)) {
            error!(trade_id, %asset, "CRITICAL: failed to restore escrow after release refusal");
        }
        Err(refusal)
    }

    /// Purge dead ledger entries
    pub async fn expire_stale(&self) -> Result<u64, EscrowError> {
        let purged = with_retry(self.config.storage_retries, "ledger.purge_expired", || {
            self.ledger.purge_expired()
        })
        .await?;
        if purged > 0 {
            info!(count = purged, "Purged expired escrow addresses");
        }
        Ok(purged)
    }

    /// Current ledger record for (trade_id, asset), live or not
    pub async fn record(
        &self,
        trade_id: &str,
        asset: Asset,
    ) -> Result<Option<EscrowAddress>, EscrowError> {
        Ok(with_retry(self.config.storage_retries, "ledger.get", || {
            self.ledger.get(trade_id, asset)
        })
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::ManualClock;
    use crate::escrow::custody::{MockBehavior, MockCustody};
    use crate::escrow::ledger::{DepositUpdate, MemoryAddressLedger};
    use chrono::Utc;

    struct Fixture {
        clock: Arc<ManualClock>,
        ledger: Arc<MemoryAddressLedger>,
        custody: Arc<MockCustody>,
        manager: EscrowAddressManager,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ledger = Arc::new(MemoryAddressLedger::new(clock.clone()));
        let custody = Arc::new(MockCustody::new());
        let manager = EscrowAddressManager::new(
            ledger.clone(),
            custody.clone(),
            ManagerConfig {
                provider_timeout: Duration::from_millis(100),
                ..ManagerConfig::default()
            },
        );
        Fixture {
            clock,
            ledger,
            custody,
            manager,
        }
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    async fn confirm(f: &Fixture, address: &str) {
        f.ledger
            .apply_deposit(
                address,
                &DepositUpdate {
                    status: AddressStatus::Confirmed,
                    received_amount: dec("0.01"),
                    tx_hash: "tx1".into(),
                    confirmations: 2,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_repeated_calls_reuse_address() {
        let f = fixture();
        let first = f
            .manager
            .get_or_allocate("trade-1", Asset::Btc, Some(dec("0.01")))
            .await
            .unwrap();
        for _ in 0..5 {
            let again = f
                .manager
                .get_or_allocate("trade-1", Asset::Btc, Some(dec("0.01")))
                .await
                .unwrap();
            assert_eq!(again, first);
        }
        assert_eq!(f.custody.allocation_count(), 1);
    }

    #[tokio::test]
    async fn test_assets_get_separate_addresses() {
        let f = fixture();
        let btc = f.manager.get_or_allocate("trade-1", Asset::Btc, None).await.unwrap();
        let eth = f.manager.get_or_allocate("trade-1", Asset::Eth, None).await.unwrap();
        assert_ne!(btc, eth);
        assert_eq!(f.custody.allocation_count(), 2);
    }

    #[tokio::test]
    async fn test_reallocates_after_ttl() {
        let f = fixture();
        let first = f.manager.get_or_allocate("trade-1", Asset::Btc, None).await.unwrap();
        f.clock.advance(chrono::Duration::hours(24) + chrono::Duration::seconds(1));
        let second = f.manager.get_or_allocate("trade-1", Asset::Btc, None).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(f.ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_provider_error_is_allocation_error() {
        let f = fixture();
        f.custody
            .set_behavior(MockBehavior::Fail(CustodyError::Unreachable("dns".into())));
        let err = f.manager.get_or_allocate("trade-1", Asset::Btc, None).await.unwrap_err();
        assert!(matches!(err, EscrowError::Allocation(_)));
        assert!(f.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_empty_address_is_not_recorded() {
        let f = fixture();
        f.custody.set_behavior(MockBehavior::EmptyAddress);
        let err = f.manager.get_or_allocate("trade-1", Asset::Btc, None).await.unwrap_err();
        assert!(matches!(err, EscrowError::Allocation(_)));
        assert!(f.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_hung_provider_times_out() {
        let f = fixture();
        f.custody.set_behavior(MockBehavior::Hang);
        let err = f.manager.get_or_allocate("trade-1", Asset::Btc, None).await.unwrap_err();
        assert!(matches!(err, EscrowError::ProviderUnavailable(_)));
        assert!(f.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let f = fixture();
        assert!(matches!(
            f.manager.get_or_allocate("trade-1", Asset::Btc, Some(Decimal::ZERO)).await,
            Err(EscrowError::InvalidAmount)
        ));
        assert!(matches!(
            f.manager.get_or_allocate(" ", Asset::Btc, None).await,
            Err(EscrowError::InvalidRequest(_))
        ));
        assert_eq!(f.custody.allocation_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_first_allocation_single_address() {
        let f = fixture();
        let manager = Arc::new(f.manager);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = manager.clone();
            handles.push(tokio::spawn(async move {
                m.get_or_allocate("trade-race", Asset::Usdt, None).await.unwrap()
            }));
        }
        let mut addresses = std::collections::HashSet::new();
        for h in handles {
            addresses.insert(h.await.unwrap());
        }
        assert_eq!(addresses.len(), 1);
    }

    #[tokio::test]
    async fn test_release_requires_confirmed() {
        let f = fixture();
        f.manager.get_or_allocate("trade-1", Asset::Btc, None).await.unwrap();
        let err = f
            .manager
            .release("trade-1", Asset::Btc, "tb1qdest", dec("0.01"))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::NotReleasable(_)));
        assert_eq!(f.custody.release_count(), 0);

        let err = f
            .manager
            .release("trade-404", Asset::Btc, "tb1qdest", dec("0.01"))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_release_marks_released_once() {
        let f = fixture();
        let address = f.manager.get_or_allocate("trade-1", Asset::Btc, None).await.unwrap();
        confirm(&f, &address).await;

        let txid = f
            .manager
            .release("trade-1", Asset::Btc, "tb1qdest", dec("0.01"))
            .await
            .unwrap();
        assert!(!txid.is_empty());
        let record = f.manager.record("trade-1", Asset::Btc).await.unwrap().unwrap();
        assert_eq!(record.status, AddressStatus::Released);

        let again = f
            .manager
            .release("trade-1", Asset::Btc, "tb1qdest", dec("0.01"))
            .await;
        assert!(matches!(again, Err(EscrowError::NotReleasable(_))));
        assert_eq!(f.custody.release_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_release_leaves_record_confirmed() {
        let f = fixture();
        let address = f.manager.get_or_allocate("trade-1", Asset::Btc, None).await.unwrap();
        confirm(&f, &address).await;
        f.custody
            .set_behavior(MockBehavior::Fail(CustodyError::Rejected("insufficient".into())));

        let err = f
            .manager
            .release("trade-1", Asset::Btc, "tb1qdest", dec("0.01"))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Release(_)));
        let record = f.manager.record("trade-1", Asset::Btc).await.unwrap().unwrap();
        assert_eq!(record.status, AddressStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_timed_out_release_is_not_sent_twice() {
        let f = fixture();
        let address = f.manager.get_or_allocate("trade-1", Asset::Btc, None).await.unwrap();
        confirm(&f, &address).await;
        // the provider takes the send but never acknowledges it in time
        f.custody.set_behavior(MockBehavior::Hang);

        let first = f
            .manager
            .release("trade-1", Asset::Btc, "tb1qdest", dec("0.01"))
            .await
            .unwrap_err();
        assert!(matches!(first, EscrowError::ProviderUnavailable(_)));
        let record = f.manager.record("trade-1", Asset::Btc).await.unwrap().unwrap();
        assert_eq!(record.status, AddressStatus::Released);

        f.custody.set_behavior(MockBehavior::Healthy);
        let second = f
            .manager
            .release("trade-1", Asset::Btc, "tb1qdest", dec("0.01"))
            .await
            .unwrap_err();
        assert!(matches!(second, EscrowError::NotReleasable(_)));
        assert_eq!(f.custody.release_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_provider_keeps_release_claimed() {
        let f = fixture();
        let address = f.manager.get_or_allocate("trade-1", Asset::Btc, None).await.unwrap();
        confirm(&f, &address).await;
        f.custody
            .set_behavior(MockBehavior::Fail(CustodyError::Unreachable("reset".into())));

        let err = f
            .manager
            .release("trade-1", Asset::Btc, "tb1qdest", dec("0.01"))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::ProviderUnavailable(_)));
        let record = f.manager.record("trade-1", Asset::Btc).await.unwrap().unwrap();
        assert_eq!(record.status, AddressStatus::Released);
    }

    #[tokio::test]
    async fn test_release_rejects_excess_precision() {
        let f = fixture();
        let err = f
            .manager
            .release("trade-1", Asset::Usdt, "dest", dec("1.0000001"))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_expire_stale_purges() {
        let f = fixture();
        f.manager.get_or_allocate("trade-1", Asset::Btc, None).await.unwrap();
        f.clock.advance(chrono::Duration::hours(25));
        assert_eq!(f.manager.expire_stale().await.unwrap(), 1);
        assert!(f.ledger.is_empty());
    }
}
