//! Address Ledger
//!
//! Durable mapping from (trade_id, asset) to the deposit address allocated
//! for it. The ledger is the only owner of `EscrowAddress` records.
//!
//! # Invariant
//! At most one live record per (trade_id, asset). Both implementations key
//! storage by that pair, so a concurrent second `record` is ignored and the
//! first writer's address is returned to both callers.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::core_types::{Asset, Clock, TradeId};
use crate::store::StoreError;

/// Lifecycle of an allocated deposit address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressStatus {
    /// Allocated, waiting for a deposit
    Pending,
    /// Funds arrived but did not reconcile (manual review)
    Funded,
    /// Funds arrived and reconciled
    Confirmed,
    /// Funds released to the counterparty
    Released,
    /// Abandoned
    Expired,
}

impl AddressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressStatus::Pending => "pending",
            AddressStatus::Funded => "funded",
            AddressStatus::Confirmed => "confirmed",
            AddressStatus::Released => "released",
            AddressStatus::Expired => "expired",
        }
    }

    /// Whether a deposit can still be applied to an address in this status
    #[inline]
    pub fn accepts_deposit(&self) -> bool {
        matches!(self, AddressStatus::Pending | AddressStatus::Funded)
    }
}

impl fmt::Display for AddressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AddressStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AddressStatus::Pending),
            "funded" => Ok(AddressStatus::Funded),
            "confirmed" => Ok(AddressStatus::Confirmed),
            "released" => Ok(AddressStatus::Released),
            "expired" => Ok(AddressStatus::Expired),
            other => Err(StoreError::Corrupt(format!("unknown address status: {}", other))),
        }
    }
}

/// One allocated deposit address
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscrowAddress {
    pub trade_id: TradeId,
    pub asset: Asset,
    pub address: String,
    pub status: AddressStatus,
    pub received_amount: Option<Decimal>,
    pub tx_hash: Option<String>,
    pub confirmations: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl EscrowAddress {
    pub fn new(
        trade_id: &str,
        asset: Asset,
        address: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            trade_id: trade_id.to_string(),
            asset,
            address: address.to_string(),
            status: AddressStatus::Pending,
            received_amount: None,
            tx_hash: None,
            confirmations: 0,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    /// Live = not past expiry and not expired/released
    #[inline]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
            && !matches!(self.status, AddressStatus::Expired | AddressStatus::Released)
    }

    /// Whether `record` may overwrite this entry.
    ///
    /// Funded and confirmed entries hold money and are never replaced,
    /// even past their expiry.
    #[inline]
    pub fn is_replaceable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            AddressStatus::Expired | AddressStatus::Released => true,
            AddressStatus::Pending => self.expires_at <= now,
            AddressStatus::Funded | AddressStatus::Confirmed => false,
        }
    }
}

/// Deposit observed on an address
#[derive(Debug, Clone, PartialEq)]
pub struct DepositUpdate {
    pub status: AddressStatus,
    pub received_amount: Decimal,
    pub tx_hash: String,
    pub confirmations: u32,
}

#[async_trait]
pub trait AddressLedger: Send + Sync {
    /// Live record for (trade_id, asset), if any
    async fn lookup(&self, trade_id: &str, asset: Asset)
    -> Result<Option<EscrowAddress>, StoreError>;

    /// Record regardless of liveness
    async fn get(&self, trade_id: &str, asset: Asset) -> Result<Option<EscrowAddress>, StoreError>;

    /// Replace any dead record and insert a new pending one.
    ///
    /// Returns the record that ended up stored: when a live record already
    /// exists (a concurrent allocation won) it is returned unchanged.
    async fn record(
        &self,
        trade_id: &str,
        asset: Asset,
        address: &str,
        ttl: Duration,
    ) -> Result<EscrowAddress, StoreError>;

    /// Delete expired pending records and records marked expired
    async fn purge_expired(&self) -> Result<u64, StoreError>;

    async fn find_by_address(&self, address: &str) -> Result<Option<EscrowAddress>, StoreError>;

    /// Most recently allocated record for a trade, across assets
    async fn latest_for_trade(&self, trade_id: &str) -> Result<Option<EscrowAddress>, StoreError>;

    /// CAS status update. Returns false when the current status is not `from`.
    async fn transition(
        &self,
        trade_id: &str,
        asset: Asset,
        from: AddressStatus,
        to: AddressStatus,
    ) -> Result<bool, StoreError>;

    /// Apply a deposit to an address that is still accepting one
    async fn apply_deposit(&self, address: &str, update: &DepositUpdate)
    -> Result<bool, StoreError>;
}

// ============================================================================
// In-memory ledger
// ============================================================================

/// DashMap-backed ledger keyed by (trade_id, asset)
pub struct MemoryAddressLedger {
    rows: DashMap<(TradeId, Asset), EscrowAddress>,
    clock: Arc<dyn Clock>,
}

impl MemoryAddressLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl AddressLedger for MemoryAddressLedger {
    async fn lookup(
        &self,
        trade_id: &str,
        asset: Asset,
    ) -> Result<Option<EscrowAddress>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .rows
            .get(&(trade_id.to_string(), asset))
            .filter(|r| r.is_live(now))
            .map(|r| r.clone()))
    }

    async fn get(&self, trade_id: &str, asset: Asset) -> Result<Option<EscrowAddress>, StoreError> {
        Ok(self
            .rows
            .get(&(trade_id.to_string(), asset))
            .map(|r| r.clone()))
    }

    async fn record(
        &self,
        trade_id: &str,
        asset: Asset,
        address: &str,
        ttl: Duration,
    ) -> Result<EscrowAddress, StoreError> {
        let now = self.clock.now();
        let fresh = EscrowAddress::new(trade_id, asset, address, now, ttl);

        let stored = match self.rows.entry((trade_id.to_string(), asset)) {
            Entry::Occupied(mut e) => {
                if e.get().is_replaceable(now) {
                    e.insert(fresh.clone());
                    fresh
                } else {
                    e.get().clone()
                }
            }
            Entry::Vacant(v) => {
                v.insert(fresh.clone());
                fresh
            }
        };
        Ok(stored)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let before = self.rows.len();
        self.rows.retain(|_, r| {
            !(r.status == AddressStatus::Expired
                || (r.status == AddressStatus::Pending && r.expires_at <= now))
        });
        Ok(before.saturating_sub(self.rows.len()) as u64)
    }

    async fn find_by_address(&self, address: &str) -> Result<Option<EscrowAddress>, StoreError> {
        Ok(self
            .rows
            .iter()
            .find(|r| r.address == address)
            .map(|r| r.clone()))
    }

    async fn latest_for_trade(&self, trade_id: &str) -> Result<Option<EscrowAddress>, StoreError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.trade_id == trade_id)
            .max_by_key(|r| r.created_at)
            .map(|r| r.clone()))
    }

    async fn transition(
        &self,
        trade_id: &str,
        asset: Asset,
        from: AddressStatus,
        to: AddressStatus,
    ) -> Result<bool, StoreError> {
        match self.rows.get_mut(&(trade_id.to_string(), asset)) {
            Some(mut r) if r.status == from => {
                r.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply_deposit(
        &self,
        address: &str,
        update: &DepositUpdate,
    ) -> Result<bool, StoreError> {
        for mut r in self.rows.iter_mut() {
            if r.address == address && r.status.accepts_deposit() {
                r.status = update.status;
                r.received_amount = Some(update.received_amount);
                r.tx_hash = Some(update.tx_hash.clone());
                r.confirmations = update.confirmations;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ============================================================================
// PostgreSQL ledger
// ============================================================================

const SELECT_COLUMNS: &str = "trade_id, asset, address, status, received_amount, tx_hash, \
                              confirmations, created_at, expires_at";

/// `escrow_addresses` table, PRIMARY KEY (trade_id, asset)
pub struct PgAddressLedger {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgAddressLedger {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub(crate) fn row_to_address(row: &PgRow) -> Result<EscrowAddress, StoreError> {
        let asset: String = row.try_get("asset")?;
        let status: String = row.try_get("status")?;
        let confirmations: i32 = row.try_get("confirmations")?;

        Ok(EscrowAddress {
            trade_id: row.try_get("trade_id")?,
            asset: asset
                .parse()
                .map_err(|e: crate::core_types::UnsupportedAsset| StoreError::Corrupt(e.to_string()))?,
            address: row.try_get("address")?,
            status: status.parse()?,
            received_amount: row.try_get("received_amount")?,
            tx_hash: row.try_get("tx_hash")?,
            confirmations: confirmations.max(0) as u32,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

#[async_trait]
impl AddressLedger for PgAddressLedger {
    async fn lookup(
        &self,
        trade_id: &str,
        asset: Asset,
    ) -> Result<Option<EscrowAddress>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM escrow_addresses \
             WHERE trade_id = $1 AND asset = $2 AND expires_at > $3 \
               AND status NOT IN ('expired', 'released')",
            SELECT_COLUMNS
        ))
        .bind(trade_id)
        .bind(asset.as_str())
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_address).transpose()
    }

    async fn get(&self, trade_id: &str, asset: Asset) -> Result<Option<EscrowAddress>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM escrow_addresses WHERE trade_id = $1 AND asset = $2",
            SELECT_COLUMNS
        ))
        .bind(trade_id)
        .bind(asset.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_address).transpose()
    }

    async fn record(
        &self,
        trade_id: &str,
        asset: Asset,
        address: &str,
        ttl: Duration,
    ) -> Result<EscrowAddress, StoreError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        // Replace, don't accumulate: dead entries must not resurface
        sqlx::query(
            r#"
            DELETE FROM escrow_addresses
            WHERE trade_id = $1 AND asset = $2
              AND (status IN ('expired', 'released')
                   OR (status = 'pending' AND expires_at <= $3))
            "#,
        )
        .bind(trade_id)
        .bind(asset.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO escrow_addresses
                (trade_id, asset, address, status, confirmations, created_at, expires_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $5)
            ON CONFLICT (trade_id, asset) DO NOTHING
            "#,
        )
        .bind(trade_id)
        .bind(asset.as_str())
        .bind(address)
        .bind(now)
        .bind(now + ttl)
        .execute(&mut *tx)
        .await?;

        // Re-fetch so a concurrent winner's address is what we return
        let row = sqlx::query(&format!(
            "SELECT {} FROM escrow_addresses WHERE trade_id = $1 AND asset = $2",
            SELECT_COLUMNS
        ))
        .bind(trade_id)
        .bind(asset.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Self::row_to_address(&row)
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM escrow_addresses
            WHERE status = 'expired' OR (status = 'pending' AND expires_at <= $1)
            "#,
        )
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn find_by_address(&self, address: &str) -> Result<Option<EscrowAddress>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM escrow_addresses WHERE address = $1 \
             ORDER BY created_at DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_address).transpose()
    }

    async fn latest_for_trade(&self, trade_id: &str) -> Result<Option<EscrowAddress>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM escrow_addresses WHERE trade_id = $1 \
             ORDER BY created_at DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(trade_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_address).transpose()
    }

    async fn transition(
        &self,
        trade_id: &str,
        asset: Asset,
        from: AddressStatus,
        to: AddressStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE escrow_addresses SET status = $1
            WHERE trade_id = $2 AND asset = $3 AND status = $4
            "#,
        )
        .bind(to.as_str())
        .bind(trade_id)
        .bind(asset.as_str())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn apply_deposit(
        &self,
        address: &str,
        update: &DepositUpdate,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE escrow_addresses
            SET status = $1, received_amount = $2, tx_hash = $3, confirmations = $4
            WHERE address = $5 AND status IN ('pending', 'funded')
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.received_amount)
        .bind(&update.tx_hash)
        .bind(update.confirmations as i32)
        .bind(address)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
