//! Trade persistence
//!
//! All status updates are atomic compare-and-set: the write only lands
//! when the stored status still equals the expected one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;

use super::state::{EscrowStatus, TradeStatus};
use crate::core_types::{Asset, Clock, TradeId, UserId};
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeRecord {
    pub id: TradeId,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub asset: Asset,
    pub amount_crypto: Decimal,
    pub amount_fiat: Option<Decimal>,
    pub status: TradeStatus,
    pub escrow_status: EscrowStatus,
    pub escrow_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradeRecord {
    /// New trade awaiting merchant acceptance, escrow not yet funded
    pub fn new(
        id: &str,
        buyer_id: &str,
        seller_id: &str,
        asset: Asset,
        amount_crypto: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            buyer_id: buyer_id.to_string(),
            seller_id: seller_id.to_string(),
            asset,
            amount_crypto,
            amount_fiat: None,
            status: TradeStatus::PendingAcceptance,
            escrow_status: EscrowStatus::Pending,
            escrow_address: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait TradeRepository: Send + Sync {
    /// Returns false when a trade with the same id exists
    async fn insert(&self, trade: &TradeRecord) -> Result<bool, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<TradeRecord>, StoreError>;

    async fn update_status_if(
        &self,
        id: &str,
        expected: TradeStatus,
        new: TradeStatus,
    ) -> Result<bool, StoreError>;

    async fn update_escrow_status_if(
        &self,
        id: &str,
        expected: EscrowStatus,
        new: EscrowStatus,
    ) -> Result<bool, StoreError>;

    async fn set_escrow_address(&self, id: &str, address: &str) -> Result<bool, StoreError>;
}

// ============================================================================
// In-memory repository
// ============================================================================

pub struct MemoryTradeRepository {
    trades: DashMap<TradeId, TradeRecord>,
    clock: Arc<dyn Clock>,
}

impl MemoryTradeRepository {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            trades: DashMap::new(),
            clock,
        }
    }
}

#[async_trait]
impl TradeRepository for MemoryTradeRepository {
    async fn insert(&self, trade: &TradeRecord) -> Result<bool, StoreError> {
        match self.trades.entry(trade.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => {
                v.insert(trade.clone());
                Ok(true)
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<TradeRecord>, StoreError> {
        Ok(self.trades.get(id).map(|t| t.clone()))
    }

    async fn update_status_if(
        &self,
        id: &str,
        expected: TradeStatus,
        new: TradeStatus,
    ) -> Result<bool, StoreError> {
        match self.trades.get_mut(id) {
            Some(mut t) if t.status == expected => {
                t.status = new;
                t.updated_at = self.clock.now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_escrow_status_if(
        &self,
        id: &str,
        expected: EscrowStatus,
        new: EscrowStatus,
    ) -> Result<bool, StoreError> {
        match self.trades.get_mut(id) {
            Some(mut t) if t.escrow_status == expected => {
                t.escrow_status = new;
                t.updated_at = self.clock.now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_escrow_address(&self, id: &str, address: &str) -> Result<bool, StoreError> {
        match self.trades.get_mut(id) {
            Some(mut t) => {
                t.escrow_address = Some(address.to_string());
                t.updated_at = self.clock.now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ============================================================================
// PostgreSQL repository
// ============================================================================

pub struct PgTradeRepository {
    pool: PgPool,
}

impl PgTradeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &PgRow) -> Result<TradeRecord, StoreError> {
        let asset: String = row.try_get("asset")?;
        let status: String = row.try_get("status")?;
        let escrow_status: String = row.try_get("escrow_status")?;

        Ok(TradeRecord {
            id: row.try_get("id")?,
            buyer_id: row.try_get("buyer_id")?,
            seller_id: row.try_get("seller_id")?,
            asset: asset.parse().map_err(|e: crate::core_types::UnsupportedAsset| {
                StoreError::Corrupt(e.to_string())
            })?,
            amount_crypto: row.try_get("amount_crypto")?,
            amount_fiat: row.try_get("amount_fiat")?,
            status: status.parse().map_err(StoreError::Corrupt)?,
            escrow_status: escrow_status.parse().map_err(StoreError::Corrupt)?,
            escrow_address: row.try_get("escrow_address")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl TradeRepository for PgTradeRepository {
    async fn insert(&self, trade: &TradeRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades
                (id, buyer_id, seller_id, asset, amount_crypto, amount_fiat,
                 status, escrow_status, escrow_address, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&trade.id)
        .bind(&trade.buyer_id)
        .bind(&trade.seller_id)
        .bind(trade.asset.as_str())
        .bind(trade.amount_crypto)
        .bind(trade.amount_fiat)
        .bind(trade.status.to_string())
        .bind(trade.escrow_status.to_string())
        .bind(&trade.escrow_address)
        .bind(trade.created_at)
        .bind(trade.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<TradeRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, buyer_id, seller_id, asset, amount_crypto, amount_fiat,
                   status, escrow_status, escrow_address, created_at, updated_at
            FROM trades WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn update_status_if(
        &self,
        id: &str,
        expected: TradeStatus,
        new: TradeStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE trades SET status = $1, updated_at = NOW() WHERE id = $2 AND status = $3",
        )
        .bind(new.to_string())
        .bind(id)
        .bind(expected.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_escrow_status_if(
        &self,
        id: &str,
        expected: EscrowStatus,
        new: EscrowStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE trades SET escrow_status = $1, updated_at = NOW() \
             WHERE id = $2 AND escrow_status = $3",
        )
        .bind(new.to_string())
        .bind(id)
        .bind(expected.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_escrow_address(&self, id: &str, address: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE trades SET escrow_address = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(address)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
