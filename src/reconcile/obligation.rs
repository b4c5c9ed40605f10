//! Pending obligations and their settlement
//!
//! An obligation is expected incoming funds on one payment address: either
//! a credit purchase or a trade escrow. Settlement is one unit of work:
//! the event key is marked processed, the obligation moves
//! `pending -> completed`, and the dependent effect (credits or trade escrow
//! status, plus the escrow address record) is applied. Either everything
//! lands or nothing does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use super::event::EventKey;
use crate::core_types::{Asset, ObligationId, TradeId, UserId};
use crate::escrow::ledger::{AddressLedger, AddressStatus, DepositUpdate};
use crate::store::StoreError;
use crate::trade::{EscrowStatus, InvalidTransition, TradeRepository, TransitionAxis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationStatus {
    Pending,
    Completed,
    Expired,
    Mismatched,
}

impl ObligationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationStatus::Pending => "pending",
            ObligationStatus::Completed => "completed",
            ObligationStatus::Expired => "expired",
            ObligationStatus::Mismatched => "mismatched",
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ObligationStatus::Pending)
    }
}

impl fmt::Display for ObligationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObligationStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ObligationStatus::Pending),
            "completed" => Ok(ObligationStatus::Completed),
            "expired" => Ok(ObligationStatus::Expired),
            "mismatched" => Ok(ObligationStatus::Mismatched),
            other => Err(StoreError::Corrupt(format!("obligation status: {}", other))),
        }
    }
}

/// What the funds pay for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObligationKind {
    CreditPurchase { credits: i64 },
    TradeEscrow { trade_id: TradeId },
}

impl ObligationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationKind::CreditPurchase { .. } => "credit_purchase",
            ObligationKind::TradeEscrow { .. } => "trade_escrow",
        }
    }

    /// Address ledger key for this obligation
    pub fn ledger_key(&self, obligation_id: &str) -> String {
        match self {
            ObligationKind::CreditPurchase { .. } => format!("credit-{}", obligation_id),
            ObligationKind::TradeEscrow { trade_id } => trade_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingObligation {
    pub id: ObligationId,
    pub owner_id: UserId,
    #[serde(flatten)]
    pub kind: ObligationKind,
    pub expected_amount: Decimal,
    pub asset: Asset,
    pub status: ObligationStatus,
    pub payment_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PendingObligation {
    pub fn new(
        id: &str,
        owner_id: &str,
        kind: ObligationKind,
        expected_amount: Decimal,
        asset: Asset,
        payment_address: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            owner_id: owner_id.to_string(),
            kind,
            expected_amount,
            asset,
            status: ObligationStatus::Pending,
            payment_address: payment_address.to_string(),
            received_amount: None,
            tx_hash: None,
            confirmed_at: None,
            created_at: now,
        }
    }
}

/// Out-of-tolerance deposit kept for manual reconciliation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discrepancy {
    pub obligation_id: ObligationId,
    pub tx_hash: String,
    pub address: String,
    pub expected: Decimal,
    pub received: Decimal,
    pub delta: Decimal,
    pub recorded_at: DateTime<Utc>,
}

/// Accepted deposit to apply
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub key: EventKey,
    pub obligation_id: ObligationId,
    pub received: Decimal,
    pub confirmations: u32,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    Applied,
    /// Event key already consumed
    AlreadyProcessed,
    /// Obligation left `pending` before this settlement landed
    NotPending,
    /// Trade escrow axis refused `pending -> crypto_received`; nothing written
    Rejected(InvalidTransition),
}

#[async_trait]
pub trait ObligationStore: Send + Sync {
    /// Conflict when the id exists or another obligation is pending on the
    /// same address
    async fn insert(&self, obligation: &PendingObligation) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<PendingObligation>, StoreError>;

    async fn find_pending_by_address(
        &self,
        address: &str,
    ) -> Result<Option<PendingObligation>, StoreError>;

    async fn is_processed(&self, key: &EventKey) -> Result<bool, StoreError>;

    async fn settle(&self, settlement: &Settlement) -> Result<SettleOutcome, StoreError>;

    /// Store the discrepancy and consume the key. The obligation stays
    /// pending. Returns false when the key was already consumed.
    async fn record_mismatch(
        &self,
        key: &EventKey,
        discrepancy: &Discrepancy,
        confirmations: u32,
    ) -> Result<bool, StoreError>;

    /// Manual resolution: close a pending obligation as mismatched
    async fn mark_mismatched(&self, id: &str) -> Result<bool, StoreError>;

    /// Expire pending obligations created before `older_than`
    async fn expire_pending(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn discrepancies(&self, obligation_id: &str) -> Result<Vec<Discrepancy>, StoreError>;

    async fn credits(&self, owner_id: &str) -> Result<i64, StoreError>;
}

fn escrow_rejection(from: EscrowStatus) -> InvalidTransition {
    InvalidTransition {
        axis: TransitionAxis::Escrow,
        from: from.to_string(),
        to: EscrowStatus::CryptoReceived.to_string(),
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryState {
    obligations: HashMap<ObligationId, PendingObligation>,
    processed: HashSet<EventKey>,
    discrepancies: Vec<Discrepancy>,
    credits: HashMap<UserId, i64>,
}

/// Single lock over all obligation state; trade and address effects go
/// through their own stores while the lock is held
pub struct MemoryObligationStore {
    state: Mutex<MemoryState>,
    trades: Arc<dyn TradeRepository>,
    ledger: Arc<dyn AddressLedger>,
}

impl MemoryObligationStore {
    pub fn new(trades: Arc<dyn TradeRepository>, ledger: Arc<dyn AddressLedger>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            trades,
            ledger,
        }
    }
}

#[async_trait]
impl ObligationStore for MemoryObligationStore {
    async fn insert(&self, obligation: &PendingObligation) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.obligations.contains_key(&obligation.id) {
            return Err(StoreError::Conflict(format!("obligation {} exists", obligation.id)));
        }
        let address_taken = state.obligations.values().any(|o| {
            o.status == ObligationStatus::Pending && o.payment_address == obligation.payment_address
        });
        if address_taken {
            return Err(StoreError::Conflict(format!(
                "pending obligation exists on {}",
                obligation.payment_address
            )));
        }
        state
            .obligations
            .insert(obligation.id.clone(), obligation.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PendingObligation>, StoreError> {
        Ok(self.state.lock().await.obligations.get(id).cloned())
    }

    async fn find_pending_by_address(
        &self,
        address: &str,
    ) -> Result<Option<PendingObligation>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .obligations
            .values()
            .find(|o| o.status == ObligationStatus::Pending && o.payment_address == address)
            .cloned())
    }

    async fn is_processed(&self, key: &EventKey) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.processed.contains(key))
    }

    async fn settle(&self, settlement: &Settlement) -> Result<SettleOutcome, StoreError> {
        let mut state = self.state.lock().await;

        if state.processed.contains(&settlement.key) {
            return Ok(SettleOutcome::AlreadyProcessed);
        }
        let obligation = match state.obligations.get(&settlement.obligation_id) {
            Some(o) if o.status == ObligationStatus::Pending => o.clone(),
            _ => return Ok(SettleOutcome::NotPending),
        };

        // Effects that can be refused go first so a refusal writes nothing
        if let ObligationKind::TradeEscrow { trade_id } = &obligation.kind {
            let advanced = self
                .trades
                .update_escrow_status_if(trade_id, EscrowStatus::Pending, EscrowStatus::CryptoReceived)
                .await?;
            if !advanced {
                match self.trades.get(trade_id).await? {
                    Some(trade) => {
                        return Ok(SettleOutcome::Rejected(escrow_rejection(trade.escrow_status)));
                    }
                    None => warn!(trade_id, obligation_id = %obligation.id, "Escrow obligation has no trade record"),
                }
            }
        }

        self.ledger
            .apply_deposit(
                &obligation.payment_address,
                &DepositUpdate {
                    status: AddressStatus::Confirmed,
                    received_amount: settlement.received,
                    tx_hash: settlement.key.tx_hash.clone(),
                    confirmations: settlement.confirmations,
                },
            )
            .await?;

        if let ObligationKind::CreditPurchase { credits } = obligation.kind {
            *state.credits.entry(obligation.owner_id.clone()).or_insert(0) += credits;
        }
        state.processed.insert(settlement.key.clone());
        if let Some(o) = state.obligations.get_mut(&settlement.obligation_id) {
            o.status = ObligationStatus::Completed;
            o.received_amount = Some(settlement.received);
            o.tx_hash = Some(settlement.key.tx_hash.clone());
            o.confirmed_at = Some(settlement.confirmed_at);
        }
        Ok(SettleOutcome::Applied)
    }

    async fn record_mismatch(
        &self,
        key: &EventKey,
        discrepancy: &Discrepancy,
        confirmations: u32,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.processed.contains(key) {
            return Ok(false);
        }

        self.ledger
            .apply_deposit(
                &key.address,
                &DepositUpdate {
                    status: AddressStatus::Funded,
                    received_amount: discrepancy.received,
                    tx_hash: key.tx_hash.clone(),
                    confirmations,
                },
            )
            .await?;

        state.processed.insert(key.clone());
        state.discrepancies.push(discrepancy.clone());
        Ok(true)
    }

    async fn mark_mismatched(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.obligations.get_mut(id) {
            Some(o) if o.status == ObligationStatus::Pending => {
                o.status = ObligationStatus::Mismatched;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_pending(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut expired = 0;
        for o in state.obligations.values_mut() {
            if o.status == ObligationStatus::Pending && o.created_at < older_than {
                o.status = ObligationStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn discrepancies(&self, obligation_id: &str) -> Result<Vec<Discrepancy>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .discrepancies
            .iter()
            .filter(|d| d.obligation_id == obligation_id)
            .cloned()
            .collect())
    }

    async fn credits(&self, owner_id: &str) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.credits.get(owner_id).copied().unwrap_or(0))
    }
}

// ============================================================================
// PostgreSQL store
// ============================================================================

const OBLIGATION_COLUMNS: &str = "id, owner_id, kind, credits, trade_id, expected_amount, asset, \
                                  status, payment_address, received_amount, tx_hash, \
                                  confirmed_at, created_at";

pub struct PgObligationStore {
    pool: PgPool,
}

impl PgObligationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_obligation(row: &PgRow) -> Result<PendingObligation, StoreError> {
        let kind: String = row.try_get("kind")?;
        let kind = match kind.as_str() {
            "credit_purchase" => ObligationKind::CreditPurchase {
                credits: row.try_get("credits")?,
            },
            "trade_escrow" => {
                let trade_id: Option<String> = row.try_get("trade_id")?;
                ObligationKind::TradeEscrow {
                    trade_id: trade_id
                        .ok_or_else(|| StoreError::Corrupt("trade escrow without trade_id".into()))?,
                }
            }
            other => return Err(StoreError::Corrupt(format!("obligation kind: {}", other))),
        };
        let asset: String = row.try_get("asset")?;
        let status: String = row.try_get("status")?;

        Ok(PendingObligation {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            kind,
            expected_amount: row.try_get("expected_amount")?,
            asset: asset
                .parse()
                .map_err(|e: crate::core_types::UnsupportedAsset| StoreError::Corrupt(e.to_string()))?,
            status: status.parse()?,
            payment_address: row.try_get("payment_address")?,
            received_amount: row.try_get("received_amount")?,
            tx_hash: row.try_get("tx_hash")?,
            confirmed_at: row.try_get("confirmed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl ObligationStore for PgObligationStore {
    async fn insert(&self, o: &PendingObligation) -> Result<(), StoreError> {
        let (credits, trade_id) = match &o.kind {
            ObligationKind::CreditPurchase { credits } => (Some(*credits), None),
            ObligationKind::TradeEscrow { trade_id } => (None, Some(trade_id.as_str())),
        };

        // partial unique index on payment_address WHERE status = 'pending'
        sqlx::query(
            r#"
            INSERT INTO payment_obligations
                (id, owner_id, kind, credits, trade_id, expected_amount, asset,
                 status, payment_address, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&o.id)
        .bind(&o.owner_id)
        .bind(o.kind.as_str())
        .bind(credits)
        .bind(trade_id)
        .bind(o.expected_amount)
        .bind(o.asset.as_str())
        .bind(o.status.as_str())
        .bind(&o.payment_address)
        .bind(o.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PendingObligation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payment_obligations WHERE id = $1",
            OBLIGATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_obligation).transpose()
    }

    async fn find_pending_by_address(
        &self,
        address: &str,
    ) -> Result<Option<PendingObligation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payment_obligations WHERE payment_address = $1 AND status = 'pending'",
            OBLIGATION_COLUMNS
        ))
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_obligation).transpose()
    }

    async fn is_processed(&self, key: &EventKey) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 AS hit FROM processed_transfer_events WHERE tx_hash = $1 AND address = $2",
        )
        .bind(&key.tx_hash)
        .bind(&key.address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn settle(&self, s: &Settlement) -> Result<SettleOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // 1. Consume the idempotency key
        let claimed = sqlx::query(
            r#"
            INSERT INTO processed_transfer_events (tx_hash, address, obligation_id, processed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tx_hash, address) DO NOTHING
            "#,
        )
        .bind(&s.key.tx_hash)
        .bind(&s.key.address)
        .bind(&s.obligation_id)
        .bind(s.confirmed_at)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(SettleOutcome::AlreadyProcessed);
        }

        // 2. pending -> completed
        let row = sqlx::query(&format!(
            r#"
            UPDATE payment_obligations
            SET status = 'completed', received_amount = $1, tx_hash = $2, confirmed_at = $3
            WHERE id = $4 AND status = 'pending'
            RETURNING {}
            "#,
            OBLIGATION_COLUMNS
        ))
        .bind(s.received)
        .bind(&s.key.tx_hash)
        .bind(s.confirmed_at)
        .bind(&s.obligation_id)
        .fetch_optional(&mut *tx)
        .await?;

        let obligation = match row {
            Some(row) => Self::row_to_obligation(&row)?,
            None => {
                tx.rollback().await?;
                return Ok(SettleOutcome::NotPending);
            }
        };

        // 3. Dependent effect
        match &obligation.kind {
            ObligationKind::CreditPurchase { credits } => {
                sqlx::query(
                    r#"
                    INSERT INTO user_credits (user_id, credits, updated_at)
                    VALUES ($1, $2, NOW())
                    ON CONFLICT (user_id)
                    DO UPDATE SET credits = user_credits.credits + EXCLUDED.credits, updated_at = NOW()
                    "#,
                )
                .bind(&obligation.owner_id)
                .bind(*credits)
                .execute(&mut *tx)
                .await?;
            }
            ObligationKind::TradeEscrow { trade_id } => {
                let advanced = sqlx::query(
                    "UPDATE trades SET escrow_status = $1, updated_at = NOW() \
                     WHERE id = $2 AND escrow_status = $3",
                )
                .bind(EscrowStatus::CryptoReceived.to_string())
                .bind(trade_id)
                .bind(EscrowStatus::Pending.to_string())
                .execute(&mut *tx)
                .await?;

                if advanced.rows_affected() == 0 {
                    let current = sqlx::query("SELECT escrow_status FROM trades WHERE id = $1")
                        .bind(trade_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                    match current {
                        Some(row) => {
                            let status: String = row.try_get("escrow_status")?;
                            let status: EscrowStatus = status.parse().map_err(StoreError::Corrupt)?;
                            tx.rollback().await?;
                            return Ok(SettleOutcome::Rejected(escrow_rejection(status)));
                        }
                        None => {
                            warn!(trade_id, obligation_id = %obligation.id, "Escrow obligation has no trade record")
                        }
                    }
                }
            }
        }

        // 4. Address record
        sqlx::query(
            r#"
            UPDATE escrow_addresses
            SET status = 'confirmed', received_amount = $1, tx_hash = $2, confirmations = $3
            WHERE address = $4 AND status IN ('pending', 'funded')
            "#,
        )
        .bind(s.received)
        .bind(&s.key.tx_hash)
        .bind(s.confirmations as i32)
        .bind(&obligation.payment_address)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(SettleOutcome::Applied)
    }

    async fn record_mismatch(
        &self,
        key: &EventKey,
        d: &Discrepancy,
        confirmations: u32,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO processed_transfer_events (tx_hash, address, obligation_id, processed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tx_hash, address) DO NOTHING
            "#,
        )
        .bind(&key.tx_hash)
        .bind(&key.address)
        .bind(&d.obligation_id)
        .bind(d.recorded_at)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO obligation_discrepancies
                (obligation_id, tx_hash, address, expected, received, delta, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&d.obligation_id)
        .bind(&d.tx_hash)
        .bind(&d.address)
        .bind(d.expected)
        .bind(d.received)
        .bind(d.delta)
        .bind(d.recorded_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE escrow_addresses
            SET status = 'funded', received_amount = $1, tx_hash = $2, confirmations = $3
            WHERE address = $4 AND status IN ('pending', 'funded')
            "#,
        )
        .bind(d.received)
        .bind(&key.tx_hash)
        .bind(confirmations as i32)
        .bind(&key.address)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_mismatched(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE payment_obligations SET status = 'mismatched' WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn expire_pending(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE payment_obligations SET status = 'expired' WHERE status = 'pending' AND created_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn discrepancies(&self, obligation_id: &str) -> Result<Vec<Discrepancy>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT obligation_id, tx_hash, address, expected, received, delta, recorded_at
            FROM obligation_discrepancies
            WHERE obligation_id = $1
            ORDER BY recorded_at
            "#,
        )
        .bind(obligation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Discrepancy {
                    obligation_id: row.try_get("obligation_id")?,
                    tx_hash: row.try_get("tx_hash")?,
                    address: row.try_get("address")?,
                    expected: row.try_get("expected")?,
                    received: row.try_get("received")?,
                    delta: row.try_get("delta")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    async fn credits(&self, owner_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT credits FROM user_credits WHERE user_id = $1")
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.try_get("credits")?),
            None => Ok(0),
        }
    }
}
