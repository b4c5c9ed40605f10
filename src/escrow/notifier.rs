//! Escrow status notifier
//!
//! Observers subscribe per trade and receive the latest persisted snapshot
//! immediately, then every change published by the reconciler. Polling
//! goes through `get_status`. Neither path touches the custody provider.

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::error::EscrowError;
use super::ledger::{AddressLedger, AddressStatus, EscrowAddress};
use crate::core_types::{Asset, TradeId};

/// Point-in-time escrow status of a trade
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscrowStatusSnapshot {
    pub trade_id: TradeId,
    pub asset: Asset,
    pub address: String,
    pub status: AddressStatus,
    pub confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_amount: Option<Decimal>,
    pub confirmations: u32,
}

impl From<&EscrowAddress> for EscrowStatusSnapshot {
    fn from(r: &EscrowAddress) -> Self {
        Self {
            trade_id: r.trade_id.clone(),
            asset: r.asset,
            address: r.address.clone(),
            status: r.status,
            confirmed: matches!(r.status, AddressStatus::Confirmed | AddressStatus::Released),
            tx_hash: r.tx_hash.clone(),
            received_amount: r.received_amount,
            confirmations: r.confirmations,
        }
    }
}

/// Status callback
pub type StatusCallback = Arc<dyn Fn(&EscrowStatusSnapshot) + Send + Sync>;

/// Unique subscription identifier
pub type SubscriptionId = u64;

type Registry = DashMap<TradeId, Vec<(SubscriptionId, StatusCallback)>>;

pub struct EscrowStatusNotifier {
    ledger: Arc<dyn AddressLedger>,
    /// trade_id -> list of (subscription_id, callback)
    subscribers: Arc<Registry>,
    next_id: AtomicU64,
}

impl EscrowStatusNotifier {
    pub fn new(ledger: Arc<dyn AddressLedger>) -> Self {
        Self {
            ledger,
            subscribers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Latest persisted status for a trade, `None` when nothing was allocated
    pub async fn get_status(
        &self,
        trade_id: &str,
    ) -> Result<Option<EscrowStatusSnapshot>, EscrowError> {
        let record = self.ledger.latest_for_trade(trade_id).await?;
        Ok(record.as_ref().map(EscrowStatusSnapshot::from))
    }

    /// Register `callback` for a trade.
    ///
    /// The current snapshot, if one exists, is delivered before this
    /// returns. Dropping the returned `Subscription` unsubscribes.
    pub async fn subscribe<F>(&self, trade_id: &str, callback: F) -> Result<Subscription, EscrowError>
    where
        F: Fn(&EscrowStatusSnapshot) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: StatusCallback = Arc::new(callback);

        // Register first so a change published while we read is not lost
        self.subscribers
            .entry(trade_id.to_string())
            .or_default()
            .push((id, callback.clone()));

        tracing::debug!(trade_id, subscription_id = id, "Escrow status subscriber added");

        let subscription = Subscription {
            registry: self.subscribers.clone(),
            trade_id: trade_id.to_string(),
            id,
            active: AtomicBool::new(true),
        };

        if let Some(snapshot) = self.get_status(trade_id).await? {
            callback(&snapshot);
        }
        Ok(subscription)
    }

    /// Re-read the trade's status and push it to every subscriber
    pub async fn publish(&self, trade_id: &str) -> Result<usize, EscrowError> {
        match self.get_status(trade_id).await? {
            Some(snapshot) => Ok(self.notify(&snapshot)),
            None => Ok(0),
        }
    }

    /// Push a snapshot to the trade's subscribers, returns how many were called
    pub fn notify(&self, snapshot: &EscrowStatusSnapshot) -> usize {
        // Clone out so callbacks may unsubscribe without deadlocking the shard
        let callbacks: Vec<StatusCallback> = match self.subscribers.get(&snapshot.trade_id) {
            Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
            None => return 0,
        };

        for cb in &callbacks {
            cb(snapshot);
        }
        callbacks.len()
    }

    pub fn subscriber_count(&self, trade_id: &str) -> usize {
        self.subscribers.get(trade_id).map(|v| v.len()).unwrap_or(0)
    }
}

/// Handle returned by `subscribe`
pub struct Subscription {
    registry: Arc<Registry>,
    trade_id: TradeId,
    id: SubscriptionId,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Idempotent. Returns true only on the call that removed the callback.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }

        if let Some(mut list) = self.registry.get_mut(&self.trade_id) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                drop(list);
                self.registry
                    .remove_if(&self.trade_id, |_, v| v.is_empty());
            }
        }
        tracing::debug!(trade_id = %self.trade_id, subscription_id = self.id, "Escrow status subscriber removed");
        true
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
