//! Transfer events from the custody notification channel
//!
//! Two wire shapes are accepted:
//! - flat: `{type: "transfer", data: {address, value, coin, state, confirmations?, txHash}}`
//! - wallet: `{type: "transfer", coin, transfer: {txid, state, confirmations?, outputs: [{address, value}]}}`
//!
//! A wallet transfer fans out into one event per output, each keyed by
//! (txid, output address).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::ReconcileError;
use crate::core_types::Asset;

/// Provider-reported transfer state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Confirmed,
    Unconfirmed,
    Failed,
    Other(String),
}

impl TransferState {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "confirmed" => TransferState::Confirmed,
            "unconfirmed" | "pending" => TransferState::Unconfirmed,
            "failed" | "rejected" | "removed" => TransferState::Failed,
            other => TransferState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TransferState::Confirmed => "confirmed",
            TransferState::Unconfirmed => "unconfirmed",
            TransferState::Failed => "failed",
            TransferState::Other(s) => s,
        }
    }

    #[inline]
    pub fn is_confirmed(&self) -> bool {
        matches!(self, TransferState::Confirmed)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotency key: one effective application per (tx_hash, address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EventKey {
    pub tx_hash: String,
    pub address: String,
}

/// Inbound transfer, amount still in the asset's smallest unit
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub asset: Asset,
    pub address: String,
    pub amount: Decimal,
    pub tx_hash: String,
    pub confirmations: u32,
    pub state: TransferState,
}

impl TransferEvent {
    pub fn key(&self) -> EventKey {
        EventKey {
            tx_hash: self.tx_hash.clone(),
            address: self.address.clone(),
        }
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub coin: Option<String>,
    #[serde(default)]
    pub data: Option<TransferData>,
    #[serde(default)]
    pub transfer: Option<WalletTransfer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferData {
    pub address: String,
    #[serde(default)]
    pub value: Option<Decimal>,
    #[serde(default)]
    pub value_string: Option<String>,
    pub coin: String,
    pub state: String,
    #[serde(default)]
    pub confirmations: Option<u32>,
    #[serde(alias = "txid", alias = "hash")]
    pub tx_hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletTransfer {
    pub txid: String,
    pub state: String,
    #[serde(default)]
    pub coin: Option<String>,
    #[serde(default)]
    pub confirmations: Option<u32>,
    #[serde(default)]
    pub outputs: Vec<TransferOutput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutput {
    pub address: String,
    #[serde(default)]
    pub value: Option<Decimal>,
    #[serde(default)]
    pub value_string: Option<String>,
}

/// `valueString` wins: it survives 18-decimal amounts that overflow a
/// JSON number
fn pick_amount(value: Option<Decimal>, value_string: Option<&str>) -> Result<Decimal, ReconcileError> {
    if let Some(s) = value_string.map(str::trim).filter(|s| !s.is_empty()) {
        return Decimal::from_str(s)
            .map_err(|_| ReconcileError::Malformed(format!("bad valueString: {}", s)));
    }
    value.ok_or_else(|| ReconcileError::Malformed("transfer has no value".into()))
}

fn resolve_asset(coin: Option<&str>) -> Result<Asset, ReconcileError> {
    let coin = coin.ok_or_else(|| ReconcileError::Malformed("transfer has no coin".into()))?;
    Asset::from_coin(coin).ok_or_else(|| ReconcileError::Malformed(format!("unsupported coin: {}", coin)))
}

fn require(field: &str, value: &str) -> Result<String, ReconcileError> {
    let v = value.trim();
    if v.is_empty() {
        return Err(ReconcileError::Malformed(format!("{} is empty", field)));
    }
    Ok(v.to_string())
}

impl WebhookPayload {
    pub fn parse(body: &[u8]) -> Result<Self, ReconcileError> {
        serde_json::from_slice(body).map_err(|e| ReconcileError::Malformed(e.to_string()))
    }

    #[inline]
    pub fn is_transfer(&self) -> bool {
        self.kind == "transfer"
    }

    /// Decode into transfer events. Non-transfer notifications yield none.
    pub fn into_events(self) -> Result<Vec<TransferEvent>, ReconcileError> {
        if !self.is_transfer() {
            return Ok(Vec::new());
        }

        if let Some(data) = self.data {
            let event = TransferEvent {
                asset: resolve_asset(Some(data.coin.as_str()))?,
                address: require("address", &data.address)?,
                amount: pick_amount(data.value, data.value_string.as_deref())?,
                tx_hash: require("txHash", &data.tx_hash)?,
                confirmations: data.confirmations.unwrap_or(0),
                state: TransferState::parse(&data.state),
            };
            return Ok(vec![event]);
        }

        if let Some(transfer) = self.transfer {
            let asset = resolve_asset(transfer.coin.as_deref().or(self.coin.as_deref()))?;
            let tx_hash = require("txid", &transfer.txid)?;
            let state = TransferState::parse(&transfer.state);
            let confirmations = transfer.confirmations.unwrap_or(0);

            return transfer
                .outputs
                .into_iter()
                .map(|out| {
                    Ok(TransferEvent {
                        asset,
                        address: require("output address", &out.address)?,
                        amount: pick_amount(out.value, out.value_string.as_deref())?,
                        tx_hash: tx_hash.clone(),
                        confirmations,
                        state: state.clone(),
                    })
                })
                .collect();
        }

        Err(ReconcileError::Malformed("transfer notification has no data".into()))
    }
}
