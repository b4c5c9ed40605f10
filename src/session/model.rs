//! Session records
//!
//! A session is a snapshot of an interrupted multi-step flow. The payload is
//! a closed union over the four flow types, each with its own typed data.
//!
//! Stored JSON shape:
//!
//! ```text
//! {id, type, step, data, timestamp, expiresAt}    timestamps in unix ms
//! ```

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::error::SessionError;
use crate::core_types::{Asset, ObligationId, TradeId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    CreditPurchase,
    CryptoBuy,
    CryptoSell,
    Escrow,
}

impl SessionType {
    pub const ALL: [SessionType; 4] = [
        SessionType::CreditPurchase,
        SessionType::CryptoBuy,
        SessionType::CryptoSell,
        SessionType::Escrow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::CreditPurchase => "credit_purchase",
            SessionType::CryptoBuy => "crypto_buy",
            SessionType::CryptoSell => "crypto_sell",
            SessionType::Escrow => "escrow",
        }
    }

    /// Scope key holding every session of this type
    pub fn storage_key(&self) -> String {
        format!("sessions.{}", self.as_str())
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SessionError::UnsupportedType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditPurchaseData {
    pub credits: i64,
    pub amount: Decimal,
    pub asset: Asset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obligation_id: Option<ObligationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoBuyData {
    pub asset: Asset,
    pub amount_crypto: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_fiat: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escrow_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoSellData {
    pub asset: Asset,
    pub amount_crypto: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_account: Option<String>,
}

/// Which side of the trade the user is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscrowMode {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowData {
    pub trade_id: TradeId,
    pub trade_amount: Decimal,
    pub mode: EscrowMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_fee: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionPayload {
    CreditPurchase(CreditPurchaseData),
    CryptoBuy(CryptoBuyData),
    CryptoSell(CryptoSellData),
    Escrow(EscrowData),
}

impl SessionPayload {
    pub fn session_type(&self) -> SessionType {
        match self {
            SessionPayload::CreditPurchase(_) => SessionType::CreditPurchase,
            SessionPayload::CryptoBuy(_) => SessionType::CryptoBuy,
            SessionPayload::CryptoSell(_) => SessionType::CryptoSell,
            SessionPayload::Escrow(_) => SessionType::Escrow,
        }
    }

    fn to_value(&self) -> Result<Value, SessionError> {
        let value = match self {
            SessionPayload::CreditPurchase(d) => serde_json::to_value(d),
            SessionPayload::CryptoBuy(d) => serde_json::to_value(d),
            SessionPayload::CryptoSell(d) => serde_json::to_value(d),
            SessionPayload::Escrow(d) => serde_json::to_value(d),
        };
        value.map_err(|e| SessionError::Corrupt(e.to_string()))
    }

    /// Parse `data` as the payload of a `kind` session
    pub fn from_value(kind: SessionType, data: Value) -> Result<Self, SessionError> {
        let payload = match kind {
            SessionType::CreditPurchase => serde_json::from_value(data).map(SessionPayload::CreditPurchase),
            SessionType::CryptoBuy => serde_json::from_value(data).map(SessionPayload::CryptoBuy),
            SessionType::CryptoSell => serde_json::from_value(data).map(SessionPayload::CryptoSell),
            SessionType::Escrow => serde_json::from_value(data).map(SessionPayload::Escrow),
        };
        payload.map_err(|e| SessionError::Corrupt(format!("{} data: {}", kind, e)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub step: u32,
    pub payload: SessionPayload,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Wire form, parsed in two stages so a bad payload can be told apart from
/// an unknown type
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSession {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    step: i64,
    data: Value,
    timestamp: i64,
    expires_at: i64,
}

impl Session {
    pub fn new(
        id: &str,
        step: u32,
        payload: SessionPayload,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Self, SessionError> {
        if step < 1 {
            return Err(SessionError::InvalidStep(step as i64));
        }
        Ok(Self {
            id: id.to_string(),
            step,
            payload,
            timestamp: now,
            expires_at: now + ttl,
        })
    }

    #[inline]
    pub fn session_type(&self) -> SessionType {
        self.payload.session_type()
    }

    /// Live while younger than `ttl`
    #[inline]
    pub fn is_live(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.timestamp < ttl
    }

    pub fn to_json(&self) -> Result<Value, SessionError> {
        let raw = RawSession {
            id: self.id.clone(),
            kind: self.session_type().as_str().to_string(),
            step: self.step as i64,
            data: self.payload.to_value()?,
            timestamp: self.timestamp.timestamp_millis(),
            expires_at: self.expires_at.timestamp_millis(),
        };
        serde_json::to_value(raw).map_err(|e| SessionError::Corrupt(e.to_string()))
    }

    pub fn from_json(value: Value) -> Result<Self, SessionError> {
        let raw: RawSession =
            serde_json::from_value(value).map_err(|e| SessionError::Corrupt(e.to_string()))?;

        let kind: SessionType = raw.kind.parse()?;
        if raw.step < 1 {
            return Err(SessionError::InvalidStep(raw.step));
        }
        let step = u32::try_from(raw.step).map_err(|_| SessionError::InvalidStep(raw.step))?;
        if raw.id.trim().is_empty() {
            return Err(SessionError::Corrupt("empty session id".into()));
        }

        Ok(Self {
            id: raw.id,
            step,
            payload: SessionPayload::from_value(kind, raw.data)?,
            timestamp: millis(raw.timestamp)?,
            expires_at: millis(raw.expires_at)?,
        })
    }
}

fn millis(ms: i64) -> Result<DateTime<Utc>, SessionError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| SessionError::Corrupt(format!("timestamp {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn credit_payload() -> SessionPayload {
        SessionPayload::CreditPurchase(CreditPurchaseData {
            credits: 100,
            amount: "0.01".parse().unwrap(),
            asset: Asset::Btc,
            payment_address: Some("tb1qx".into()),
            obligation_id: None,
        })
    }

    #[test]
    fn test_json_shape() {
        let now = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let s = Session::new("s1", 2, credit_payload(), now, Duration::hours(24)).unwrap();
        let v = s.to_json().unwrap();

        assert_eq!(v["id"], json!("s1"));
        assert_eq!(v["type"], json!("credit_purchase"));
        assert_eq!(v["step"], json!(2));
        assert_eq!(v["timestamp"], json!(1_700_000_000_000i64));
        assert_eq!(v["expiresAt"], json!(1_700_086_400_000i64));
        assert_eq!(v["data"]["paymentAddress"], json!("tb1qx"));

        assert_eq!(Session::from_json(v).unwrap(), s);
    }

    #[test]
    fn test_parse_errors_are_distinguished() {
        let base = json!({"id":"s1","type":"credit_purchase","step":1,"data":{"credits":1,"amount":"1","asset":"BTC"},"timestamp":0,"expiresAt":1});
        assert!(Session::from_json(base.clone()).is_ok());

        let mut unknown = base.clone();
        unknown["type"] = json!("loan");
        assert_eq!(
            Session::from_json(unknown),
            Err(SessionError::UnsupportedType("loan".into()))
        );

        let mut step = base.clone();
        step["step"] = json!(0);
        assert_eq!(Session::from_json(step), Err(SessionError::InvalidStep(0)));

        let mut data = base.clone();
        data["data"] = json!({"credits":"lots"});
        assert!(matches!(Session::from_json(data), Err(SessionError::Corrupt(_))));

        assert!(matches!(Session::from_json(json!("garbage")), Err(SessionError::Corrupt(_))));
    }

    #[test]
    fn test_step_must_be_positive() {
        assert_eq!(
            Session::new("s1", 0, credit_payload(), Utc::now(), Duration::hours(24)),
            Err(SessionError::InvalidStep(0))
        );
    }

    #[test]
    fn test_liveness_boundary() {
        let now = Utc::now();
        let ttl = Duration::hours(24);
        let s = Session::new("s1", 1, credit_payload(), now, ttl).unwrap();
        assert!(s.is_live(now + Duration::hours(23), ttl));
        assert!(!s.is_live(now + ttl, ttl));
    }

    #[test]
    fn test_escrow_payload_round_trip() {
        let payload = SessionPayload::Escrow(EscrowData {
            trade_id: "t1".into(),
            trade_amount: "0.5".parse().unwrap(),
            mode: EscrowMode::Sell,
            delivery_type: Some("cash".into()),
            delivery_address: None,
            service_fee: None,
        });
        let s = Session::new("e1", 3, payload, Utc::now(), Duration::hours(24)).unwrap();
        let v = s.to_json().unwrap();
        assert_eq!(v["data"]["mode"], json!("sell"));
        assert_eq!(v["data"]["tradeId"], json!("t1"));
        assert_eq!(Session::from_json(v).unwrap().session_type(), SessionType::Escrow);
    }
}
