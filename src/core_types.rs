//! Core types used throughout the system
//!
//! Identifiers are opaque strings issued by the surrounding application
//! (trades, users and obligations are UUID-like values), so they are kept
//! as aliases rather than newtypes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

/// User ID - owner of an obligation or a session
pub type UserId = String;

/// Trade ID - one escrow-backed trade between a customer and a merchant
pub type TradeId = String;

/// Obligation ID - one unit of expected incoming funds
pub type ObligationId = String;

/// Crypto assets accepted into escrow.
///
/// # Constraints:
/// - `decimals()` is the fixed-point scale of the asset's smallest unit
///   as reported by the custody provider (satoshi, wei, micro-USDT)
/// - Serialized as the upper-case ticker ("BTC", "ETH", "USDT")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Asset {
    Btc,
    Eth,
    Usdt,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unsupported asset: {0}")]
pub struct UnsupportedAsset(pub String);

impl Asset {
    pub const ALL: [Asset; 3] = [Asset::Btc, Asset::Eth, Asset::Usdt];

    /// Decimal places of the smallest on-chain unit
    #[inline]
    pub fn decimals(&self) -> u32 {
        match self {
            Asset::Btc => 8,
            Asset::Eth => 18,
            Asset::Usdt => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Asset::Btc => "BTC",
            Asset::Eth => "ETH",
            Asset::Usdt => "USDT",
        }
    }

    /// Map a custody-provider coin slug onto an asset.
    ///
    /// Testnet slugs (`tbtc`, `hteth`, `tsol`) resolve to the same asset.
    /// USDT is custodied on Solana, so `sol` resolves to USDT.
    pub fn from_coin(coin: &str) -> Option<Self> {
        match coin.trim().to_ascii_lowercase().as_str() {
            "btc" | "tbtc" => Some(Asset::Btc),
            "eth" | "hteth" | "teth" => Some(Asset::Eth),
            "usdt" | "sol" | "tsol" => Some(Asset::Usdt),
            _ => None,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Asset {
    type Err = UnsupportedAsset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BTC" => Ok(Asset::Btc),
            "ETH" => Ok(Asset::Eth),
            "USDT" => Ok(Asset::Usdt),
            _ => Asset::from_coin(s).ok_or_else(|| UnsupportedAsset(s.to_string())),
        }
    }
}

/// Source of "now" for every expiry decision.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_decimals() {
        assert_eq!(Asset::Btc.decimals(), 8);
        assert_eq!(Asset::Eth.decimals(), 18);
        assert_eq!(Asset::Usdt.decimals(), 6);
    }

    #[test]
    fn test_asset_from_coin_slug() {
        assert_eq!(Asset::from_coin("btc"), Some(Asset::Btc));
        assert_eq!(Asset::from_coin("TBTC"), Some(Asset::Btc));
        assert_eq!(Asset::from_coin("hteth"), Some(Asset::Eth));
        assert_eq!(Asset::from_coin("sol"), Some(Asset::Usdt));
        assert_eq!(Asset::from_coin("doge"), None);
    }

    #[test]
    fn test_asset_parse_and_display() {
        assert_eq!("btc".parse::<Asset>().unwrap(), Asset::Btc);
        assert_eq!("USDT".parse::<Asset>().unwrap(), Asset::Usdt);
        assert_eq!(Asset::Eth.to_string(), "ETH");
        assert!("XRP".parse::<Asset>().is_err());
    }

    #[test]
    fn test_asset_serde_ticker() {
        let json = serde_json::to_string(&Asset::Usdt).unwrap();
        assert_eq!(json, "\"USDT\"");
        let back: Asset = serde_json::from_str("\"BTC\"").unwrap();
        assert_eq!(back, Asset::Btc);
    }

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::hours(25));
        assert_eq!(clock.now(), start + Duration::hours(25));
    }
}
