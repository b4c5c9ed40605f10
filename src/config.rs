use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::core_types::Asset;

/// Env var that overrides `custody.access_token`
pub const CUSTODY_TOKEN_ENV: &str = "CUSTODY_ACCESS_TOKEN";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub gateway: GatewayConfig,
    /// PostgreSQL connection URL. In-memory stores are used when absent.
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub custody: CustodyConfig,
    #[serde(default)]
    pub escrow: EscrowConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub rates: RatesConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

/// Custody provider wallet for one asset
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WalletConfig {
    /// Provider coin slug, e.g. `tbtc`
    pub coin: String,
    pub wallet_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CustodyConfig {
    /// Provider API base. Empty selects the built-in mock provider.
    pub base_url: String,
    #[serde(default)]
    pub access_token: String,
    pub timeout_ms: u64,
    #[serde(default)]
    pub wallets: HashMap<Asset, WalletConfig>,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            access_token: String::new(),
            timeout_ms: 10_000,
            wallets: HashMap::new(),
        }
    }
}

impl CustodyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_mock(&self) -> bool {
        self.base_url.trim().is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EscrowConfig {
    pub address_ttl_secs: i64,
    /// Relative tolerance for reconciliation (0.01 = 1%)
    pub tolerance: Decimal,
    pub reconcile_timeout_ms: u64,
    pub obligation_ttl_secs: i64,
    pub sweep_interval_secs: u64,
    pub storage_retries: u32,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            address_ttl_secs: 86_400,
            tolerance: Decimal::new(1, 2),
            reconcile_timeout_ms: 5_000,
            obligation_ttl_secs: 86_400,
            sweep_interval_secs: 60,
            storage_retries: 3,
        }
    }
}

impl EscrowConfig {
    pub fn address_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.address_ttl_secs)
    }

    pub fn obligation_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.obligation_ttl_secs)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_hours: i64,
    /// Entry points on which a recovery prompt may be shown
    pub safe_routes: Vec<String>,
    /// Directory of the per-user durable session files
    pub data_dir: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 24,
            safe_routes: vec!["/home".to_string()],
            data_dir: "./data/sessions".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RatesConfig {
    /// Quote endpoint, queried as `GET {url}?asset=BTC`. Empty serves `fixed`.
    pub url: String,
    pub ttl_secs: i64,
    pub timeout_ms: u64,
    pub fixed: HashMap<Asset, Decimal>,
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            ttl_secs: 60,
            timeout_ms: 5_000,
            fixed: HashMap::new(),
        }
    }
}

impl RatesConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_fixed(&self) -> bool {
        self.url.trim().is_empty()
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config yaml: {}", config_path))?;

        if let Ok(token) = std::env::var(CUSTODY_TOKEN_ENV) {
            if !token.trim().is_empty() {
                config.custody.access_token = token;
            }
        }
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        anyhow::ensure!(
            config.escrow.tolerance >= Decimal::ZERO && config.escrow.tolerance < Decimal::ONE,
            "escrow.tolerance must be in [0, 1), got {}",
            config.escrow.tolerance
        );
        anyhow::ensure!(
            config.escrow.address_ttl_secs > 0,
            "escrow.address_ttl_secs must be positive"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: escrow_hub.log
use_json: false
rotation: daily
gateway:
  host: 0.0.0.0
  port: 8080
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.gateway.port, 8080);
        assert!(config.postgres_url.is_none());
        assert!(config.custody.is_mock());
        assert_eq!(config.escrow.address_ttl(), chrono::Duration::hours(24));
        assert_eq!(config.escrow.tolerance, Decimal::new(1, 2));
        assert_eq!(config.escrow.storage_retries, 3);
        assert_eq!(config.sessions.ttl_hours, 24);
        assert_eq!(config.sessions.safe_routes, vec!["/home".to_string()]);
        assert!(config.rates.is_fixed());
        assert_eq!(config.rates.ttl(), chrono::Duration::seconds(60));
    }

    #[test]
    fn test_wallets_keyed_by_asset() {
        let yaml = format!(
            "{}{}",
            MINIMAL,
            r#"
custody:
  base_url: https://custody.example.com
  timeout_ms: 2500
  wallets:
    BTC: { coin: tbtc, wallet_id: w-btc }
    USDT: { coin: tsol, wallet_id: w-usdt }
escrow:
  tolerance: "0.005"
"#
        );
        let config = AppConfig::from_yaml(&yaml).unwrap();
        assert!(!config.custody.is_mock());
        assert_eq!(config.custody.timeout(), Duration::from_millis(2500));
        assert_eq!(config.custody.wallets[&Asset::Btc].coin, "tbtc");
        assert_eq!(config.custody.wallets[&Asset::Usdt].wallet_id, "w-usdt");
        assert_eq!(config.escrow.tolerance, Decimal::new(5, 3));
        // untouched fields keep their defaults
        assert_eq!(config.escrow.reconcile_timeout_ms, 5_000);
    }

    #[test]
    fn test_rejects_out_of_range_tolerance() {
        let yaml = format!("{}escrow:\n  tolerance: \"1.5\"\n", MINIMAL);
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }
}
