//! Custody provider seam
//!
//! The provider is opaque: it allocates deposit addresses and moves funds
//! on request. `HttpCustodyClient` talks to a BitGo-style REST API;
//! `MockCustody` is the in-process stand-in used when no provider is
//! configured and by tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::error::CustodyError;
use crate::config::{CustodyConfig, WalletConfig};
use crate::core_types::Asset;
use crate::money;

/// Allocation request
#[derive(Debug, Clone, PartialEq)]
pub struct AllocateRequest {
    pub trade_id: String,
    pub asset: Asset,
    pub expected_amount: Option<Decimal>,
}

/// Release request, amount in whole units
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseRequest {
    pub trade_id: String,
    pub asset: Asset,
    pub to_address: String,
    pub amount: Decimal,
}

#[async_trait]
pub trait CustodyClient: Send + Sync + Debug {
    /// Allocate a fresh deposit address
    async fn allocate(&self, req: &AllocateRequest) -> Result<String, CustodyError>;

    /// Send escrowed funds, returns the provider txid
    async fn release(&self, req: &ReleaseRequest) -> Result<String, CustodyError>;
}

// ============================================================================
// HTTP client
// ============================================================================

#[derive(Debug, Serialize)]
struct AddressRequestBody<'a> {
    label: &'a str,
}

#[derive(Debug, Deserialize)]
struct AddressResponseBody {
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendCoinsBody<'a> {
    address: &'a str,
    /// Base units, as a string so 18-decimal amounts survive
    amount: String,
    comment: String,
}

#[derive(Debug, Deserialize)]
struct SendCoinsResponseBody {
    #[serde(default)]
    txid: Option<String>,
}

/// REST custody client
///
/// - allocate: `POST {base}/api/v2/{coin}/wallet/{wallet}/address`
/// - release:  `POST {base}/api/v2/{coin}/wallet/{wallet}/sendcoins`
#[derive(Debug)]
pub struct HttpCustodyClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
    wallets: HashMap<Asset, WalletConfig>,
}

impl HttpCustodyClient {
    pub fn new(config: &CustodyConfig) -> Result<Self, CustodyError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| CustodyError::Unreachable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            wallets: config.wallets.clone(),
        })
    }

    fn wallet(&self, asset: Asset) -> Result<&WalletConfig, CustodyError> {
        self.wallets
            .get(&asset)
            .ok_or_else(|| CustodyError::UnsupportedAsset(asset.to_string()))
    }

    fn wallet_url(&self, wallet: &WalletConfig, action: &str) -> String {
        format!(
            "{}/api/v2/{}/wallet/{}/{}",
            self.base_url, wallet.coin, wallet.wallet_id, action
        )
    }

    async fn post_json<B, R>(&self, url: &str, body: &B) -> Result<R, CustodyError>
    where
        B: Serialize + ?Sized,
        R: for<'de> Deserialize<'de>,
    {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await
            .map_err(|e| CustodyError::Unreachable(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CustodyError::Rejected(format!("HTTP {}: {}", status, text)));
        }

        response
            .json()
            .await
            .map_err(|e| CustodyError::Malformed(format!("Failed to parse response: {}", e)))
    }
}

/// `escrow-{ASSET}-{trade_id}-{unix_ms}`
pub fn address_label(trade_id: &str, asset: Asset) -> String {
    format!(
        "escrow-{}-{}-{}",
        asset,
        trade_id,
        chrono::Utc::now().timestamp_millis()
    )
}

#[async_trait]
impl CustodyClient for HttpCustodyClient {
    async fn allocate(&self, req: &AllocateRequest) -> Result<String, CustodyError> {
        let wallet = self.wallet(req.asset)?;
        let label = address_label(&req.trade_id, req.asset);
        let url = self.wallet_url(wallet, "address");

        debug!(trade_id = %req.trade_id, asset = %req.asset, %label, "Requesting deposit address");
        let body: AddressResponseBody = self.post_json(&url, &AddressRequestBody { label: &label }).await?;

        body.address
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .ok_or_else(|| CustodyError::Malformed("response has no address".into()))
    }

    async fn release(&self, req: &ReleaseRequest) -> Result<String, CustodyError> {
        let wallet = self.wallet(req.asset)?;
        let base_units = money::to_base_units(req.amount, req.asset.decimals())
            .map_err(|e| CustodyError::Rejected(e.to_string()))?;
        let url = self.wallet_url(wallet, "sendcoins");

        let body = SendCoinsBody {
            address: &req.to_address,
            amount: base_units.to_string(),
            comment: format!("escrow release {}", req.trade_id),
        };
        let resp: SendCoinsResponseBody = self.post_json(&url, &body).await?;

        resp.txid
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| CustodyError::Malformed("response has no txid".into()))
    }
}

// ============================================================================
// Mock provider
// ============================================================================

/// Scripted behaviour of `MockCustody`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    Healthy,
    Fail(CustodyError),
    /// Succeeds with a blank address
    EmptyAddress,
    /// Never answers within any reasonable timeout
    Hang,
}

/// In-process custody provider
#[derive(Debug)]
pub struct MockCustody {
    behavior: Mutex<MockBehavior>,
    allocations: AtomicU64,
    releases: AtomicU64,
}

impl Default for MockCustody {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCustody {
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(MockBehavior::Healthy),
            allocations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        if let Ok(mut b) = self.behavior.lock() {
            *b = behavior;
        }
    }

    /// Number of allocate calls that reached the provider
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    fn behavior(&self) -> MockBehavior {
        match self.behavior.lock() {
            Ok(b) => b.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn scripted(&self) -> Result<(), CustodyError> {
        match self.behavior() {
            MockBehavior::Healthy | MockBehavior::EmptyAddress => Ok(()),
            MockBehavior::Fail(e) => Err(e),
            MockBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(CustodyError::Unreachable("hung".into()))
            }
        }
    }
}

#[async_trait]
impl CustodyClient for MockCustody {
    async fn allocate(&self, req: &AllocateRequest) -> Result<String, CustodyError> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.scripted().await?;
        if self.behavior() == MockBehavior::EmptyAddress {
            return Ok(String::new());
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let address = match req.asset {
            Asset::Btc => format!("tb1q{}", &id[..30]),
            Asset::Eth => format!("0x{}{}", &id, &id[..8]),
            Asset::Usdt => id,
        };
        Ok(address)
    }

    async fn release(&self, req: &ReleaseRequest) -> Result<String, CustodyError> {
        money::to_base_units(req.amount, req.asset.decimals())
            .map_err(|e| CustodyError::Rejected(e.to_string()))?;
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.scripted().await?;
        Ok(format!("{:x}", uuid::Uuid::new_v4().simple()))
    }
}
