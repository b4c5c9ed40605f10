//! Exchange-rate cache
//!
//! The cached value is an explicit object owned by the caller; there is no
//! process-wide instance. `RateService` owns one slot per asset and fills
//! it from a `RateSource`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::RatesConfig;
use crate::core_types::{Asset, Clock};

#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<T> {
    pub value: T,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl<T> CachedValue<T> {
    pub fn new(value: T, fetched_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            value,
            fetched_at,
            ttl,
        }
    }

    #[inline]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.fetched_at < self.ttl
    }
}

/// Serve `slot` while fresh, otherwise refill it from `fetch`.
///
/// A failed fetch falls back to the stale value when there is one; the
/// slot is left as it was so the next call tries again.
pub async fn cache_or_fetch<T, E, F, Fut>(
    slot: &mut Option<CachedValue<T>>,
    now: DateTime<Utc>,
    ttl: Duration,
    fetch: F,
) -> Result<T, E>
where
    T: Clone,
    E: std::fmt::Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if let Some(cached) = slot.as_ref().filter(|c| c.is_fresh(now)) {
        return Ok(cached.value.clone());
    }

    match fetch().await {
        Ok(value) => {
            *slot = Some(CachedValue::new(value.clone(), now, ttl));
            Ok(value)
        }
        Err(e) => match slot.as_ref() {
            Some(stale) => {
                warn!(error = %e, fetched_at = %stale.fetched_at, "Rate fetch failed, serving stale value");
                Ok(stale.value.clone())
            }
            None => Err(e),
        },
    }
}

// ============================================================================
// Rate sources
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateError {
    #[error("No rate available for {0}")]
    Unsupported(String),

    #[error("Rate feed unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed rate response: {0}")]
    Malformed(String),
}

impl RateError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            RateError::Unsupported(_) => "RATE_UNSUPPORTED",
            RateError::Unavailable(_) => "RATE_UNAVAILABLE",
            RateError::Malformed(_) => "RATE_MALFORMED",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            RateError::Unsupported(_) => 404,
            RateError::Unavailable(_) => 503,
            RateError::Malformed(_) => 502,
        }
    }
}

/// Fiat price of one whole unit of an asset
#[async_trait]
pub trait RateSource: Send + Sync + Debug {
    async fn fetch(&self, asset: Asset) -> Result<Decimal, RateError>;
}

/// Quotes straight from configuration
#[derive(Debug, Default)]
pub struct FixedRates {
    rates: HashMap<Asset, Decimal>,
}

impl FixedRates {
    pub fn new(rates: HashMap<Asset, Decimal>) -> Self {
        Self { rates }
    }
}

#[async_trait]
impl RateSource for FixedRates {
    async fn fetch(&self, asset: Asset) -> Result<Decimal, RateError> {
        self.rates
            .get(&asset)
            .copied()
            .ok_or_else(|| RateError::Unsupported(asset.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct QuoteBody {
    rate: Option<Decimal>,
}

/// `GET {url}?asset=BTC` answering `{"rate": "65000.12"}`
#[derive(Debug)]
pub struct HttpRateSource {
    client: reqwest::Client,
    url: String,
}

impl HttpRateSource {
    pub fn new(config: &RatesConfig) -> Result<Self, RateError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| RateError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: config.url.trim().to_string(),
        })
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn fetch(&self, asset: Asset) -> Result<Decimal, RateError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("asset", asset.to_string())])
            .send()
            .await
            .map_err(|e| RateError::Unavailable(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RateError::Unavailable(format!("HTTP {}", status)));
        }

        let body: QuoteBody = response
            .json()
            .await
            .map_err(|e| RateError::Malformed(e.to_string()))?;
        match body.rate {
            Some(rate) if rate > Decimal::ZERO => Ok(rate),
            Some(rate) => Err(RateError::Malformed(format!("non-positive rate {}", rate))),
            None => Err(RateError::Malformed("missing rate".into())),
        }
    }
}

// ============================================================================
// Service
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateQuote {
    pub asset: Asset,
    pub rate: Decimal,
    pub fetched_at: DateTime<Utc>,
}

/// Per-asset cached quotes.
///
/// Callers for the same asset queue behind one fetch instead of each
/// hitting the feed.
pub struct RateService {
    source: Arc<dyn RateSource>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    slots: Mutex<HashMap<Asset, Option<CachedValue<Decimal>>>>,
}

impl RateService {
    pub fn new(source: Arc<dyn RateSource>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            source,
            clock,
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Fixed quotes when no feed url is configured, the HTTP feed otherwise
    pub fn from_config(config: &RatesConfig, clock: Arc<dyn Clock>) -> Result<Self, RateError> {
        let source: Arc<dyn RateSource> = if config.is_fixed() {
            Arc::new(FixedRates::new(config.fixed.clone()))
        } else {
            Arc::new(HttpRateSource::new(config)?)
        };
        Ok(Self::new(source, clock, config.ttl()))
    }

    pub async fn quote(&self, asset: Asset) -> Result<RateQuote, RateError> {
        let now = self.clock.now();
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(asset).or_default();

        let rate = cache_or_fetch(slot, now, self.ttl, || self.source.fetch(asset)).await?;
        let fetched_at = slot.as_ref().map_or(now, |c| c.fetched_at);
        debug!(%asset, %rate, %fetched_at, "Rate served");
        Ok(RateQuote {
            asset,
            rate,
            fetched_at,
        })
    }
}
