//! Market-price cache with bounded staleness
//!
//! Prices come from a single CoinGecko-compatible upstream. Entries are
//! refreshed lazily once they exceed the TTL; a stale entry keeps serving
//! callers whenever the upstream is down, and hard-coded fallbacks cover the
//! cold-start case. Concurrent callers for stale keys share one upstream
//! request.

use crate::config::OracleConfig;
use crate::errors::OracleError;
use crate::types::Asset;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A single upstream quote
#[derive(Debug, Clone, Copy)]
pub struct PriceQuote {
    pub price: f64,
    /// Upstream-reported update time (unix seconds), when provided
    pub upstream_timestamp: Option<i64>,
}

/// Upstream price feed seam
///
/// The production implementation talks HTTP; tests substitute a scripted
/// source.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch(&self, assets: &[Asset]) -> Result<HashMap<Asset, PriceQuote>, OracleError>;
}

/// CoinGecko-compatible HTTP price source
pub struct HttpPriceSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPriceSource {
    pub fn new(base_url: String, fetch_timeout: Duration) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| OracleError::UpstreamFailed(e.to_string()))?;

        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn fetch(&self, assets: &[Asset]) -> Result<HashMap<Asset, PriceQuote>, OracleError> {
        let ids = assets
            .iter()
            .map(|a| a.upstream_id())
            .collect::<Vec<_>>()
            .join(",");

        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=usd&include_last_updated_at=true",
            self.base_url, ids
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OracleError::UpstreamFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OracleError::UpstreamFailed(format!(
                "Upstream returned {}",
                response.status()
            )));
        }

        let body: HashMap<String, HashMap<String, f64>> = response
            .json()
            .await
            .map_err(|e| OracleError::MalformedResponse(e.to_string()))?;

        let mut quotes = HashMap::new();
        for asset in assets {
            let entry = body.get(asset.upstream_id()).ok_or_else(|| {
                OracleError::MalformedResponse(format!("Missing {} in response", asset.upstream_id()))
            })?;
            let price = entry.get("usd").copied().ok_or_else(|| {
                OracleError::MalformedResponse(format!("Missing usd quote for {}", asset))
            })?;
            let upstream_timestamp = entry.get("last_updated_at").map(|t| *t as i64);

            quotes.insert(*asset, PriceQuote { price, upstream_timestamp });
        }

        Ok(quotes)
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    price: f64,
    fetched_at: Instant,
    upstream_timestamp: Option<i64>,
}

/// TTL-bounded price cache over a [`PriceSource`]
pub struct PriceOracle {
    source: Arc<dyn PriceSource>,
    ttl: Duration,
    cache: DashMap<Asset, CacheEntry>,
    /// Single-flight guard: the holder performs the upstream fetch for every
    /// stale key; queued callers find a fresh cache on re-check.
    fetch_lock: Mutex<()>,
}

impl PriceOracle {
    pub fn new(source: Arc<dyn PriceSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: DashMap::new(),
            fetch_lock: Mutex::new(()),
        }
    }

    /// Build the production oracle from configuration
    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        let source = HttpPriceSource::new(config.upstream_url.clone(), config.fetch_timeout())?;
        Ok(Self::new(Arc::new(source), config.cache_ttl()))
    }

    /// Current fiat price for one asset
    pub async fn price(&self, asset: Asset) -> f64 {
        self.prices(&[asset]).await[&asset]
    }

    /// Current fiat prices for a set of assets.
    ///
    /// At most one upstream request per invocation, covering every asset
    /// whose cache entry is missing or older than the TTL.
    pub async fn prices(&self, assets: &[Asset]) -> HashMap<Asset, f64> {
        if !self.stale_assets(assets).is_empty() {
            let _guard = self.fetch_lock.lock().await;

            // Another caller may have refreshed while we queued.
            let stale = self.stale_assets(assets);
            if !stale.is_empty() {
                self.refresh(&stale).await;
            }
        }

        assets
            .iter()
            .map(|asset| (*asset, self.resolve(*asset)))
            .collect()
    }

    fn stale_assets(&self, assets: &[Asset]) -> Vec<Asset> {
        assets
            .iter()
            .copied()
            .filter(|asset| {
                self.cache
                    .get(asset)
                    .map(|entry| entry.fetched_at.elapsed() >= self.ttl)
                    .unwrap_or(true)
            })
            .collect()
    }

    async fn refresh(&self, stale: &[Asset]) {
        match self.source.fetch(stale).await {
            Ok(quotes) => {
                let now = Instant::now();
                for (asset, quote) in quotes {
                    self.cache.insert(
                        asset,
                        CacheEntry {
                            price: quote.price,
                            fetched_at: now,
                            upstream_timestamp: quote.upstream_timestamp,
                        },
                    );
                }
                debug!("Refreshed {} price entries", stale.len());
            }
            Err(e) => {
                // Stale entries keep serving; cold assets fall back below.
                warn!("Price upstream unavailable, serving cached values: {}", e);
            }
        }
    }

    fn resolve(&self, asset: Asset) -> f64 {
        match self.cache.get(&asset) {
            Some(entry) => entry.price,
            None => asset.fallback_price(),
        }
    }

    /// Upstream-reported timestamp of the cached entry, if any
    pub fn upstream_timestamp(&self, asset: Asset) -> Option<i64> {
        self.cache.get(&asset).and_then(|entry| entry.upstream_timestamp)
    }
}
