use async_trait::async_trait;
use perps_core::DriftMarket;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;

use super::{build_http_client, ensure_success, DriftMarketProvider};
use crate::config::DriftConfig;
use crate::error::{ProviderError, ProviderResult};

// ============================================================================
// Drift Client - market data REST API
// ============================================================================

#[derive(Clone)]
pub struct DriftClient {
    client: Client,
    base_url: String,
    tracked: Vec<String>,
}

impl DriftClient {
    pub fn new(config: &DriftConfig) -> ProviderResult<Self> {
        tracing::debug!(
            base_url = %config.base_url,
            tracked = ?config.markets,
            "Creating Drift client"
        );
        Ok(Self {
            client: build_http_client(config.timeout_seconds)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tracked: config.markets.iter().map(|m| m.to_uppercase()).collect(),
        })
    }
}

#[async_trait]
impl DriftMarketProvider for DriftClient {
    async fn perp_markets(&self) -> ProviderResult<BTreeMap<String, DriftMarket>> {
        let start = Instant::now();
        let url = format!("{}/contracts", self.base_url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            tracing::error!(error = %e, "Drift contracts request failed");
            ProviderError::from(e)
        })?;
        let body = ensure_success(response).await?.text().await?;
        let mut markets = parse_contracts(&body)?;

        if !self.tracked.is_empty() {
            markets.retain(|symbol, _| self.tracked.contains(symbol));
        }

        tracing::info!(
            markets = %markets.len(),
            duration_ms = %start.elapsed().as_millis(),
            "Fetched Drift perp markets"
        );
        Ok(markets)
    }
}

// ============================================================================
// Drift API Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct Contract {
    ticker_id: String,
    #[serde(default)]
    product_type: Option<String>,
    last_price: Decimal,
    quote_volume: Decimal,
    open_interest: Decimal,
    funding_rate: Decimal,
    #[serde(default)]
    index_price: Option<Decimal>,
}

impl From<Contract> for DriftMarket {
    fn from(c: Contract) -> Self {
        DriftMarket {
            symbol: c.ticker_id.to_uppercase(),
            volume_24h: c.quote_volume,
            funding_rate: c.funding_rate,
            open_interest: c.open_interest,
            index_price: c.index_price.unwrap_or(c.last_price),
            last_price: c.last_price,
        }
    }
}

/// Parse the contracts listing. Each row is decoded on its own so one bad
/// market does not take the rest down with it; spot rows are ignored.
pub(crate) fn parse_contracts(body: &str) -> ProviderResult<BTreeMap<String, DriftMarket>> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ProviderError::Malformed(format!("Drift contracts: {}", e)))?;

    let rows = match value {
        Value::Array(rows) => rows,
        Value::Object(mut obj) => match obj.remove("contracts") {
            Some(Value::Array(rows)) => rows,
            _ => {
                return Err(ProviderError::Malformed(
                    "Drift contracts: expected a `contracts` array".to_string(),
                ))
            }
        },
        _ => {
            return Err(ProviderError::Malformed(
                "Drift contracts: unexpected payload".to_string(),
            ))
        }
    };

    let total = rows.len();
    let mut markets = BTreeMap::new();
    for row in rows {
        match serde_json::from_value::<Contract>(row) {
            Ok(contract) => {
                let is_perp = contract
                    .product_type
                    .as_deref()
                    .map(|t| t.eq_ignore_ascii_case("perp"))
                    .unwrap_or_else(|| contract.ticker_id.to_uppercase().ends_with("-PERP"));
                if is_perp {
                    let market = DriftMarket::from(contract);
                    markets.insert(market.symbol.clone(), market);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed Drift contract row");
            }
        }
    }

    if total > 0 && markets.is_empty() {
        return Err(ProviderError::Malformed(format!(
            "Drift contracts: none of {} rows parsed as perp markets",
            total
        )));
    }

    Ok(markets)
}
