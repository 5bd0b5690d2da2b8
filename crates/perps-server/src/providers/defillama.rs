use async_trait::async_trait;
use perps_core::{GlobalDerivativesEntry, Protocol};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Instant;

use super::{build_http_client, ensure_success, ProtocolVolume, VolumeProvider};
use crate::config::DefiLlamaConfig;
use crate::error::{ProviderError, ProviderResult};

// ============================================================================
// DeFiLlama Client - derivatives volume overview
// ============================================================================

#[derive(Clone)]
pub struct DefiLlamaClient {
    client: Client,
    base_url: String,
}

impl DefiLlamaClient {
    pub fn new(config: &DefiLlamaConfig) -> ProviderResult<Self> {
        tracing::debug!(base_url = %config.base_url, "Creating DeFiLlama client");
        Ok(Self {
            client: build_http_client(config.timeout_seconds)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_overview(&self) -> ProviderResult<Vec<LlamaProtocol>> {
        let start = Instant::now();
        let url = format!("{}/overview/derivatives", self.base_url);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "DeFiLlama request failed");
                ProviderError::from(e)
            })?;
        let body = ensure_success(response).await?.text().await?;
        let protocols = parse_overview(&body)?;

        tracing::info!(
            count = %protocols.len(),
            duration_ms = %start.elapsed().as_millis(),
            "Fetched DeFiLlama derivatives overview"
        );
        Ok(protocols)
    }
}

#[async_trait]
impl VolumeProvider for DefiLlamaClient {
    async fn protocol_volumes(&self) -> ProviderResult<BTreeMap<Protocol, ProtocolVolume>> {
        let overview = self.fetch_overview().await?;
        Ok(tracked_volumes(&overview))
    }

    async fn global_derivatives(&self, limit: usize) -> ProviderResult<Vec<GlobalDerivativesEntry>> {
        let overview = self.fetch_overview().await?;
        Ok(top_venues(&overview, limit))
    }
}

// ============================================================================
// DeFiLlama API Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct OverviewResponse {
    protocols: Vec<LlamaProtocol>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LlamaProtocol {
    name: String,
    #[serde(default)]
    chains: Vec<String>,
    #[serde(default)]
    total24h: Option<Decimal>,
    #[serde(default)]
    total7d: Option<Decimal>,
    #[serde(default, rename = "change_1d")]
    change_1d: Option<Decimal>,
    #[serde(default, rename = "change_7d")]
    change_7d: Option<Decimal>,
}

pub(crate) fn parse_overview(body: &str) -> ProviderResult<Vec<LlamaProtocol>> {
    let response: OverviewResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::Malformed(format!("DeFiLlama overview: {}", e)))?;
    Ok(ranked(response.protocols))
}

/// Sort by 24h volume, largest first. Venues without a reported 24h volume
/// go last; ties keep upstream order.
fn ranked(mut protocols: Vec<LlamaProtocol>) -> Vec<LlamaProtocol> {
    protocols.sort_by(|a, b| b.total24h.cmp(&a.total24h));
    protocols
}

fn tracked_volumes(ranked: &[LlamaProtocol]) -> BTreeMap<Protocol, ProtocolVolume> {
    ranked
        .iter()
        .enumerate()
        .filter_map(|(idx, entry)| {
            let protocol = Protocol::from_defillama_name(&entry.name)?;
            if entry.total24h.is_none() {
                tracing::debug!(protocol = %protocol, "DeFiLlama lists protocol without 24h volume");
            }
            Some((
                protocol,
                ProtocolVolume {
                    volume_24h: entry.total24h,
                    volume_7d: entry.total7d,
                    change_1d: entry.change_1d,
                    change_7d: entry.change_7d,
                    rank: entry.total24h.map(|_| idx as u32 + 1),
                },
            ))
        })
        .collect()
}

fn top_venues(ranked: &[LlamaProtocol], limit: usize) -> Vec<GlobalDerivativesEntry> {
    ranked
        .iter()
        .take(limit)
        .enumerate()
        .map(|(idx, entry)| GlobalDerivativesEntry {
            rank: idx as u32 + 1,
            name: entry.name.clone(),
            volume_24h: entry.total24h,
            volume_7d: entry.total7d,
            change_1d: entry.change_1d,
            chains: entry.chains.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const OVERVIEW: &str = r#"{
        "totalDataChart": [],
        "protocols": [
            {"name": "Drift Trade", "chains": ["Solana"], "total24h": 350000000, "total7d": 2100000000, "change_1d": 4.5, "change_7d": -10.25},
            {"name": "Hyperliquid", "chains": ["Hyperliquid L1"], "total24h": 9000000000, "total7d": 60000000000, "change_1d": 1.1, "change_7d": 2.2},
            {"name": "Jupiter Perpetual Exchange", "chains": ["Solana"], "total24h": 800000000.5, "total7d": null, "change_1d": null},
            {"name": "Adrena Protocol", "chains": ["Solana"], "total24h": null, "total7d": 1000}
        ]
    }"#;

    #[test]
    fn test_tracked_volumes_rank_against_all_venues() {
        let overview = parse_overview(OVERVIEW).unwrap();
        let volumes = tracked_volumes(&overview);

        let jupiter = &volumes[&Protocol::JupiterPerps];
        assert_eq!(jupiter.rank, Some(2));
        assert_eq!(jupiter.volume_24h, Some(dec!(800000000.5)));
        assert_eq!(jupiter.volume_7d, None);
        assert_eq!(jupiter.change_1d, None);

        let drift = &volumes[&Protocol::Drift];
        assert_eq!(drift.rank, Some(3));
        assert_eq!(drift.change_7d, Some(dec!(-10.25)));
        assert!(!volumes.contains_key(&Protocol::FlashTrade));
    }

    #[test]
    fn test_null_volume_is_absent_not_zero() {
        let overview = parse_overview(OVERVIEW).unwrap();
        let adrena = &tracked_volumes(&overview)[&Protocol::Adrena];
        assert_eq!(adrena.volume_24h, None);
        assert_eq!(adrena.volume_7d, Some(dec!(1000)));
        assert_eq!(adrena.rank, None);

        // Null venues sort after every reported one
        let top = top_venues(&overview, 10);
        assert_eq!(top.last().map(|v| v.name.as_str()), Some("Adrena Protocol"));
        assert_eq!(top.last().and_then(|v| v.volume_24h), None);
        assert_eq!(top[1].volume_7d, None);
    }

    #[test]
    fn test_top_venues_truncates_and_ranks() {
        let overview = parse_overview(OVERVIEW).unwrap();
        let top = top_venues(&overview, 2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].name, "Hyperliquid");
        assert_eq!(top[0].rank, 1);
        assert!(!top[0].is_solana());
        assert!(top[1].is_solana());
    }

    #[test]
    fn test_shape_drift_is_malformed() {
        let err = parse_overview(r#"{"data": []}"#).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }
}
