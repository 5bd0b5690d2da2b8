use chrono::{DateTime, Utc};
use perps_core::{
    CacheDocument, DataCategory, DriftMarket, GlobalDerivativesEntry, JupiterMarket,
    LiquidationSummary, Metric, PnlLeaderboard, Protocol, ProtocolSnapshot, TimeWindow,
    WalletOverlap,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::history::HistorySnapshot;
use crate::providers::dune::Row;

pub const DEFAULT_MARKET_LIMIT: usize = 15;
pub const DEFAULT_HISTORY_HOURS: u32 = 24;

/// Percent of `part` in `total`, two decimals. `None` when total is zero.
fn share_pct(part: Decimal, total: Decimal) -> Option<Decimal> {
    if total.is_zero() {
        None
    } else {
        Some((part / total * Decimal::ONE_HUNDRED).round_dp(2))
    }
}

/// `SOL` matches `SOL`, `SOL-PERP` and `sol-perp`.
fn matches_asset(symbol: &str, asset: &str) -> bool {
    let symbol = symbol.to_uppercase();
    let asset = asset.trim().to_uppercase();
    symbol == asset || symbol.strip_suffix("-PERP") == Some(asset.as_str())
}

// ============================================================================
// GET /health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub cache: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_seconds: Option<i64>,
}

// ============================================================================
// GET /api/v1/protocols
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ProtocolRow {
    #[serde(flatten)]
    pub snapshot: ProtocolSnapshot,
    /// Share of the summed available 24h volume, in percent
    pub volume_share_pct: Option<Decimal>,
}

/// Sums over available values only; `complete` is false if any were skipped.
#[derive(Debug, Serialize, PartialEq)]
pub struct ProtocolTotals {
    pub volume_24h: Decimal,
    pub traders_24h: u64,
    pub fees_24h: Decimal,
    pub transactions_24h: u64,
    pub complete: bool,
}

#[derive(Debug, Serialize)]
pub struct ProtocolsResponse {
    pub generated_at: DateTime<Utc>,
    pub protocols: Vec<ProtocolRow>,
    pub totals: ProtocolTotals,
}

impl ProtocolsResponse {
    pub fn from_document(doc: &CacheDocument) -> Self {
        let mut complete = true;
        let mut sum_decimal = |m: &Metric<Decimal>| -> Decimal {
            match m.value() {
                Some(v) => *v,
                None => {
                    complete = false;
                    Decimal::ZERO
                }
            }
        };
        let volume_24h: Decimal = doc.protocols.iter().map(|p| sum_decimal(&p.volume_24h)).sum();
        let fees_24h: Decimal = doc.protocols.iter().map(|p| sum_decimal(&p.fees_24h)).sum();

        let traders_24h: u64 = doc.protocols.iter().filter_map(|p| p.traders_24h.value()).sum();
        let transactions_24h: u64 = doc
            .protocols
            .iter()
            .filter_map(|p| p.transactions_24h.value())
            .sum();
        complete = complete
            && doc.protocols.iter().all(|p| p.traders_24h.is_available())
            && doc.protocols.iter().all(|p| {
                p.transactions_24h.is_available()
                    || !p.protocol.supports(DataCategory::Ledger)
            });

        let mut protocols: Vec<ProtocolRow> = doc
            .protocols
            .iter()
            .map(|snapshot| ProtocolRow {
                volume_share_pct: snapshot
                    .volume_24h
                    .value()
                    .and_then(|v| share_pct(*v, volume_24h)),
                snapshot: snapshot.clone(),
            })
            .collect();
        // Largest first, rows without volume last
        protocols.sort_by(|a, b| {
            b.snapshot
                .volume_24h
                .value()
                .cmp(&a.snapshot.volume_24h.value())
        });

        Self {
            generated_at: doc.generated_at,
            protocols,
            totals: ProtocolTotals {
                volume_24h,
                traders_24h,
                fees_24h,
                transactions_24h,
                complete,
            },
        }
    }
}

// ============================================================================
// GET /api/v1/windows/{window}
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub protocol: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WindowResponse {
    pub window: TimeWindow,
    pub generated_at: DateTime<Utc>,
    pub traders: BTreeMap<Protocol, Metric<u64>>,
    pub liquidations: Metric<LiquidationSummary>,
    pub wallet_overlap: Metric<WalletOverlap>,
}

// ============================================================================
// GET /api/v1/markets/drift
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DriftMarketsQuery {
    pub asset: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DriftMarketRow {
    #[serde(flatten)]
    pub market: DriftMarket,
    pub open_interest_usd: Decimal,
    pub volume_share_pct: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct DriftMarketsResponse {
    pub generated_at: DateTime<Utc>,
    pub markets: Metric<Vec<DriftMarketRow>>,
    pub total_open_interest: Metric<Decimal>,
}

impl DriftMarketsResponse {
    pub fn from_document(doc: &CacheDocument, query: &DriftMarketsQuery) -> Self {
        let limit = query.limit.unwrap_or(DEFAULT_MARKET_LIMIT);
        let markets = doc.drift_markets.as_ref().map(|markets| {
            let total_volume: Decimal = markets.values().map(|m| m.volume_24h).sum();
            let mut rows: Vec<DriftMarketRow> = markets
                .values()
                .filter(|m| {
                    query
                        .asset
                        .as_deref()
                        .map_or(true, |asset| matches_asset(&m.symbol, asset))
                })
                .map(|m| DriftMarketRow {
                    open_interest_usd: m.open_interest_usd(),
                    volume_share_pct: share_pct(m.volume_24h, total_volume),
                    market: m.clone(),
                })
                .collect();
            rows.sort_by(|a, b| b.market.volume_24h.cmp(&a.market.volume_24h));
            rows.truncate(limit);
            rows
        });

        Self {
            generated_at: doc.generated_at,
            markets,
            total_open_interest: doc.total_open_interest.clone(),
        }
    }
}

// ============================================================================
// GET /api/v1/markets/jupiter
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct JupiterMarketsQuery {
    pub asset: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JupiterMarketsResponse {
    pub generated_at: DateTime<Utc>,
    pub markets: Metric<Vec<JupiterMarket>>,
}

impl JupiterMarketsResponse {
    pub fn from_document(doc: &CacheDocument, query: &JupiterMarketsQuery) -> Self {
        let markets = doc.jupiter_markets.as_ref().map(|markets| {
            let mut rows: Vec<JupiterMarket> = markets
                .values()
                .filter(|m| {
                    query
                        .asset
                        .as_deref()
                        .map_or(true, |asset| matches_asset(&m.symbol, asset))
                })
                .cloned()
                .collect();
            rows.sort_by(|a, b| b.trades.cmp(&a.trades).then_with(|| a.symbol.cmp(&b.symbol)));
            rows
        });
        Self {
            generated_at: doc.generated_at,
            markets,
        }
    }
}

// ============================================================================
// GET /api/v1/global
// ============================================================================

#[derive(Debug, Serialize)]
pub struct GlobalVenueRow {
    #[serde(flatten)]
    pub entry: GlobalDerivativesEntry,
    pub is_solana: bool,
    /// Set when the venue is one of the tracked Solana protocols
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracked: Option<Protocol>,
}

#[derive(Debug, Serialize)]
pub struct GlobalResponse {
    pub generated_at: DateTime<Utc>,
    pub venues: Metric<Vec<GlobalVenueRow>>,
    /// Solana venues' share of the listed volume, in percent. Venues
    /// without a reported 24h volume are left out of both sums.
    pub solana_share_pct: Option<Decimal>,
}

impl GlobalResponse {
    pub fn from_document(doc: &CacheDocument) -> Self {
        let solana_share_pct = doc.global_derivatives.value().and_then(|list| {
            let total: Decimal = list.iter().filter_map(|e| e.volume_24h).sum();
            let solana: Decimal = list
                .iter()
                .filter(|e| e.is_solana())
                .filter_map(|e| e.volume_24h)
                .sum();
            share_pct(solana, total)
        });
        let venues = doc.global_derivatives.as_ref().map(|list| {
            list.iter()
                .map(|entry| GlobalVenueRow {
                    is_solana: entry.is_solana(),
                    tracked: Protocol::from_defillama_name(&entry.name),
                    entry: entry.clone(),
                })
                .collect()
        });
        Self {
            generated_at: doc.generated_at,
            venues,
            solana_share_pct,
        }
    }
}

// ============================================================================
// GET /api/v1/leaderboard/jupiter
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardResponse {
    pub generated_at: DateTime<Utc>,
    pub leaderboard: Metric<PnlLeaderboard>,
}

impl LeaderboardResponse {
    pub fn from_document(doc: &CacheDocument, query: &LeaderboardQuery) -> Self {
        let leaderboard = doc.pnl_leaderboard.clone().map(|mut board| {
            if let Some(limit) = query.limit {
                board.top_winners.truncate(limit);
                board.top_losers.truncate(limit);
            }
            board
        });
        Self {
            generated_at: doc.generated_at,
            leaderboard,
        }
    }
}

// ============================================================================
// GET /api/v1/history
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub hours: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub hours: u32,
    pub points: Vec<HistorySnapshot>,
}

// ============================================================================
// GET /api/v1/debug/query/{query_id}
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DebugQueryParams {
    pub hours: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct DebugQueryResponse {
    pub query_id: u64,
    pub hours: u32,
    pub row_count: usize,
    pub duration_ms: u64,
    pub rows: Vec<Row>,
}
