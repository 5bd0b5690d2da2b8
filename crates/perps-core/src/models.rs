//! Snapshot document written by the refresh job and read by the dashboard.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::metric::{Metric, UnavailableReason};
use crate::protocol::{DataCategory, Protocol};
use crate::window::TimeWindow;

// =============================================================================
// Per-window metrics
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationSummary {
    /// Liquidation events
    pub count: u64,
    /// Transactions carrying at least one liquidation
    pub txns: u64,
    /// Number of hourly history samples summed, when not queried directly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_from: Option<u32>,
}

/// Wallets seen trading on Drift and/or Jupiter Perps within a window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletOverlap {
    pub multi_platform: u64,
    pub drift_only: u64,
    pub jupiter_only: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindowMetrics {
    pub traders: BTreeMap<Protocol, Metric<u64>>,
    pub liquidations: Metric<LiquidationSummary>,
    pub wallet_overlap: Metric<WalletOverlap>,
}

impl TimeWindowMetrics {
    /// Every field marked with the same reason, used when a whole window is lost.
    pub fn unavailable(reason: UnavailableReason) -> Self {
        Self {
            traders: Protocol::ALL
                .into_iter()
                .map(|p| (p, Metric::unavailable(reason)))
                .collect(),
            liquidations: Metric::unavailable(reason),
            wallet_overlap: Metric::unavailable(reason),
        }
    }

    pub fn traders_for(&self, protocol: Protocol) -> Metric<u64> {
        self.traders
            .get(&protocol)
            .cloned()
            .unwrap_or_else(|| Metric::unavailable(UnavailableReason::NotSupported))
    }
}

// =============================================================================
// Protocols and markets
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSnapshot {
    pub protocol: Protocol,
    pub name: String,
    pub volume_24h: Metric<Decimal>,
    pub volume_7d: Metric<Decimal>,
    /// Percent change of 24h volume vs the previous day
    pub change_1d: Metric<Decimal>,
    pub change_7d: Metric<Decimal>,
    /// Estimated as volume_24h * fee rate
    pub fees_24h: Metric<Decimal>,
    pub traders_24h: Metric<u64>,
    /// Successful program signatures over the last 24h
    pub transactions_24h: Metric<u64>,
    /// Set when signature paging stopped at its page cap before the 24h
    /// cutoff, so `transactions_24h` is a lower bound
    #[serde(default)]
    pub transactions_24h_truncated: bool,
    /// 1-based rank by 24h volume among all derivatives venues
    pub global_rank: Metric<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftMarket {
    pub symbol: String,
    /// 24h volume in quote (USD)
    pub volume_24h: Decimal,
    pub funding_rate: Decimal,
    /// Open interest in base units
    pub open_interest: Decimal,
    pub last_price: Decimal,
    pub index_price: Decimal,
}

impl DriftMarket {
    pub fn open_interest_usd(&self) -> Decimal {
        self.open_interest * self.last_price
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JupiterMarket {
    pub symbol: String,
    /// Trades in the sampled window
    pub trades: u64,
    /// Fraction of all sampled Jupiter trades, 0..=1
    pub trade_share: Decimal,
    /// Jupiter 24h volume distributed by trade share
    pub estimated_volume_24h: Metric<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalDerivativesEntry {
    pub rank: u32,
    pub name: String,
    /// `None` when the venue reports no figure; such venues rank last
    pub volume_24h: Option<Decimal>,
    pub volume_7d: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_1d: Option<Decimal>,
    pub chains: Vec<String>,
}

impl GlobalDerivativesEntry {
    pub fn is_solana(&self) -> bool {
        self.chains.iter().any(|c| c == "Solana")
    }
}

/// One wallet's realized P&L over the leaderboard window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlEntry {
    pub trader: String,
    pub pnl_usd: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trades: Option<u64>,
}

/// Jupiter Perps realized P&L extremes: winners largest first, losers most
/// negative first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlLeaderboard {
    pub top_winners: Vec<PnlEntry>,
    pub top_losers: Vec<PnlEntry>,
}

// =============================================================================
// Root document
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDocument {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub time_windows: BTreeMap<TimeWindow, TimeWindowMetrics>,
    pub protocols: Vec<ProtocolSnapshot>,
    pub drift_markets: Metric<BTreeMap<String, DriftMarket>>,
    pub jupiter_markets: Metric<BTreeMap<String, JupiterMarket>>,
    pub global_derivatives: Metric<Vec<GlobalDerivativesEntry>>,
    /// Sum of open_interest * last_price over Drift markets
    pub total_open_interest: Metric<Decimal>,
    /// Absent in artifacts written before the leaderboard existed
    #[serde(default = "leaderboard_not_recorded")]
    pub pnl_leaderboard: Metric<PnlLeaderboard>,
}

fn leaderboard_not_recorded() -> Metric<PnlLeaderboard> {
    Metric::unavailable_with(UnavailableReason::NotSupported, "not recorded in this artifact")
}

impl CacheDocument {
    pub const SCHEMA_VERSION: u32 = 1;

    pub fn window(&self, window: TimeWindow) -> Option<&TimeWindowMetrics> {
        self.time_windows.get(&window)
    }

    pub fn protocol(&self, protocol: Protocol) -> Option<&ProtocolSnapshot> {
        self.protocols.iter().find(|p| p.protocol == protocol)
    }

    /// Dotted paths of every field carrying an unavailable marker.
    ///
    /// Fields a protocol can never provide (capability absent) are included,
    /// since they are unavailable in the artifact too.
    pub fn unavailable_fields(&self) -> Vec<String> {
        let mut out = Vec::new();

        for (window, metrics) in &self.time_windows {
            for (protocol, traders) in &metrics.traders {
                push_if_missing(&mut out, traders, || {
                    format!("time_windows.{}.traders.{}", window, protocol)
                });
            }
            push_if_missing(&mut out, &metrics.liquidations, || {
                format!("time_windows.{}.liquidations", window)
            });
            push_if_missing(&mut out, &metrics.wallet_overlap, || {
                format!("time_windows.{}.wallet_overlap", window)
            });
        }

        for snapshot in &self.protocols {
            let p = snapshot.protocol;
            push_if_missing(&mut out, &snapshot.volume_24h, || format!("protocols.{}.volume_24h", p));
            push_if_missing(&mut out, &snapshot.volume_7d, || format!("protocols.{}.volume_7d", p));
            push_if_missing(&mut out, &snapshot.change_1d, || format!("protocols.{}.change_1d", p));
            push_if_missing(&mut out, &snapshot.change_7d, || format!("protocols.{}.change_7d", p));
            push_if_missing(&mut out, &snapshot.fees_24h, || format!("protocols.{}.fees_24h", p));
            push_if_missing(&mut out, &snapshot.traders_24h, || format!("protocols.{}.traders_24h", p));
            push_if_missing(&mut out, &snapshot.transactions_24h, || {
                format!("protocols.{}.transactions_24h", p)
            });
            push_if_missing(&mut out, &snapshot.global_rank, || format!("protocols.{}.global_rank", p));
        }

        push_if_missing(&mut out, &self.drift_markets, || "drift_markets".to_string());
        if let Some(markets) = self.jupiter_markets.value() {
            for (symbol, market) in markets {
                push_if_missing(&mut out, &market.estimated_volume_24h, || {
                    format!("jupiter_markets.{}.estimated_volume_24h", symbol)
                });
            }
        } else {
            out.push("jupiter_markets".to_string());
        }
        push_if_missing(&mut out, &self.global_derivatives, || "global_derivatives".to_string());
        push_if_missing(&mut out, &self.total_open_interest, || "total_open_interest".to_string());
        push_if_missing(&mut out, &self.pnl_leaderboard, || "pnl_leaderboard".to_string());

        out
    }

    /// Unavailable fields excluding the ones the capability table rules out.
    pub fn unexpected_unavailable_fields(&self) -> Vec<String> {
        let mut out = self.unavailable_fields();
        out.retain(|path| {
            !self.protocols.iter().any(|s| {
                !s.protocol.supports(DataCategory::Ledger)
                    && path == &format!("protocols.{}.transactions_24h", s.protocol)
            })
        });
        out
    }
}

fn push_if_missing<T>(out: &mut Vec<String>, metric: &Metric<T>, path: impl FnOnce() -> String) {
    if !metric.is_available() {
        out.push(path());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(protocol: Protocol) -> ProtocolSnapshot {
        let ledger = if protocol.supports(DataCategory::Ledger) {
            Metric::available(1200)
        } else {
            Metric::unavailable(UnavailableReason::NotSupported)
        };
        ProtocolSnapshot {
            protocol,
            name: protocol.display_name().to_string(),
            volume_24h: Metric::available(dec!(1000000)),
            volume_7d: Metric::available(dec!(7000000)),
            change_1d: Metric::available(dec!(1.5)),
            change_7d: Metric::available(dec!(-3.2)),
            fees_24h: Metric::available(dec!(500)),
            traders_24h: Metric::available(300),
            transactions_24h: ledger,
            transactions_24h_truncated: false,
            global_rank: Metric::available(4),
        }
    }

    fn document() -> CacheDocument {
        CacheDocument {
            schema_version: CacheDocument::SCHEMA_VERSION,
            generated_at: Utc::now(),
            time_windows: BTreeMap::new(),
            protocols: Protocol::ALL.into_iter().map(snapshot).collect(),
            drift_markets: Metric::available(BTreeMap::new()),
            jupiter_markets: Metric::available(BTreeMap::new()),
            global_derivatives: Metric::available(vec![]),
            total_open_interest: Metric::available(Decimal::ZERO),
            pnl_leaderboard: Metric::available(PnlLeaderboard::default()),
        }
    }

    #[test]
    fn test_capability_gaps_are_listed_but_not_unexpected() {
        let doc = document();
        let all = doc.unavailable_fields();
        assert!(all.contains(&"protocols.flashtrade.transactions_24h".to_string()));
        assert!(all.contains(&"protocols.adrena.transactions_24h".to_string()));
        assert!(doc.unexpected_unavailable_fields().is_empty());
    }

    #[test]
    fn test_lost_window_marks_every_field() {
        let metrics = TimeWindowMetrics::unavailable(UnavailableReason::Timeout);
        assert_eq!(metrics.traders.len(), Protocol::ALL.len());
        assert!(metrics.traders.values().all(|m| m.reason() == Some(UnavailableReason::Timeout)));
        assert_eq!(metrics.liquidations.reason(), Some(UnavailableReason::Timeout));
    }

    #[test]
    fn test_artifact_without_leaderboard_still_loads() {
        let mut json = serde_json::to_value(document()).unwrap();
        json.as_object_mut().unwrap().remove("pnl_leaderboard");
        for protocol in json["protocols"].as_array_mut().unwrap() {
            protocol.as_object_mut().unwrap().remove("transactions_24h_truncated");
        }

        let doc: CacheDocument = serde_json::from_value(json).unwrap();
        assert_eq!(doc.pnl_leaderboard.reason(), Some(UnavailableReason::NotSupported));
        assert!(doc.protocols.iter().all(|p| !p.transactions_24h_truncated));
        assert!(doc.unavailable_fields().contains(&"pnl_leaderboard".to_string()));
    }

    #[test]
    fn test_venue_without_volume_serializes_null() {
        let entry = GlobalDerivativesEntry {
            rank: 9,
            name: "Adrena Protocol".to_string(),
            volume_24h: None,
            volume_7d: Some(dec!(1000)),
            change_1d: None,
            chains: vec!["Solana".to_string()],
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json["volume_24h"].is_null());
        assert_eq!(json["volume_7d"], "1000");
    }

    #[test]
    fn test_open_interest_usd() {
        let market = DriftMarket {
            symbol: "SOL-PERP".to_string(),
            volume_24h: dec!(1000),
            funding_rate: dec!(0.0001),
            open_interest: dec!(10),
            last_price: dec!(150.5),
            index_price: dec!(150.4),
        };
        assert_eq!(market.open_interest_usd(), dec!(1505.0));
    }
}
