//! Hourly condensed snapshots of the cache artifact.
//!
//! Kept for 168 hours. Besides trend lines for the dashboard, the 1h
//! liquidation samples let the refresh job rebuild longer windows when the
//! direct query times out.

use chrono::{DateTime, Duration, Utc};
use perps_core::{
    CacheDocument, LiquidationSummary, Metric, Protocol, TimeWindow, UnavailableReason,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::cache::write_json_atomic;
use crate::error::CacheError;

pub const SNAPSHOT_INTERVAL_MINUTES: i64 = 60;
pub const RETENTION_HOURS: i64 = 168;

/// Funding rates are only kept for markets above this 24h volume (USD)
const FUNDING_VOLUME_FLOOR: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolPoint {
    pub volume_24h: Option<Decimal>,
    pub traders_24h: Option<u64>,
    pub fees_24h: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_volume_24h: Decimal,
    pub total_traders_24h: u64,
    pub total_open_interest: Option<Decimal>,
    pub protocols: BTreeMap<Protocol, ProtocolPoint>,
    pub funding_rates: BTreeMap<String, Decimal>,
    pub liquidations_1h: Metric<LiquidationSummary>,
}

impl HistorySnapshot {
    pub fn from_document(doc: &CacheDocument, timestamp: DateTime<Utc>) -> Self {
        let protocols: BTreeMap<Protocol, ProtocolPoint> = doc
            .protocols
            .iter()
            .map(|p| {
                (
                    p.protocol,
                    ProtocolPoint {
                        volume_24h: p.volume_24h.value().copied(),
                        traders_24h: p.traders_24h.value().copied(),
                        fees_24h: p.fees_24h.value().copied(),
                    },
                )
            })
            .collect();

        let funding_rates = doc
            .drift_markets
            .value()
            .map(|markets| {
                markets
                    .values()
                    .filter(|m| m.volume_24h > FUNDING_VOLUME_FLOOR)
                    .map(|m| (m.symbol.clone(), m.funding_rate))
                    .collect()
            })
            .unwrap_or_default();

        let liquidations_1h = doc
            .window(TimeWindow::OneHour)
            .map(|w| w.liquidations.clone())
            .unwrap_or_else(|| Metric::unavailable(UnavailableReason::NotSupported));

        Self {
            timestamp,
            total_volume_24h: protocols.values().filter_map(|p| p.volume_24h).sum(),
            total_traders_24h: protocols.values().filter_map(|p| p.traders_24h).sum(),
            total_open_interest: doc.total_open_interest.value().copied(),
            protocols,
            funding_rates,
            liquidations_1h,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub snapshots: Vec<HistorySnapshot>,
    #[serde(default)]
    pub last_snapshot_at: Option<DateTime<Utc>>,
}

impl History {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_snapshot_at {
            Some(last) => now - last >= Duration::minutes(SNAPSHOT_INTERVAL_MINUTES),
            None => true,
        }
    }

    /// Drop snapshots older than the retention period. Returns how many went.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::hours(RETENTION_HOURS);
        let before = self.snapshots.len();
        self.snapshots.retain(|s| s.timestamp >= cutoff);
        before - self.snapshots.len()
    }

    pub fn since(&self, cutoff: DateTime<Utc>) -> impl Iterator<Item = &HistorySnapshot> {
        self.snapshots.iter().filter(move |s| s.timestamp >= cutoff)
    }

    /// Sum hourly liquidation samples over the last `hours`.
    ///
    /// Needs at least `hours / 2` usable samples; fewer yields
    /// `insufficient_history` rather than an undercount.
    pub fn aggregate_liquidations(
        &self,
        hours: u32,
        now: DateTime<Utc>,
    ) -> Metric<LiquidationSummary> {
        let cutoff = now - Duration::hours(i64::from(hours));
        let samples: Vec<&LiquidationSummary> = self
            .since(cutoff)
            .filter_map(|s| s.liquidations_1h.value())
            .collect();

        let required = (hours / 2).max(1) as usize;
        if samples.len() < required {
            tracing::warn!(
                hours = %hours,
                samples = %samples.len(),
                required = %required,
                "Insufficient history for liquidation aggregation"
            );
            return Metric::unavailable_with(
                UnavailableReason::InsufficientHistory,
                format!("{} of {} hourly samples", samples.len(), required),
            );
        }

        let summary = LiquidationSummary {
            count: samples.iter().map(|s| s.count).sum(),
            txns: samples.iter().map(|s| s.txns).sum(),
            aggregated_from: Some(samples.len() as u32),
        };
        tracing::info!(
            hours = %hours,
            samples = %samples.len(),
            count = %summary.count,
            txns = %summary.txns,
            "Aggregated liquidations from history"
        );
        Metric::available(summary)
    }
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable history loads as empty.
    pub fn load(&self) -> History {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return History::default(),
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to read history");
                return History::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(history) => history,
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "History file is corrupt, starting over");
                History::default()
            }
        }
    }

    pub fn save(&self, history: &History) -> Result<(), CacheError> {
        write_json_atomic(&self.path, history)
    }

    /// Append a snapshot of `doc` if the interval has elapsed. Returns whether
    /// one was written.
    pub fn record(&self, doc: &CacheDocument, now: DateTime<Utc>) -> Result<bool, CacheError> {
        let mut history = self.load();
        if !history.is_due(now) {
            tracing::info!("Skipping history snapshot, interval not reached");
            return Ok(false);
        }

        history.snapshots.push(HistorySnapshot::from_document(doc, now));
        history.last_snapshot_at = Some(now);

        let pruned = history.prune(now);
        if pruned > 0 {
            tracing::info!(pruned = %pruned, retention_hours = %RETENTION_HOURS, "Pruned old snapshots");
        }

        self.save(&history)?;
        tracing::info!(snapshots = %history.snapshots.len(), "History snapshot saved");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use perps_core::{DriftMarket, TimeWindowMetrics};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    fn hourly(count: u64) -> HistorySnapshot {
        HistorySnapshot {
            timestamp: t0(),
            total_volume_24h: Decimal::ZERO,
            total_traders_24h: 0,
            total_open_interest: None,
            protocols: BTreeMap::new(),
            funding_rates: BTreeMap::new(),
            liquidations_1h: Metric::available(LiquidationSummary {
                count,
                txns: count / 2,
                aggregated_from: None,
            }),
        }
    }

    fn history_with(samples: usize, now: DateTime<Utc>) -> History {
        History {
            snapshots: (0..samples)
                .map(|i| HistorySnapshot {
                    timestamp: now - Duration::hours(i as i64),
                    ..hourly(4)
                })
                .collect(),
            last_snapshot_at: Some(now),
        }
    }

    fn document() -> CacheDocument {
        let mut windows = BTreeMap::new();
        windows.insert(
            TimeWindow::OneHour,
            TimeWindowMetrics {
                liquidations: Metric::available(LiquidationSummary {
                    count: 7,
                    txns: 5,
                    aggregated_from: None,
                }),
                ..TimeWindowMetrics::unavailable(UnavailableReason::Timeout)
            },
        );
        let mut drift = BTreeMap::new();
        for (symbol, volume) in [("SOL-PERP", dec!(5000000)), ("DUST-PERP", dec!(900))] {
            drift.insert(
                symbol.to_string(),
                DriftMarket {
                    symbol: symbol.to_string(),
                    volume_24h: volume,
                    funding_rate: dec!(0.0001),
                    open_interest: dec!(10),
                    last_price: dec!(1),
                    index_price: dec!(1),
                },
            );
        }
        CacheDocument {
            schema_version: CacheDocument::SCHEMA_VERSION,
            generated_at: t0(),
            time_windows: windows,
            protocols: vec![],
            drift_markets: Metric::available(drift),
            jupiter_markets: Metric::unavailable(UnavailableReason::Timeout),
            global_derivatives: Metric::unavailable(UnavailableReason::UpstreamError),
            total_open_interest: Metric::available(dec!(20)),
            pnl_leaderboard: Metric::unavailable(UnavailableReason::NotSupported),
        }
    }

    #[test]
    fn test_aggregate_needs_half_the_hours() {
        let now = t0();
        let thin = history_with(11, now);
        let agg = thin.aggregate_liquidations(24, now);
        assert_eq!(agg.reason(), Some(UnavailableReason::InsufficientHistory));

        let enough = history_with(12, now);
        let agg = enough.aggregate_liquidations(24, now);
        assert_eq!(
            agg.value(),
            Some(&LiquidationSummary { count: 48, txns: 24, aggregated_from: Some(12) })
        );
    }

    #[test]
    fn test_aggregate_ignores_unavailable_and_stale_samples() {
        let now = t0();
        let mut history = history_with(4, now);
        history.snapshots[0].liquidations_1h = Metric::unavailable(UnavailableReason::Timeout);
        history.snapshots.push(HistorySnapshot {
            timestamp: now - Duration::hours(30),
            ..hourly(1000)
        });

        let agg = history.aggregate_liquidations(6, now);
        let summary = agg.value().unwrap();
        assert_eq!(summary.count, 12);
        assert_eq!(summary.aggregated_from, Some(3));
    }

    #[test]
    fn test_snapshot_condenses_document() {
        let snap = HistorySnapshot::from_document(&document(), t0());
        assert_eq!(snap.funding_rates.len(), 1);
        assert!(snap.funding_rates.contains_key("SOL-PERP"));
        assert_eq!(snap.total_open_interest, Some(dec!(20)));
        assert_eq!(snap.liquidations_1h.value().map(|l| l.count), Some(7));
    }

    #[test]
    fn test_record_respects_interval_and_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.json"));
        let doc = document();
        let now = t0();

        assert!(store.record(&doc, now).unwrap());
        assert!(!store.record(&doc, now + Duration::minutes(59)).unwrap());
        assert!(store.record(&doc, now + Duration::minutes(60)).unwrap());
        assert_eq!(store.load().snapshots.len(), 2);

        let later = now + Duration::hours(RETENTION_HOURS) + Duration::minutes(30);
        assert!(store.record(&doc, later).unwrap());
        let history = store.load();
        assert_eq!(history.snapshots.len(), 2);
        assert_eq!(history.last_snapshot_at, Some(later));
    }

    #[test]
    fn test_corrupt_history_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        fs::write(&path, b"not json").unwrap();
        assert_eq!(HistoryStore::new(&path).load(), History::default());
    }
}
