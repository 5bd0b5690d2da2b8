//! One refresh pass: fan out to every provider, then merge into a
//! [`CacheDocument`].
//!
//! All calls are issued concurrently and each is bounded by its own timeout.
//! Analytics queries additionally share a fixed number of in-flight slots.
//! A failed or slow call only marks the fields it feeds as unavailable; the
//! document is always produced.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use perps_core::{
    CacheDocument, DataCategory, DriftMarket, JupiterMarket, LiquidationSummary, Metric,
    PnlLeaderboard, Protocol, ProtocolSnapshot, TimeWindow, TimeWindowMetrics, UnavailableReason,
    WalletOverlap,
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::config::{AggregatorConfig, AppConfig};
use crate::error::{ProviderError, ProviderResult};
use crate::history::History;
use crate::providers::{
    AnalyticsProvider, DefiLlamaClient, DriftClient, DriftMarketProvider, DuneClient,
    LedgerCount, LedgerProvider, ProtocolVolume, SolanaRpcClient, VolumeProvider,
};

/// Signature counts cover the trailing day
const LEDGER_HOURS: u32 = 24;
/// Realized P&L is ranked over the trailing day
const PNL_WINDOW: TimeWindow = TimeWindow::Day;

#[derive(Clone)]
pub struct Providers {
    pub volume: Arc<dyn VolumeProvider>,
    pub drift: Arc<dyn DriftMarketProvider>,
    pub analytics: Arc<dyn AnalyticsProvider>,
    pub ledger: Arc<dyn LedgerProvider>,
}

impl Providers {
    /// Build the live HTTP clients from configuration.
    pub fn from_config(config: &AppConfig) -> ProviderResult<Self> {
        Ok(Self {
            volume: Arc::new(DefiLlamaClient::new(&config.defillama)?),
            drift: Arc::new(DriftClient::new(&config.drift)?),
            analytics: Arc::new(DuneClient::new(&config.dune)?),
            ledger: Arc::new(SolanaRpcClient::new(&config.rpc)?),
        })
    }
}

/// Raw per-window results before merging.
struct WindowResults {
    traders: BTreeMap<Protocol, ProviderResult<u64>>,
    liquidations: ProviderResult<LiquidationSummary>,
    wallet_overlap: ProviderResult<WalletOverlap>,
}

pub struct Aggregator {
    providers: Providers,
    call_timeout: Duration,
    global_top_n: usize,
    jupiter_sample_window: TimeWindow,
    pnl_leaderboard_limit: usize,
    /// In-flight slots shared by every analytics query
    query_slots: Semaphore,
    history: Option<History>,
}

impl Aggregator {
    pub fn new(providers: Providers, config: &AggregatorConfig) -> Self {
        let jupiter_sample_window = config.jupiter_sample_window.parse().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Invalid jupiter_sample_window, using 1h");
            TimeWindow::OneHour
        });
        Self {
            providers,
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            global_top_n: config.global_top_n,
            jupiter_sample_window,
            pnl_leaderboard_limit: config.pnl_leaderboard_limit,
            query_slots: Semaphore::new(config.max_concurrent_queries.max(1)),
            history: None,
        }
    }

    /// Attach hourly history so timed-out liquidation windows can be rebuilt.
    pub fn with_history(mut self, history: History) -> Self {
        self.history = Some(history);
        self
    }

    pub async fn run(&self) -> CacheDocument {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> CacheDocument {
        let start = Instant::now();
        tracing::info!(
            protocols = %Protocol::ALL.len(),
            windows = %TimeWindow::ALL.len(),
            call_timeout_secs = %self.call_timeout.as_secs(),
            max_concurrent_queries = %self.query_slots.available_permits(),
            "Starting aggregation"
        );

        let windows_fut = join_all(TimeWindow::ALL.into_iter().map(|w| self.fetch_window(w)));
        let ledger_fut = join_all(Protocol::ALL.into_iter().map(|p| self.fetch_ledger(p)));
        let volumes_fut = self.guarded(
            "defillama protocol volumes".to_string(),
            self.providers.volume.protocol_volumes(),
        );
        let global_fut = self.guarded(
            "defillama global derivatives".to_string(),
            self.providers.volume.global_derivatives(self.global_top_n),
        );
        let drift_fut = self.guarded(
            "drift perp markets".to_string(),
            self.providers.drift.perp_markets(),
        );
        let jupiter_fut = self.bounded(
            format!("jupiter market trades {}", self.jupiter_sample_window),
            self.providers.analytics.market_trades(self.jupiter_sample_window),
        );
        let pnl_fut = self.bounded(
            format!("jupiter pnl leaderboard {}", PNL_WINDOW),
            self.providers
                .analytics
                .pnl_leaderboard(PNL_WINDOW, self.pnl_leaderboard_limit),
        );

        let (windows, ledgers, volumes, global, drift, jupiter_trades, pnl) = tokio::join!(
            windows_fut,
            ledger_fut,
            volumes_fut,
            global_fut,
            drift_fut,
            jupiter_fut,
            pnl_fut
        );

        let time_windows: BTreeMap<TimeWindow, TimeWindowMetrics> = TimeWindow::ALL
            .into_iter()
            .zip(windows)
            .map(|(window, results)| (window, self.merge_window(window, results, now)))
            .collect();

        let day_traders = time_windows
            .get(&TimeWindow::Day)
            .cloned()
            .unwrap_or_else(|| TimeWindowMetrics::unavailable(UnavailableReason::NotSupported));

        let protocols: Vec<ProtocolSnapshot> = Protocol::ALL
            .into_iter()
            .zip(ledgers)
            .map(|(protocol, ledger)| {
                protocol_snapshot(protocol, &volumes, day_traders.traders_for(protocol), ledger)
            })
            .collect();

        let (drift_markets, total_open_interest) = merge_drift(drift);

        let jupiter_volume = protocols
            .iter()
            .find(|p| p.protocol == Protocol::JupiterPerps)
            .map(|p| p.volume_24h.clone())
            .unwrap_or_else(|| Metric::unavailable(UnavailableReason::NotSupported));
        let jupiter_markets = merge_jupiter(jupiter_trades, &jupiter_volume);

        let global_derivatives = match global {
            Ok(list) => Metric::available(list),
            Err(e) => e.to_metric(),
        };
        let pnl_leaderboard: Metric<PnlLeaderboard> = match pnl {
            Ok(board) => Metric::available(board),
            Err(e) => e.to_metric(),
        };

        let document = CacheDocument {
            schema_version: CacheDocument::SCHEMA_VERSION,
            generated_at: now,
            time_windows,
            protocols,
            drift_markets,
            jupiter_markets,
            global_derivatives,
            total_open_interest,
            pnl_leaderboard,
        };

        log_summary(&document, start.elapsed());
        document
    }

    /// Run one provider call under the per-call deadline. Elapsing maps to
    /// `ProviderError::Timeout`; other calls are unaffected.
    async fn guarded<T, F>(&self, call: String, fut: F) -> ProviderResult<T>
    where
        F: Future<Output = ProviderResult<T>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(format!(
                "{} exceeded {}s",
                call,
                self.call_timeout.as_secs()
            ))),
        };

        match &result {
            Ok(_) => tracing::debug!(
                call = %call,
                duration_ms = %start.elapsed().as_millis(),
                "Provider call succeeded"
            ),
            Err(e) => tracing::warn!(
                call = %call,
                reason = %UnavailableReason::from(e),
                error = %e,
                duration_ms = %start.elapsed().as_millis(),
                "Provider call failed"
            ),
        }
        result
    }

    /// `guarded`, after waiting for an analytics slot. The call deadline
    /// starts once the slot is held.
    async fn bounded<T, F>(&self, call: String, fut: F) -> ProviderResult<T>
    where
        F: Future<Output = ProviderResult<T>>,
    {
        let _slot = match self.query_slots.acquire().await {
            Ok(slot) => slot,
            Err(_) => {
                return Err(ProviderError::Unavailable(format!(
                    "{} not started, query slots closed",
                    call
                )))
            }
        };
        self.guarded(call, fut).await
    }

    async fn fetch_window(&self, window: TimeWindow) -> WindowResults {
        let analytics = &self.providers.analytics;

        let traders_fut = join_all(
            Protocol::ALL
                .into_iter()
                .filter(|p| p.supports(DataCategory::Traders))
                .map(|protocol| async move {
                    let result = self
                        .bounded(
                            format!("{} traders {}", protocol, window),
                            analytics.traders(protocol, window),
                        )
                        .await;
                    (protocol, result)
                }),
        );
        let liquidations_fut = self.bounded(
            format!("liquidations {}", window),
            analytics.liquidations(window),
        );
        let overlap_fut = self.bounded(
            format!("wallet overlap {}", window),
            analytics.wallet_overlap(window),
        );

        let (traders, liquidations, wallet_overlap) =
            tokio::join!(traders_fut, liquidations_fut, overlap_fut);

        WindowResults {
            traders: traders.into_iter().collect(),
            liquidations,
            wallet_overlap,
        }
    }

    /// `None` when the protocol has no on-chain program to count.
    async fn fetch_ledger(&self, protocol: Protocol) -> Option<ProviderResult<LedgerCount>> {
        let program_id = protocol.program_id().filter(|_| protocol.supports(DataCategory::Ledger))?;
        Some(
            self.guarded(
                format!("{} signatures", protocol),
                self.providers.ledger.signature_count(program_id, LEDGER_HOURS),
            )
            .await,
        )
    }

    fn merge_window(
        &self,
        window: TimeWindow,
        results: WindowResults,
        now: DateTime<Utc>,
    ) -> TimeWindowMetrics {
        let traders = Protocol::ALL
            .into_iter()
            .map(|protocol| {
                let metric = match results.traders.get(&protocol) {
                    Some(Ok(count)) => Metric::available(*count),
                    Some(Err(e)) => e.to_metric(),
                    None => Metric::unavailable(UnavailableReason::NotSupported),
                };
                (protocol, metric)
            })
            .collect();

        let liquidations = match results.liquidations {
            Ok(summary) => Metric::available(summary),
            Err(e) if e.is_timeout() => self.liquidations_from_history(window, &e, now),
            Err(e) => e.to_metric(),
        };

        let wallet_overlap = match results.wallet_overlap {
            Ok(overlap) => Metric::available(overlap),
            Err(e) => e.to_metric(),
        };

        TimeWindowMetrics {
            traders,
            liquidations,
            wallet_overlap,
        }
    }

    fn liquidations_from_history(
        &self,
        window: TimeWindow,
        error: &ProviderError,
        now: DateTime<Utc>,
    ) -> Metric<LiquidationSummary> {
        let Some(history) = &self.history else {
            return error.to_metric();
        };
        let aggregated = history.aggregate_liquidations(window.hours(), now);
        if aggregated.is_available() {
            tracing::info!(window = %window, "Liquidations rebuilt from history after timeout");
            aggregated
        } else {
            error.to_metric()
        }
    }
}

fn protocol_snapshot(
    protocol: Protocol,
    volumes: &ProviderResult<BTreeMap<Protocol, ProtocolVolume>>,
    traders_24h: Metric<u64>,
    ledger: Option<ProviderResult<LedgerCount>>,
) -> ProtocolSnapshot {
    let volume: Result<&ProtocolVolume, Metric<()>> = match volumes {
        Ok(map) => map.get(&protocol).ok_or_else(|| {
            Metric::unavailable_with(UnavailableReason::NotSupported, "not listed by DeFiLlama")
        }),
        Err(e) => Err(e.to_metric()),
    };

    let field = |f: fn(&ProtocolVolume) -> Metric<Decimal>| -> Metric<Decimal> {
        match &volume {
            Ok(v) => f(v),
            Err(marker) => marker.unavailable_as().unwrap_or_else(|| {
                Metric::unavailable(UnavailableReason::NotSupported)
            }),
        }
    };

    let volume_24h = field(|v| reported(v.volume_24h));
    let fees_24h = volume_24h.clone().map(|v| v * protocol.fee_rate());
    let global_rank = match &volume {
        Ok(v) => reported(v.rank),
        Err(marker) => marker
            .unavailable_as()
            .unwrap_or_else(|| Metric::unavailable(UnavailableReason::NotSupported)),
    };

    let (transactions_24h, transactions_24h_truncated) = match ledger {
        Some(Ok(count)) => (Metric::available(count.signatures), count.truncated),
        Some(Err(e)) => (e.to_metric(), false),
        None => (Metric::unavailable(UnavailableReason::NotSupported), false),
    };

    ProtocolSnapshot {
        protocol,
        name: protocol.display_name().to_string(),
        volume_7d: field(|v| reported(v.volume_7d)),
        change_1d: field(|v| reported(v.change_1d)),
        change_7d: field(|v| reported(v.change_7d)),
        volume_24h,
        fees_24h,
        traders_24h,
        transactions_24h,
        transactions_24h_truncated,
        global_rank,
    }
}

/// Upstream listed the protocol but left this figure null.
fn reported<T>(value: Option<T>) -> Metric<T> {
    match value {
        Some(v) => Metric::available(v),
        None => Metric::unavailable_with(UnavailableReason::NotSupported, "not reported upstream"),
    }
}

fn merge_drift(
    result: ProviderResult<BTreeMap<String, DriftMarket>>,
) -> (Metric<BTreeMap<String, DriftMarket>>, Metric<Decimal>) {
    match result {
        Ok(markets) => {
            let total_oi: Decimal = markets.values().map(DriftMarket::open_interest_usd).sum();
            (Metric::available(markets), Metric::available(total_oi))
        }
        Err(e) => (e.to_metric(), e.to_metric()),
    }
}

/// Distribute Jupiter's 24h volume across markets by sampled trade share.
fn merge_jupiter(
    result: ProviderResult<BTreeMap<String, u64>>,
    jupiter_volume: &Metric<Decimal>,
) -> Metric<BTreeMap<String, JupiterMarket>> {
    let trades = match result {
        Ok(trades) => trades,
        Err(e) => return e.to_metric(),
    };

    let total: u64 = trades.values().sum();
    let markets = trades
        .into_iter()
        .map(|(symbol, count)| {
            let share = if total == 0 {
                Decimal::ZERO
            } else {
                Decimal::from(count) / Decimal::from(total)
            };
            let estimated_volume_24h = match jupiter_volume {
                Metric::Available { value } => Metric::available((*value * share).round_dp(2)),
                unavailable => unavailable
                    .unavailable_as()
                    .unwrap_or_else(|| Metric::unavailable(UnavailableReason::NotSupported)),
            };
            let market = JupiterMarket {
                symbol: symbol.clone(),
                trades: count,
                trade_share: share.round_dp(6),
                estimated_volume_24h,
            };
            (symbol, market)
        })
        .collect();

    Metric::available(markets)
}

fn log_summary(doc: &CacheDocument, elapsed: Duration) {
    let markets = doc.drift_markets.value().map(|m| m.len()).unwrap_or(0);
    for (window, metrics) in &doc.time_windows {
        let traders: Vec<String> = metrics
            .traders
            .iter()
            .map(|(p, m)| match m.value() {
                Some(n) => format!("{}={}", p, n),
                None => format!("{}={}", p, m.reason().map(|r| r.as_str()).unwrap_or("-")),
            })
            .collect();
        tracing::info!(
            window = %window,
            traders = %traders.join(" "),
            liquidations = %metrics.liquidations.value().map(|l| l.count.to_string()).unwrap_or_else(|| "unavailable".to_string()),
            wallet_overlap = %metrics.wallet_overlap.value().map(|o| o.multi_platform.to_string()).unwrap_or_else(|| "unavailable".to_string()),
            "Window summary"
        );
    }

    let (winners, losers) = doc
        .pnl_leaderboard
        .value()
        .map(|b| (b.top_winners.len(), b.top_losers.len()))
        .unwrap_or((0, 0));
    let unexpected = doc.unexpected_unavailable_fields();
    tracing::info!(
        protocols = %doc.protocols.len(),
        drift_markets = %markets,
        pnl_winners = %winners,
        pnl_losers = %losers,
        unavailable_fields = %unexpected.len(),
        duration_ms = %elapsed.as_millis(),
        "Aggregation complete"
    );
    if !unexpected.is_empty() {
        tracing::warn!(fields = ?unexpected, "Fields unavailable in this refresh");
    }
}
