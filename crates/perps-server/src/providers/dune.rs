use async_trait::async_trait;
use perps_core::{LiquidationSummary, PnlEntry, PnlLeaderboard, Protocol, TimeWindow, WalletOverlap};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{build_http_client, ensure_success, AnalyticsProvider};
use crate::config::{DuneConfig, DuneQueries};
use crate::error::{ProviderError, ProviderResult};

pub type Row = Map<String, Value>;

/// Per-request HTTP timeout; the overall query deadline is `query_timeout`.
const REQUEST_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Dune Client - saved query execution with polling
// ============================================================================

#[derive(Clone)]
pub struct DuneClient {
    client: Client,
    base_url: String,
    api_key: String,
    poll_interval: Duration,
    query_timeout: Duration,
    queries: DuneQueries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecutionState {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl ExecutionState {
    pub(crate) fn parse(state: &str) -> Option<Self> {
        match state {
            "QUERY_STATE_PENDING" => Some(ExecutionState::Pending),
            "QUERY_STATE_EXECUTING" => Some(ExecutionState::Executing),
            "QUERY_STATE_COMPLETED" | "QUERY_STATE_COMPLETED_PARTIAL" => Some(ExecutionState::Completed),
            "QUERY_STATE_FAILED" => Some(ExecutionState::Failed),
            "QUERY_STATE_CANCELLED" => Some(ExecutionState::Cancelled),
            "QUERY_STATE_EXPIRED" => Some(ExecutionState::Expired),
            _ => None,
        }
    }

    fn is_finished(&self) -> bool {
        !matches!(self, ExecutionState::Pending | ExecutionState::Executing)
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    execution_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    state: String,
}

#[derive(Debug, Deserialize)]
struct ResultsResponse {
    result: Option<ResultBody>,
}

#[derive(Debug, Deserialize)]
struct ResultBody {
    #[serde(default)]
    rows: Vec<Row>,
}

/// First and last four characters of a key, for logs.
fn key_preview(api_key: &str) -> String {
    let len = api_key.chars().count();
    if len > 8 {
        let head: String = api_key.chars().take(4).collect();
        let tail: String = api_key.chars().skip(len - 4).collect();
        format!("{}...{}", head, tail)
    } else if api_key.is_empty() {
        "EMPTY".to_string()
    } else {
        "***".to_string()
    }
}

impl DuneClient {
    pub fn new(config: &DuneConfig) -> ProviderResult<Self> {
        tracing::debug!(api_key = %key_preview(&config.api_key), "Creating Dune client");

        Ok(Self {
            client: build_http_client(REQUEST_TIMEOUT_SECS)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            query_timeout: Duration::from_secs(config.query_timeout_secs),
            queries: config.queries.clone(),
        })
    }

    /// Execute a saved query with a `hours` parameter and wait for its rows.
    ///
    /// Returns `ProviderError::Timeout` once the deadline passes, which is
    /// distinct from a completed execution that returned no rows.
    pub async fn run_query(&self, query_id: u64, hours: u32) -> ProviderResult<Vec<Row>> {
        if self.api_key.is_empty() {
            return Err(ProviderError::Unavailable(
                "Dune API key not configured (PERPS__DUNE__API_KEY)".to_string(),
            ));
        }

        let start = Instant::now();
        let deadline = start + self.query_timeout;

        let execution_id = self.execute(query_id, hours).await?;
        tracing::debug!(query_id = %query_id, hours = %hours, execution_id = %execution_id, "Dune execution started");

        loop {
            let state = self.status(&execution_id).await?;
            if state.is_finished() {
                match state {
                    ExecutionState::Completed => break,
                    other => {
                        tracing::warn!(query_id = %query_id, execution_id = %execution_id, state = ?other, "Dune execution did not complete");
                        return Err(ProviderError::QueryFailed(format!(
                            "query {} execution {} ended in {:?}",
                            query_id, execution_id, other
                        )));
                    }
                }
            }

            if Instant::now() + self.poll_interval > deadline {
                self.cancel(&execution_id).await;
                tracing::warn!(
                    query_id = %query_id,
                    hours = %hours,
                    elapsed_secs = %start.elapsed().as_secs(),
                    "Dune query timed out"
                );
                return Err(ProviderError::Timeout(format!(
                    "query {} ({}h) exceeded {}s",
                    query_id,
                    hours,
                    self.query_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let rows = self.results(&execution_id).await?;
        tracing::info!(
            query_id = %query_id,
            hours = %hours,
            rows = %rows.len(),
            duration_ms = %start.elapsed().as_millis(),
            "Dune query completed"
        );
        Ok(rows)
    }

    async fn execute(&self, query_id: u64, hours: u32) -> ProviderResult<String> {
        let url = format!("{}/query/{}/execute", self.base_url, query_id);
        let response = self
            .client
            .post(&url)
            .header("X-Dune-API-Key", &self.api_key)
            .json(&json!({ "query_parameters": { "hours": hours } }))
            .send()
            .await?;
        let body: ExecuteResponse = ensure_success(response).await?.json().await?;
        Ok(body.execution_id)
    }

    async fn status(&self, execution_id: &str) -> ProviderResult<ExecutionState> {
        let url = format!("{}/execution/{}/status", self.base_url, execution_id);
        let response = self
            .client
            .get(&url)
            .header("X-Dune-API-Key", &self.api_key)
            .send()
            .await?;
        let body: StatusResponse = ensure_success(response).await?.json().await?;
        ExecutionState::parse(&body.state)
            .ok_or_else(|| ProviderError::Malformed(format!("unknown Dune state {}", body.state)))
    }

    async fn results(&self, execution_id: &str) -> ProviderResult<Vec<Row>> {
        let url = format!("{}/execution/{}/results", self.base_url, execution_id);
        let response = self
            .client
            .get(&url)
            .header("X-Dune-API-Key", &self.api_key)
            .send()
            .await?;
        let body: ResultsResponse = ensure_success(response).await?.json().await?;
        body.result
            .map(|r| r.rows)
            .ok_or_else(|| ProviderError::Malformed(format!("execution {} has no result", execution_id)))
    }

    /// Best effort, a failed cancel only costs upstream credits.
    async fn cancel(&self, execution_id: &str) {
        let url = format!("{}/execution/{}/cancel", self.base_url, execution_id);
        if let Err(e) = self
            .client
            .post(&url)
            .header("X-Dune-API-Key", &self.api_key)
            .send()
            .await
        {
            tracing::debug!(execution_id = %execution_id, error = %e, "Dune cancel failed");
        }
    }

    fn query_id(id: Option<u64>, what: &str) -> ProviderResult<u64> {
        id.ok_or_else(|| ProviderError::Unavailable(format!("no Dune query configured for {}", what)))
    }
}

#[async_trait]
impl AnalyticsProvider for DuneClient {
    async fn traders(&self, protocol: Protocol, window: TimeWindow) -> ProviderResult<u64> {
        let id = Self::query_id(
            self.queries.traders.for_protocol(protocol),
            &format!("{} traders", protocol),
        )?;
        let rows = self.run_query(id, window.hours()).await?;
        parse_traders(&rows)
    }

    async fn liquidations(&self, window: TimeWindow) -> ProviderResult<LiquidationSummary> {
        let id = Self::query_id(self.queries.liquidations, "liquidations")?;
        let rows = self.run_query(id, window.hours()).await?;
        parse_liquidations(&rows)
    }

    async fn wallet_overlap(&self, window: TimeWindow) -> ProviderResult<WalletOverlap> {
        let id = Self::query_id(self.queries.wallet_overlap, "wallet overlap")?;
        let rows = self.run_query(id, window.hours()).await?;
        parse_wallet_overlap(&rows)
    }

    async fn market_trades(&self, window: TimeWindow) -> ProviderResult<BTreeMap<String, u64>> {
        let id = Self::query_id(self.queries.jupiter_markets, "jupiter markets")?;
        let rows = self.run_query(id, window.hours()).await?;
        parse_market_trades(&rows)
    }

    async fn pnl_leaderboard(&self, window: TimeWindow, limit: usize) -> ProviderResult<PnlLeaderboard> {
        let id = Self::query_id(self.queries.jupiter_pnl, "jupiter pnl leaderboard")?;
        let rows = self.run_query(id, window.hours()).await?;
        parse_pnl_leaderboard(&rows, limit)
    }
}

// ============================================================================
// Row decoding
// ============================================================================

/// Read a count column; Dune returns numbers, or strings for big integers.
/// A null cell is not a count.
fn column_u64(row: &Row, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| match row.get(*key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    })
}

fn column_decimal(row: &Row, keys: &[&str]) -> Option<Decimal> {
    keys.iter().find_map(|key| match row.get(*key)? {
        Value::Number(n) => parse_decimal(&n.to_string()),
        Value::String(s) => parse_decimal(s.trim()),
        _ => None,
    })
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    s.parse::<Decimal>()
        .ok()
        .or_else(|| Decimal::from_scientific(s).ok())
}

fn required_u64(row: &Row, keys: &[&str], what: &str) -> ProviderResult<u64> {
    column_u64(row, keys).ok_or_else(|| {
        ProviderError::Malformed(format!("{} row has no count in `{}`", what, keys.join("`/`")))
    })
}

fn column_str<'a>(row: &'a Row, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| row.get(*key)?.as_str())
}

pub(crate) fn parse_traders(rows: &[Row]) -> ProviderResult<u64> {
    match rows.first() {
        // Completed with no rows: no trades in the window
        None => Ok(0),
        Some(row) => column_u64(row, &["traders", "unique_traders", "count"]).ok_or_else(|| {
            ProviderError::Malformed("traders row has no `traders` column".to_string())
        }),
    }
}

pub(crate) fn parse_liquidations(rows: &[Row]) -> ProviderResult<LiquidationSummary> {
    let Some(row) = rows.first() else {
        return Ok(LiquidationSummary {
            count: 0,
            txns: 0,
            aggregated_from: None,
        });
    };
    let count = required_u64(row, &["count", "liquidations"], "liquidations")?;
    // Older query versions have no txns column at all
    let txns = if ["txns", "transactions"].iter().any(|k| row.contains_key(*k)) {
        required_u64(row, &["txns", "transactions"], "liquidations")?
    } else {
        count
    };
    Ok(LiquidationSummary {
        count,
        txns,
        aggregated_from: None,
    })
}

/// Accepts a single wide row, or one `{category, wallets}` row per bucket.
pub(crate) fn parse_wallet_overlap(rows: &[Row]) -> ProviderResult<WalletOverlap> {
    let mut overlap = WalletOverlap {
        multi_platform: 0,
        drift_only: 0,
        jupiter_only: 0,
    };
    let Some(first) = rows.first() else {
        return Ok(overlap);
    };

    if first.contains_key("multi_platform") {
        overlap.multi_platform = required_u64(first, &["multi_platform"], "wallet overlap")?;
        overlap.drift_only = required_u64(first, &["drift_only"], "wallet overlap")?;
        overlap.jupiter_only = required_u64(first, &["jupiter_only"], "wallet overlap")?;
        return Ok(overlap);
    }

    for row in rows {
        let category = column_str(row, &["category", "platform"])
            .ok_or_else(|| ProviderError::Malformed("wallet overlap row has no category".to_string()))?;
        let wallets = required_u64(row, &["wallets", "count"], "wallet overlap")?;
        match category.to_lowercase().as_str() {
            "multi_platform" | "both" | "multi" => overlap.multi_platform += wallets,
            "drift_only" | "drift" => overlap.drift_only += wallets,
            "jupiter_only" | "jupiter" => overlap.jupiter_only += wallets,
            other => tracing::debug!(category = %other, "Ignoring unknown wallet overlap bucket"),
        }
    }
    Ok(overlap)
}

pub(crate) fn parse_market_trades(rows: &[Row]) -> ProviderResult<BTreeMap<String, u64>> {
    let mut trades = BTreeMap::new();
    for row in rows {
        let market = column_str(row, &["market", "symbol", "asset"])
            .ok_or_else(|| ProviderError::Malformed("market row has no `market` column".to_string()))?;
        let count = required_u64(row, &["trades", "count"], "market")?;
        *trades.entry(market.trim().to_uppercase()).or_insert(0) += count;
    }
    Ok(trades)
}

/// One row per wallet with its realized P&L; split into the `limit` largest
/// gains and the `limit` largest losses. Break-even wallets are in neither.
pub(crate) fn parse_pnl_leaderboard(rows: &[Row], limit: usize) -> ProviderResult<PnlLeaderboard> {
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let trader = column_str(row, &["trader", "wallet", "owner"])
            .ok_or_else(|| ProviderError::Malformed("pnl row has no `trader` column".to_string()))?;
        let pnl_usd = column_decimal(row, &["pnl_usd", "pnl", "realized_pnl"])
            .ok_or_else(|| ProviderError::Malformed(format!("pnl row for {} has no `pnl_usd`", trader)))?;
        entries.push(PnlEntry {
            trader: trader.to_string(),
            pnl_usd: pnl_usd.round_dp(2),
            trades: column_u64(row, &["trades", "trade_count"]),
        });
    }
    entries.sort_by(|a, b| b.pnl_usd.cmp(&a.pnl_usd));

    Ok(PnlLeaderboard {
        top_winners: entries
            .iter()
            .filter(|e| e.pnl_usd > Decimal::ZERO)
            .take(limit)
            .cloned()
            .collect(),
        top_losers: entries
            .iter()
            .rev()
            .filter(|e| e.pnl_usd < Decimal::ZERO)
            .take(limit)
            .cloned()
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn rows(value: Value) -> Vec<Row> {
        serde_json::from_value(value).unwrap()
    }

    // ------------------------------------------------------------------------
    // Local stand-in for the Dune API
    // ------------------------------------------------------------------------

    #[derive(Clone)]
    struct FakeDune {
        state: &'static str,
        rows: Value,
        cancels: Arc<AtomicUsize>,
        results_fetched: Arc<AtomicUsize>,
    }

    impl FakeDune {
        fn new(state: &'static str, rows: Value) -> Self {
            Self {
                state,
                rows,
                cancels: Arc::new(AtomicUsize::new(0)),
                results_fetched: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    async fn serve_fake_dune(fake: FakeDune) -> String {
        let app = Router::new()
            .route(
                "/query/{query_id}/execute",
                post(|| async { Json(json!({"execution_id": "01HTESTEXEC", "state": "QUERY_STATE_PENDING"})) }),
            )
            .route(
                "/execution/{execution_id}/status",
                get(|State(fake): State<FakeDune>| async move { Json(json!({"state": fake.state})) }),
            )
            .route(
                "/execution/{execution_id}/results",
                get(|State(fake): State<FakeDune>| async move {
                    fake.results_fetched.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"result": {"rows": fake.rows}}))
                }),
            )
            .route(
                "/execution/{execution_id}/cancel",
                post(|State(fake): State<FakeDune>| async move {
                    fake.cancels.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"success": true}))
                }),
            )
            .with_state(fake);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(base_url: String, query_timeout_secs: u64) -> DuneClient {
        DuneClient::new(&DuneConfig {
            api_key: "test-key-0000".to_string(),
            base_url,
            poll_interval_secs: 1,
            query_timeout_secs,
            queries: Default::default(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_query_still_executing_at_deadline_is_cancelled() {
        let fake = FakeDune::new("QUERY_STATE_EXECUTING", json!([]));
        let dune = client(serve_fake_dune(fake.clone()).await, 1);

        let err = dune.run_query(4_100_001, 24).await.unwrap_err();
        assert!(err.is_timeout(), "{:?}", err);
        assert_eq!(fake.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(fake.results_fetched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_completed_without_rows_is_empty_not_error() {
        let fake = FakeDune::new("QUERY_STATE_COMPLETED", json!([]));
        let dune = client(serve_fake_dune(fake.clone()).await, 30);

        let rows = dune.run_query(4_100_002, 1).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(parse_traders(&rows).unwrap(), 0);
        assert_eq!(fake.cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_execution_is_query_failed() {
        let fake = FakeDune::new("QUERY_STATE_FAILED", json!([{"traders": 5}]));
        let dune = client(serve_fake_dune(fake.clone()).await, 30);

        let err = dune.run_query(4_100_003, 8).await.unwrap_err();
        assert!(matches!(err, ProviderError::QueryFailed(_)), "{:?}", err);
        assert_eq!(fake.results_fetched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_completed_rows_flow_through_parser() {
        let fake = FakeDune::new("QUERY_STATE_COMPLETED", json!([{"traders": "1532"}]));
        let dune = client(serve_fake_dune(fake).await, 30);

        let rows = dune.run_query(4_100_004, 4).await.unwrap();
        assert_eq!(parse_traders(&rows).unwrap(), 1532);
    }

    #[test]
    fn test_key_preview_handles_multibyte_keys() {
        assert_eq!(key_preview(""), "EMPTY");
        assert_eq!(key_preview("short"), "***");
        assert_eq!(key_preview("abcd1234wxyz"), "abcd...wxyz");
        assert_eq!(key_preview("ключ-абвгдежз"), "ключ...дежз");
        assert_eq!(key_preview("ééééééééé"), "éééé...éééé");
    }

    #[test]
    fn test_execution_states() {
        assert_eq!(ExecutionState::parse("QUERY_STATE_COMPLETED"), Some(ExecutionState::Completed));
        assert!(!ExecutionState::Executing.is_finished());
        assert!(ExecutionState::Failed.is_finished());
        assert_eq!(ExecutionState::parse("SOMETHING_NEW"), None);
    }

    #[test]
    fn test_empty_result_is_zero_not_missing() {
        assert_eq!(parse_traders(&[]).unwrap(), 0);
        let liq = parse_liquidations(&[]).unwrap();
        assert_eq!((liq.count, liq.txns), (0, 0));
        assert_eq!(parse_wallet_overlap(&[]).unwrap().multi_platform, 0);
        assert!(parse_market_trades(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_counts_from_numbers_and_strings() {
        assert_eq!(parse_traders(&rows(json!([{"traders": 1532}]))).unwrap(), 1532);
        assert_eq!(parse_traders(&rows(json!([{"unique_traders": "88"}]))).unwrap(), 88);
        assert!(parse_traders(&rows(json!([{"wallets": 3}]))).is_err());

        let liq = parse_liquidations(&rows(json!([{"count": 41, "txns": 37}]))).unwrap();
        assert_eq!((liq.count, liq.txns), (41, 37));
    }

    #[test]
    fn test_wallet_overlap_shapes() {
        let wide = parse_wallet_overlap(&rows(json!([
            {"multi_platform": 120, "drift_only": 900, "jupiter_only": 4000}
        ])))
        .unwrap();
        assert_eq!(wide.jupiter_only, 4000);

        let long = parse_wallet_overlap(&rows(json!([
            {"category": "multi_platform", "wallets": 5},
            {"category": "drift_only", "wallets": 7},
            {"category": "jupiter_only", "wallets": 11}
        ])))
        .unwrap();
        assert_eq!((long.multi_platform, long.drift_only, long.jupiter_only), (5, 7, 11));
    }

    #[test]
    fn test_null_or_missing_counts_are_malformed() {
        let err = parse_traders(&rows(json!([{"traders": null}]))).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));

        let err = parse_liquidations(&rows(json!([{"count": 3, "txns": null}]))).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
        let liq = parse_liquidations(&rows(json!([{"count": 3}]))).unwrap();
        assert_eq!(liq.txns, 3);

        let err = parse_wallet_overlap(&rows(json!([{"multi_platform": 120, "drift_only": 900}]))).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
        let err = parse_wallet_overlap(&rows(json!([
            {"multi_platform": 120, "drift_only": null, "jupiter_only": 4000}
        ])))
        .unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
        let err = parse_wallet_overlap(&rows(json!([{"category": "drift_only"}]))).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));

        let err = parse_market_trades(&rows(json!([{"market": "SOL"}]))).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
        let err = parse_market_trades(&rows(json!([{"market": "SOL", "trades": null}]))).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[test]
    fn test_pnl_leaderboard_splits_winners_and_losers() {
        let board = parse_pnl_leaderboard(
            &rows(json!([
                {"trader": "w1", "pnl_usd": 1200.456, "trades": 14},
                {"trader": "w2", "pnl_usd": "-5000"},
                {"trader": "w3", "pnl_usd": 0},
                {"trader": "w4", "pnl_usd": 90000},
                {"trader": "w5", "pnl_usd": -12.5},
                {"trader": "w6", "pnl_usd": 3}
            ])),
            2,
        )
        .unwrap();

        let winners: Vec<&str> = board.top_winners.iter().map(|e| e.trader.as_str()).collect();
        let losers: Vec<&str> = board.top_losers.iter().map(|e| e.trader.as_str()).collect();
        assert_eq!(winners, vec!["w4", "w1"]);
        assert_eq!(losers, vec!["w2", "w5"]);
        assert_eq!(board.top_winners[1].pnl_usd, dec!(1200.46));
        assert_eq!(board.top_winners[1].trades, Some(14));
        assert_eq!(board.top_losers[0].pnl_usd, dec!(-5000));

        assert_eq!(parse_pnl_leaderboard(&[], 50).unwrap(), PnlLeaderboard::default());
        let err = parse_pnl_leaderboard(&rows(json!([{"trader": "w1", "pnl_usd": null}])), 50).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[test]
    fn test_market_trades_normalizes_symbols() {
        let trades = parse_market_trades(&rows(json!([
            {"market": "sol", "trades": 10},
            {"market": "SOL", "trades": 5},
            {"market": "BTC", "trades": "3"}
        ])))
        .unwrap();
        assert_eq!(trades["SOL"], 15);
        assert_eq!(trades["BTC"], 3);
    }
}
