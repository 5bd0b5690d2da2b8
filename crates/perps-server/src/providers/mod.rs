//! Provider clients, one per upstream data source.
//!
//! Every client maps the upstream payload into typed values at its own
//! boundary and reports failures as [`ProviderError`]. The aggregator only
//! sees these traits, so tests can drive it with stubs.

pub mod defillama;
pub mod drift;
pub mod dune;
pub mod rpc;

use async_trait::async_trait;
use perps_core::{
    DriftMarket, GlobalDerivativesEntry, LiquidationSummary, PnlLeaderboard, Protocol, TimeWindow,
    WalletOverlap,
};
use reqwest::{Client, Response};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{ProviderError, ProviderResult};

pub use defillama::DefiLlamaClient;
pub use drift::DriftClient;
pub use dune::DuneClient;
pub use rpc::SolanaRpcClient;

/// Volume figures for one tracked protocol. `None` means upstream listed
/// the protocol without that figure.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolVolume {
    pub volume_24h: Option<Decimal>,
    pub volume_7d: Option<Decimal>,
    pub change_1d: Option<Decimal>,
    pub change_7d: Option<Decimal>,
    /// 1-based rank by 24h volume across all derivatives venues, only
    /// assigned when the 24h volume is reported
    pub rank: Option<u32>,
}

/// Signature count for one program. `truncated` is set when paging hit its
/// page cap before the cutoff, making `signatures` a lower bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerCount {
    pub signatures: u64,
    pub truncated: bool,
}

#[async_trait]
pub trait VolumeProvider: Send + Sync {
    /// Volumes for the tracked protocols the provider covers.
    /// Protocols missing from the map are not covered upstream.
    async fn protocol_volumes(&self) -> ProviderResult<BTreeMap<Protocol, ProtocolVolume>>;

    /// Top `limit` derivatives venues across all chains by 24h volume.
    async fn global_derivatives(&self, limit: usize) -> ProviderResult<Vec<GlobalDerivativesEntry>>;
}

#[async_trait]
pub trait DriftMarketProvider: Send + Sync {
    /// Perpetual markets keyed by symbol (e.g. `SOL-PERP`).
    async fn perp_markets(&self) -> ProviderResult<BTreeMap<String, DriftMarket>>;
}

#[async_trait]
pub trait AnalyticsProvider: Send + Sync {
    async fn traders(&self, protocol: Protocol, window: TimeWindow) -> ProviderResult<u64>;

    async fn liquidations(&self, window: TimeWindow) -> ProviderResult<LiquidationSummary>;

    async fn wallet_overlap(&self, window: TimeWindow) -> ProviderResult<WalletOverlap>;

    /// Jupiter Perps trade counts per market symbol.
    async fn market_trades(&self, window: TimeWindow) -> ProviderResult<BTreeMap<String, u64>>;

    /// Jupiter Perps realized P&L, at most `limit` winners and `limit` losers.
    async fn pnl_leaderboard(&self, window: TimeWindow, limit: usize) -> ProviderResult<PnlLeaderboard>;
}

#[async_trait]
pub trait LedgerProvider: Send + Sync {
    /// Successful signatures for `program_id` within the last `hours`.
    async fn signature_count(&self, program_id: &str, hours: u32) -> ProviderResult<LedgerCount>;
}

pub(crate) fn build_http_client(timeout_seconds: u64) -> ProviderResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .user_agent(concat!("solana-perps-dashboard/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProviderError::Transport(format!("Failed to create HTTP client: {}", e)))
}

/// Turn a non-success status into `ProviderError::Http`, keeping a short body excerpt.
pub(crate) async fn ensure_success(response: Response) -> ProviderResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(200).collect();
    Err(ProviderError::Http {
        status: status.as_u16(),
        body: excerpt,
    })
}
