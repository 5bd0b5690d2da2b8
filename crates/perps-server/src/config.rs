use config::{Config, ConfigError, Environment, File};
use perps_core::Protocol;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub defillama: DefiLlamaConfig,
    pub drift: DriftConfig,
    pub rpc: RpcConfig,
    pub dune: DuneConfig,
    pub aggregator: AggregatorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub history_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DefiLlamaConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriftConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
    /// Markets to keep, e.g. ["SOL-PERP", "BTC-PERP"]. Empty keeps every perp market.
    #[serde(default)]
    pub markets: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    pub url: String,
    pub timeout_seconds: u64,
    pub page_size: u32,
    pub max_pages: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DuneConfig {
    pub api_key: String,
    pub base_url: String,
    pub poll_interval_secs: u64,
    pub query_timeout_secs: u64,
    #[serde(default)]
    pub queries: DuneQueries,
}

/// Saved Dune query ids. A missing id makes that metric `not_supported`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DuneQueries {
    #[serde(default)]
    pub traders: TraderQueries,
    #[serde(default)]
    pub liquidations: Option<u64>,
    #[serde(default)]
    pub wallet_overlap: Option<u64>,
    #[serde(default)]
    pub jupiter_markets: Option<u64>,
    /// Per-wallet realized P&L for Jupiter Perps
    #[serde(default)]
    pub jupiter_pnl: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TraderQueries {
    #[serde(default)]
    pub drift: Option<u64>,
    #[serde(default)]
    pub jupiter_perps: Option<u64>,
    #[serde(default)]
    pub flashtrade: Option<u64>,
    #[serde(default)]
    pub adrena: Option<u64>,
}

impl TraderQueries {
    pub fn for_protocol(&self, protocol: Protocol) -> Option<u64> {
        match protocol {
            Protocol::Drift => self.drift,
            Protocol::JupiterPerps => self.jupiter_perps,
            Protocol::FlashTrade => self.flashtrade,
            Protocol::Adrena => self.adrena,
        }
    }
}

/// Room after the Dune query deadline for the cancel and results requests.
pub const DUNE_CALL_SLACK_SECS: u64 = 60;

#[derive(Debug, Deserialize, Clone)]
pub struct AggregatorConfig {
    /// Upper bound for any single provider call, including Dune polling
    pub call_timeout_secs: u64,
    /// Length of the global derivatives comparison list
    pub global_top_n: usize,
    /// Window sampled for the Jupiter per-market trade breakdown
    pub jupiter_sample_window: String,
    /// Analytics queries allowed in flight at once
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,
    /// Winners and losers kept in the P&L leaderboard
    #[serde(default = "default_pnl_leaderboard_limit")]
    pub pnl_leaderboard_limit: usize,
}

fn default_max_concurrent_queries() -> usize {
    4
}

fn default_pnl_leaderboard_limit() -> usize {
    50
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 360,
            global_top_n: 15,
            jupiter_sample_window: "1h".to_string(),
            max_concurrent_queries: default_max_concurrent_queries(),
            pnl_leaderboard_limit: default_pnl_leaderboard_limit(),
        }
    }
}

impl AggregatorConfig {
    /// Raise `call_timeout_secs` so a Dune query can reach its own deadline
    /// and still send its cancel. Returns true when the value was changed.
    pub fn reconcile_with_dune(&mut self, dune: &DuneConfig) -> bool {
        let floor = dune.query_timeout_secs.saturating_add(DUNE_CALL_SLACK_SECS);
        if self.call_timeout_secs >= floor {
            return false;
        }
        tracing::warn!(
            call_timeout_secs = %self.call_timeout_secs,
            dune_query_timeout_secs = %dune.query_timeout_secs,
            raised_to = %floor,
            "aggregator.call_timeout_secs is shorter than the Dune query deadline, raising it"
        );
        self.call_timeout_secs = floor;
        true
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8501)?
            .set_default("cache.path", "data/cache.json")?
            .set_default("cache.history_path", "data/history.json")?
            .set_default("defillama.base_url", "https://api.llama.fi")?
            .set_default("defillama.timeout_seconds", 30)?
            .set_default("drift.base_url", "https://data.api.drift.trade")?
            .set_default("drift.timeout_seconds", 30)?
            .set_default("rpc.url", "https://api.mainnet-beta.solana.com")?
            .set_default("rpc.timeout_seconds", 30)?
            .set_default("rpc.page_size", 1000)?
            .set_default("rpc.max_pages", 20)?
            .set_default("dune.api_key", "")?
            .set_default("dune.base_url", "https://api.dune.com/api/v1")?
            .set_default("dune.poll_interval_secs", 5)?
            .set_default("dune.query_timeout_secs", 300)?
            .set_default("aggregator.call_timeout_secs", 360)?
            .set_default("aggregator.global_top_n", 15)?
            .set_default("aggregator.jupiter_sample_window", "1h")?
            .set_default("aggregator.max_concurrent_queries", 4)?
            .set_default("aggregator.pnl_leaderboard_limit", 50)?
            // Load from config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (PERPS__DUNE__API_KEY, etc.)
            // Double underscore separates nested keys that contain underscores
            .add_source(
                Environment::with_prefix("PERPS")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("drift.markets")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: AppConfig = config.try_deserialize()?;
        if config.aggregator.max_concurrent_queries == 0 {
            return Err(ConfigError::Message(
                "aggregator.max_concurrent_queries must be at least 1".to_string(),
            ));
        }
        config.aggregator.reconcile_with_dune(&config.dune);
        Ok(config)
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
