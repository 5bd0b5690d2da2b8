//! One refresh pass: aggregate, write the cache artifact, record history.
//!
//! Exits non-zero only when configuration cannot be loaded or the artifact
//! cannot be written. Provider failures end up as unavailable markers.

use chrono::Utc;
use perps_server::aggregator::{Aggregator, Providers};
use perps_server::cache::CacheStore;
use perps_server::config::AppConfig;
use perps_server::history::HistoryStore;
use perps_server::init_tracing;
use std::time::Instant;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("perps_server=info,perps_update_cache=info");

    let start = Instant::now();
    println!("================================================");
    println!("        PERPS CACHE REFRESH - {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
    println!("================================================");

    let config = AppConfig::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    if config.dune.api_key.is_empty() {
        println!("[CONFIG] Dune API Key: *** EMPTY - PLEASE SET PERPS__DUNE__API_KEY ***");
        tracing::warn!("Dune API key not set, analytics fields will be unavailable");
    }

    let cache = CacheStore::new(&config.cache.path);
    let history_store = HistoryStore::new(&config.cache.history_path);
    let history = history_store.load();
    tracing::info!(snapshots = %history.snapshots.len(), "Loaded history");

    let providers = Providers::from_config(&config)?;
    let aggregator = Aggregator::new(providers, &config.aggregator).with_history(history);

    let document = aggregator.run().await;

    cache
        .write(&document)
        .map_err(|e| anyhow::anyhow!("Failed to write cache {}: {}", cache.path().display(), e))?;
    println!("[CACHE] Written to {}", cache.path().display());

    // History is best effort once the cache itself is safe on disk
    match history_store.record(&document, document.generated_at) {
        Ok(true) => println!("[HISTORY] Snapshot recorded"),
        Ok(false) => println!("[HISTORY] Interval not reached, skipped"),
        Err(e) => tracing::error!(error = %e, "Failed to record history snapshot"),
    }

    let unavailable = document.unexpected_unavailable_fields();
    println!(
        "[DONE] {:.1}s, {} field(s) unavailable",
        start.elapsed().as_secs_f64(),
        unavailable.len()
    );
    for field in &unavailable {
        println!("  - {}", field);
    }

    Ok(())
}
