use std::net::SocketAddr;

use axum::Router;
use perps_server::cache::{CacheState, CacheStore};
use perps_server::config::AppConfig;
use perps_server::history::HistoryStore;
use perps_server::providers::DuneClient;
use perps_server::{api, init_tracing, AppState};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("perps_server=info,perps_dashboard=info,tower_http=debug");

    println!("================================================");
    println!("      SOLANA PERPS DASHBOARD - Starting Up      ");
    println!("================================================");

    let config = AppConfig::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    println!("[CONFIG] Server: {}:{}", config.server.host, config.server.port);
    println!("[CONFIG] Cache: {}", config.cache.path.display());
    println!("[CONFIG] History: {}", config.cache.history_path.display());

    let cache = CacheStore::new(&config.cache.path);
    match cache.read_or_degraded() {
        CacheState::Fresh(doc) => {
            println!("[CACHE] Snapshot from {}", doc.generated_at);
            tracing::info!(generated_at = %doc.generated_at, "Cache artifact found");
        }
        CacheState::Missing => {
            println!("[CACHE] WARNING: no cache yet - run perps-update-cache");
            tracing::warn!("Cache artifact missing, views will return 503 until the first refresh");
        }
        CacheState::Corrupt(msg) => {
            println!("[CACHE] WARNING: cache unreadable - {}", msg);
            tracing::warn!(error = %msg, "Cache artifact corrupt");
        }
    }

    let state = AppState {
        cache,
        history: HistoryStore::new(&config.cache.history_path),
        dune: DuneClient::new(&config.dune)?,
    };

    let app = Router::new()
        .merge(api::create_router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    println!("[ROUTER] Routes configured: /health, /api/v1/{{snapshot,protocols,windows,markets,global,leaderboard,history}}");

    let addr: SocketAddr = config.server_addr().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    println!("================================================");
    println!("  Dashboard listening on http://{}", addr);
    println!("================================================");
    println!();

    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
