use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{Duration, Utc};
use perps_core::{CacheDocument, Protocol, TimeWindow};
use std::time::Instant;

use super::dto::*;
use crate::cache::CacheState;
use crate::error::{AppError, AppResult, ProviderError};
use crate::history::RETENTION_HOURS;
use crate::AppState;

/// Read the artifact off the async runtime. Every request gets its own
/// snapshot; nothing is cached in the process.
async fn load_document(state: &AppState) -> AppResult<CacheDocument> {
    let store = state.cache.clone();
    let document = tokio::task::spawn_blocking(move || store.read())
        .await
        .map_err(|e| AppError::Internal(format!("cache read task failed: {}", e)))??;
    Ok(document)
}

pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let start = Instant::now();
    tracing::info!("Processing health check request");

    let store = state.cache.clone();
    let cache_state = tokio::task::spawn_blocking(move || store.read_or_degraded())
        .await
        .map_err(|e| AppError::Internal(format!("cache read task failed: {}", e)))?;

    let generated_at = match &cache_state {
        CacheState::Fresh(doc) => Some(doc.generated_at),
        CacheState::Missing | CacheState::Corrupt(_) => None,
    };

    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache: cache_state.label().to_string(),
        generated_at,
        cache_age_seconds: generated_at.map(|t| (Utc::now() - t).num_seconds()),
    };

    tracing::info!(
        duration_ms = %start.elapsed().as_millis(),
        cache = %response.cache,
        "Health check completed"
    );
    Ok(Json(response))
}

pub async fn get_snapshot(State(state): State<AppState>) -> AppResult<Json<CacheDocument>> {
    let document = load_document(&state).await?;
    tracing::info!(generated_at = %document.generated_at, "Serving full snapshot");
    Ok(Json(document))
}

pub async fn get_protocols(State(state): State<AppState>) -> AppResult<Json<ProtocolsResponse>> {
    let start = Instant::now();
    let document = load_document(&state).await?;
    let response = ProtocolsResponse::from_document(&document);

    tracing::info!(
        duration_ms = %start.elapsed().as_millis(),
        protocols = %response.protocols.len(),
        total_volume_24h = %response.totals.volume_24h,
        complete = %response.totals.complete,
        "Protocol summary served"
    );
    Ok(Json(response))
}

pub async fn get_window(
    State(state): State<AppState>,
    Path(window): Path<String>,
    Query(query): Query<WindowQuery>,
) -> AppResult<Json<WindowResponse>> {
    let window: TimeWindow = window
        .parse()
        .map_err(|e: perps_core::PerpsError| AppError::InvalidParam(e.to_string()))?;
    let protocol: Option<Protocol> = query
        .protocol
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(|e: perps_core::PerpsError| AppError::InvalidParam(e.to_string()))?;

    tracing::info!(window = %window, protocol = ?protocol, "Processing window request");

    let document = load_document(&state).await?;
    let metrics = document
        .window(window)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("window {} not in cache", window)))?;

    let mut traders = metrics.traders;
    if let Some(protocol) = protocol {
        traders.retain(|p, _| *p == protocol);
    }

    Ok(Json(WindowResponse {
        window,
        generated_at: document.generated_at,
        traders,
        liquidations: metrics.liquidations,
        wallet_overlap: metrics.wallet_overlap,
    }))
}

pub async fn get_drift_markets(
    State(state): State<AppState>,
    Query(query): Query<DriftMarketsQuery>,
) -> AppResult<Json<DriftMarketsResponse>> {
    tracing::info!(asset = ?query.asset, limit = ?query.limit, "Processing Drift markets request");
    if query.limit == Some(0) {
        return Err(AppError::InvalidParam("limit must be at least 1".to_string()));
    }
    let document = load_document(&state).await?;
    Ok(Json(DriftMarketsResponse::from_document(&document, &query)))
}

pub async fn get_jupiter_markets(
    State(state): State<AppState>,
    Query(query): Query<JupiterMarketsQuery>,
) -> AppResult<Json<JupiterMarketsResponse>> {
    tracing::info!(asset = ?query.asset, "Processing Jupiter markets request");
    let document = load_document(&state).await?;
    Ok(Json(JupiterMarketsResponse::from_document(&document, &query)))
}

pub async fn get_global(State(state): State<AppState>) -> AppResult<Json<GlobalResponse>> {
    let document = load_document(&state).await?;
    let response = GlobalResponse::from_document(&document);
    tracing::info!(solana_share_pct = ?response.solana_share_pct, "Global comparison served");
    Ok(Json(response))
}

pub async fn get_pnl_leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> AppResult<Json<LeaderboardResponse>> {
    tracing::info!(limit = ?query.limit, "Processing P&L leaderboard request");
    if query.limit == Some(0) {
        return Err(AppError::InvalidParam("limit must be at least 1".to_string()));
    }
    let document = load_document(&state).await?;
    Ok(Json(LeaderboardResponse::from_document(&document, &query)))
}

pub async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<HistoryResponse>> {
    let hours = query.hours.unwrap_or(DEFAULT_HISTORY_HOURS);
    if hours == 0 || i64::from(hours) > RETENTION_HOURS {
        return Err(AppError::InvalidParam(format!(
            "hours must be between 1 and {}",
            RETENTION_HOURS
        )));
    }

    let store = state.history.clone();
    let history = tokio::task::spawn_blocking(move || store.load())
        .await
        .map_err(|e| AppError::Internal(format!("history read task failed: {}", e)))?;

    let cutoff = Utc::now() - Duration::hours(i64::from(hours));
    let points: Vec<_> = history.since(cutoff).cloned().collect();
    tracing::info!(hours = %hours, points = %points.len(), "History served");

    Ok(Json(HistoryResponse { hours, points }))
}

/// Run one analytics query on demand and return its raw rows.
pub async fn debug_query(
    State(state): State<AppState>,
    Path(query_id): Path<u64>,
    Query(params): Query<DebugQueryParams>,
) -> AppResult<Json<DebugQueryResponse>> {
    let start = Instant::now();
    let hours = params.hours.unwrap_or(1);
    tracing::info!(query_id = %query_id, hours = %hours, "Running debug query");

    let rows = state
        .dune
        .run_query(query_id, hours)
        .await
        .map_err(|e| match e {
            ProviderError::Unavailable(msg) => AppError::InvalidParam(msg),
            other => AppError::ExternalApi(other.to_string()),
        })?;

    let duration_ms = start.elapsed().as_millis() as u64;
    tracing::info!(query_id = %query_id, rows = %rows.len(), duration_ms = %duration_ms, "Debug query finished");

    Ok(Json(DebugQueryResponse {
        query_id,
        hours,
        row_count: rows.len(),
        duration_ms,
        rows,
    }))
}
