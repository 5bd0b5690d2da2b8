//! Solana perps dashboard server.
//!
//! Two binaries share this library: `perps-update-cache` runs one
//! aggregation pass and writes the cache artifact, and `perps-dashboard`
//! serves read-only views of that artifact over HTTP.

pub mod aggregator;
pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod history;
pub mod providers;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::CacheStore;
use crate::history::HistoryStore;
use crate::providers::DuneClient;

pub use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct AppState {
    pub cache: CacheStore,
    pub history: HistoryStore,
    /// Used only by the debug query route
    pub dune: DuneClient,
}

/// Install the fmt subscriber. `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        )
        .init();
}
