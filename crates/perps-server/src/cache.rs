//! Single-file snapshot store shared by the refresh job and the dashboard.

use perps_core::CacheDocument;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::CacheError;

/// What the dashboard got when it looked at the artifact.
#[derive(Debug, Clone)]
pub enum CacheState {
    Fresh(Arc<CacheDocument>),
    Missing,
    Corrupt(String),
}

impl CacheState {
    pub fn label(&self) -> &'static str {
        match self {
            CacheState::Fresh(_) => "fresh",
            CacheState::Missing => "missing",
            CacheState::Corrupt(_) => "corrupt",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize and atomically replace the artifact.
    pub fn write(&self, document: &CacheDocument) -> Result<(), CacheError> {
        write_json_atomic(&self.path, document)?;
        tracing::info!(path = %self.path.display(), generated_at = %document.generated_at, "Cache written");
        Ok(())
    }

    pub fn read(&self) -> Result<CacheDocument, CacheError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CacheError::Missing(self.path.clone()))
            }
            Err(e) => return Err(CacheError::Io(e)),
        };

        let document: CacheDocument =
            serde_json::from_slice(&bytes).map_err(|e| CacheError::Corrupt(e.to_string()))?;

        if document.schema_version != CacheDocument::SCHEMA_VERSION {
            return Err(CacheError::Corrupt(format!(
                "unsupported schema version {} (expected {})",
                document.schema_version,
                CacheDocument::SCHEMA_VERSION
            )));
        }
        Ok(document)
    }

    /// Read for display: never fails, degrades to `Missing` / `Corrupt`.
    pub fn read_or_degraded(&self) -> CacheState {
        match self.read() {
            Ok(document) => CacheState::Fresh(Arc::new(document)),
            Err(CacheError::Missing(_)) => CacheState::Missing,
            Err(CacheError::Corrupt(msg)) => {
                tracing::warn!(path = %self.path.display(), error = %msg, "Cache artifact is corrupt");
                CacheState::Corrupt(msg)
            }
            Err(CacheError::Io(e)) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Cache artifact unreadable");
                CacheState::Corrupt(e.to_string())
            }
        }
    }
}

/// Write to `<path>.tmp`, sync, then rename over `path` so readers never
/// observe a partial file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CacheError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| CacheError::Io(std::io::Error::new(ErrorKind::InvalidData, e)))?;

    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use perps_core::{
        DriftMarket, LiquidationSummary, Metric, Protocol, TimeWindow, TimeWindowMetrics,
        UnavailableReason, WalletOverlap,
    };
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn sample_document() -> CacheDocument {
        let mut time_windows = BTreeMap::new();
        for window in TimeWindow::ALL {
            time_windows.insert(
                window,
                TimeWindowMetrics {
                    traders: Protocol::ALL
                        .into_iter()
                        .map(|p| (p, Metric::available(u64::from(window.hours()) * 10)))
                        .collect(),
                    liquidations: if window.hours() > 8 {
                        Metric::unavailable_with(UnavailableReason::Timeout, "query 42 exceeded 300s")
                    } else {
                        Metric::available(LiquidationSummary { count: 3, txns: 2, aggregated_from: None })
                    },
                    wallet_overlap: Metric::available(WalletOverlap {
                        multi_platform: 1,
                        drift_only: 0,
                        jupiter_only: 9,
                    }),
                },
            );
        }

        let mut drift = BTreeMap::new();
        drift.insert(
            "SOL-PERP".to_string(),
            DriftMarket {
                symbol: "SOL-PERP".to_string(),
                volume_24h: dec!(125000000.50),
                funding_rate: dec!(-0.0000125),
                open_interest: dec!(2500000),
                last_price: dec!(150.25),
                index_price: dec!(150.2),
            },
        );

        CacheDocument {
            schema_version: CacheDocument::SCHEMA_VERSION,
            generated_at: Utc.with_ymd_and_hms(2026, 1, 8, 12, 15, 0).unwrap(),
            time_windows,
            protocols: vec![],
            drift_markets: Metric::available(drift),
            jupiter_markets: Metric::unavailable(UnavailableReason::NotSupported),
            global_derivatives: Metric::available(vec![]),
            total_open_interest: Metric::available(dec!(375625000.00)),
            pnl_leaderboard: Metric::unavailable(UnavailableReason::Timeout),
        }
    }

    #[test]
    fn test_never_written_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache.json"));
        assert!(matches!(store.read(), Err(CacheError::Missing(_))));
        assert!(matches!(store.read_or_degraded(), CacheState::Missing));
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("data").join("cache.json"));
        let doc = sample_document();

        store.write(&doc).unwrap();
        assert_eq!(store.read().unwrap(), doc);
        assert!(!dir.path().join("data").join("cache.json.tmp").exists());
    }

    #[test]
    fn test_same_document_writes_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache.json"));
        let doc = sample_document();

        store.write(&doc).unwrap();
        let first = fs::read(store.path()).unwrap();
        store.write(&doc).unwrap();
        let second = fs::read(store.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, b"{\"protocols\": [").unwrap();

        let store = CacheStore::new(&path);
        assert!(matches!(store.read(), Err(CacheError::Corrupt(_))));
        assert_eq!(store.read_or_degraded().label(), "corrupt");
    }

    #[test]
    fn test_unknown_schema_version_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache.json"));
        let mut doc = sample_document();
        doc.schema_version = 99;
        write_json_atomic(store.path(), &doc).unwrap();

        match store.read() {
            Err(CacheError::Corrupt(msg)) => assert!(msg.contains("99")),
            other => panic!("expected corrupt cache, got {:?}", other),
        }
    }
}
