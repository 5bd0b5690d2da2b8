use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use super::{build_http_client, ensure_success, LedgerCount, LedgerProvider};
use crate::config::RpcConfig;
use crate::error::{ProviderError, ProviderResult};

const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(2);
const MAX_RATE_LIMIT_RETRIES: u32 = 3;
const PAGE_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// Solana RPC Client - signature counts per program
// ============================================================================

#[derive(Clone)]
pub struct SolanaRpcClient {
    client: Client,
    url: String,
    page_size: u32,
    max_pages: u32,
    rate_limit_backoff: Duration,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Vec<SignatureInfo>>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SignatureInfo {
    pub signature: String,
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub err: Option<Value>,
}

/// Outcome of counting one page of signatures (newest first).
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PageCount {
    pub successful: u64,
    pub reached_cutoff: bool,
    pub last_signature: Option<String>,
}

pub(crate) fn count_page(page: &[SignatureInfo], cutoff: i64) -> PageCount {
    let mut successful = 0;
    for info in page {
        if matches!(info.block_time, Some(t) if t < cutoff) {
            return PageCount {
                successful,
                reached_cutoff: true,
                last_signature: None,
            };
        }
        if info.err.is_none() {
            successful += 1;
        }
    }
    PageCount {
        successful,
        reached_cutoff: false,
        last_signature: page.last().map(|s| s.signature.clone()),
    }
}

impl SolanaRpcClient {
    pub fn new(config: &RpcConfig) -> ProviderResult<Self> {
        tracing::debug!(page_size = %config.page_size, max_pages = %config.max_pages, "Creating Solana RPC client");
        Ok(Self {
            client: build_http_client(config.timeout_seconds)?,
            url: config.url.clone(),
            page_size: config.page_size.clamp(1, 1000),
            max_pages: config.max_pages.max(1),
            rate_limit_backoff: RATE_LIMIT_BACKOFF,
        })
    }

    async fn signatures_page(
        &self,
        program_id: &str,
        before: Option<&str>,
    ) -> ProviderResult<Vec<SignatureInfo>> {
        let mut options = json!({ "limit": self.page_size });
        if let Some(before) = before {
            options["before"] = json!(before);
        }
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getSignaturesForAddress",
            "params": [program_id, options],
        });

        let mut attempt = 0;
        let response = loop {
            let response = self.client.post(&self.url).json(&payload).send().await?;
            if response.status() == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RATE_LIMIT_RETRIES {
                attempt += 1;
                tracing::warn!(attempt = %attempt, "RPC rate limited, backing off");
                tokio::time::sleep(self.rate_limit_backoff).await;
                continue;
            }
            break ensure_success(response).await?;
        };

        let body: RpcResponse = response.json().await?;
        if let Some(error) = body.error {
            return Err(ProviderError::QueryFailed(format!("RPC error: {}", error)));
        }
        body.result
            .ok_or_else(|| ProviderError::Malformed("RPC response has no result".to_string()))
    }
}

#[async_trait]
impl LedgerProvider for SolanaRpcClient {
    async fn signature_count(&self, program_id: &str, hours: u32) -> ProviderResult<LedgerCount> {
        let start = Instant::now();
        let cutoff = chrono::Utc::now().timestamp() - i64::from(hours) * 3600;

        let mut total = 0;
        let mut before: Option<String> = None;
        let mut pages = 0;
        let mut exhausted = false;

        while pages < self.max_pages {
            let page = self.signatures_page(program_id, before.as_deref()).await?;
            pages += 1;
            if page.is_empty() {
                exhausted = true;
                break;
            }

            let counted = count_page(&page, cutoff);
            total += counted.successful;
            if counted.reached_cutoff || (page.len() as u32) < self.page_size {
                exhausted = true;
                break;
            }
            before = counted.last_signature;

            tokio::time::sleep(PAGE_DELAY).await;
        }

        // Stopped by the page cap rather than the cutoff: a lower bound
        let truncated = !exhausted;
        if truncated {
            tracing::warn!(
                program_id = %program_id,
                max_pages = %self.max_pages,
                "Signature paging hit max_pages before the cutoff"
            );
        }
        tracing::info!(
            program_id = %program_id,
            hours = %hours,
            signatures = %total,
            pages = %pages,
            truncated = %truncated,
            duration_ms = %start.elapsed().as_millis(),
            "Counted program signatures"
        );
        Ok(LedgerCount {
            signatures: total,
            truncated,
        })
    }
}
