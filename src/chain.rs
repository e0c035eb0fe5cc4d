//! # Chain Log Source
//!
//! The worker only needs two things from the chain: the ERC-20 `Transfer` logs
//! of a block range, and whether the endpoint is reachable at all.

use crate::error::FetchError;
use crate::settings::RpcSettings;
use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Filter, Log, H256};
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use url::Url;

#[async_trait]
pub trait TransferLogSource: Send + Sync {
    /// Transfer logs for `[from_block, to_block_inclusive]`, in no particular order.
    async fn fetch_transfer_logs(
        &self,
        from_block: u64,
        to_block_inclusive: u64,
    ) -> Result<Vec<Log>, FetchError>;

    async fn is_connected(&self) -> bool;
}

/// `eth_getLogs` over HTTP, filtered on the transfer topic.
#[derive(Debug, Clone)]
pub struct RpcLogSource {
    provider: Provider<Http>,
    transfer_topic: H256,
    max_retries: usize,
    retry_base_delay_ms: u64,
}

impl RpcLogSource {
    pub fn new(settings: &RpcSettings, transfer_topic: H256) -> Result<Self, FetchError> {
        let url = Url::parse(&settings.http_url)
            .map_err(|e| FetchError::Endpoint(format!("{}: {}", settings.http_url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()?;
        let provider = Provider::new(Http::new_with_client(url, client));
        Ok(Self {
            provider,
            transfer_topic,
            max_retries: settings.max_retries,
            retry_base_delay_ms: settings.retry_base_delay_ms,
        })
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        // delays of base, 2*base, 4*base ... capped at 30s
        ExponentialBackoff::from_millis(2)
            .factor((self.retry_base_delay_ms / 2).max(1))
            .max_delay(Duration::from_secs(30))
            .map(jitter)
            .take(self.max_retries)
    }
}

#[async_trait]
impl TransferLogSource for RpcLogSource {
    async fn fetch_transfer_logs(
        &self,
        from_block: u64,
        to_block_inclusive: u64,
    ) -> Result<Vec<Log>, FetchError> {
        let filter = Filter::new()
            .from_block(from_block)
            .to_block(to_block_inclusive)
            .topic0(self.transfer_topic);

        let mut attempt = 0u32;
        let logs = Retry::start(self.retry_strategy(), || {
            attempt += 1;
            let attempt = attempt;
            let filter = &filter;
            async move {
                self.provider.get_logs(filter).await.map_err(|e| {
                    log::warn!(
                        "eth_getLogs [{}, {}] attempt {} failed: {}",
                        from_block,
                        to_block_inclusive,
                        attempt,
                        e
                    );
                    e
                })
            }
        })
        .await?;
        Ok(logs)
    }

    async fn is_connected(&self) -> bool {
        match self.provider.get_block_number().await {
            Ok(block) => {
                log::info!("RPC endpoint reachable, head block {}", block);
                true
            }
            Err(e) => {
                log::error!("RPC endpoint unreachable: {}", e);
                false
            }
        }
    }
}
