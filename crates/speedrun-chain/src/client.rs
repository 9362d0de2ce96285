use std::pin::Pin;
use std::time::Duration;

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

/// The chain whose streaming transport is known to be unreliable; this id
/// is hard-coded regardless of configured URL scheme (spec.md §6).
pub const POLLING_ONLY_CHAIN_ID: u64 = 7000;

/// How long the construction-time head-subscription probe waits before the
/// client downgrades to polling-only (spec.md §4.1).
const SUBSCRIBE_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors the Chain Client surfaces explicitly in its return type, rather
/// than through string-matched exceptions (spec.md §9 REDESIGN FLAGS).
#[derive(Debug, Error)]
pub enum ChainClientError {
    #[error("requested log range exceeds the provider's limit")]
    RangeTooLarge,
    #[error("this chain client does not support push subscriptions")]
    SubscriptionsNotSupported,
    #[error(transparent)]
    Rpc(#[from] anyhow::Error),
}

impl ChainClientError {
    /// Best-effort classification of an opaque RPC error as "range too
    /// large", for providers that don't return a distinguishable error
    /// variant and only a message string.
    pub fn classify_rpc(err: anyhow::Error) -> Self {
        let msg = err.to_string().to_lowercase();
        if msg.contains("range too large")
            || msg.contains("block range")
            || msg.contains("too many results")
            || msg.contains("query returned more than")
            || msg.contains("response size exceeded")
            || msg.contains("payload too large")
            || msg.contains("limit exceeded")
        {
            ChainClientError::RangeTooLarge
        } else {
            ChainClientError::Rpc(err)
        }
    }

    /// Transient errors are retried locally by the caller (spec.md §7);
    /// this excludes range-too-large and subscriptions-not-supported, which
    /// callers branch on structurally instead.
    pub fn is_transient(&self) -> bool {
        match self {
            ChainClientError::Rpc(e) => {
                let msg = e.to_string().to_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("deadline")
                    || msg.contains("too many requests")
                    || msg.contains("rate limit")
                    || msg.contains("429")
                    || msg.contains("connection reset")
                    || msg.contains("connection closed")
                    || msg.contains("connection refused")
                    || msg.contains("broken pipe")
                    || msg.contains("502")
                    || msg.contains("503")
                    || msg.contains("504")
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    pub number: u64,
    pub timestamp: u64,
    pub hash: B256,
}

/// An inclusive `[from, to]` block range against a single contract and one
/// or more event topics, OR-matched at topic position 0 (spec.md §4.1
/// `FilterLogs`).
#[derive(Debug, Clone)]
pub struct LogFilterRange {
    pub from: u64,
    pub to: u64,
    pub address: Address,
    pub topics: Vec<B256>,
}

impl LogFilterRange {
    pub fn to_alloy_filter(&self) -> Filter {
        Filter::new()
            .address(self.address)
            .event_signature(self.topics.clone())
            .from_block(self.from)
            .to_block(self.to)
    }

    /// Split the range in halves; used when the provider rejects a range as
    /// too large (spec.md §4.1 "must be split in halves until each
    /// subrange succeeds").
    pub fn halved(&self) -> Option<(LogFilterRange, LogFilterRange)> {
        if self.from >= self.to {
            return None;
        }
        let mid = self.from + (self.to - self.from) / 2;
        Some((
            LogFilterRange {
                from: self.from,
                to: mid,
                address: self.address,
                topics: self.topics.clone(),
            },
            LogFilterRange {
                from: mid + 1,
                to: self.to,
                address: self.address,
                topics: self.topics.clone(),
            },
        ))
    }
}

pub type LogResultStream = Pin<Box<dyn Stream<Item = Result<Log, ChainClientError>> + Send>>;

/// A live push subscription. Dropping it tears down the background
/// forwarding task and the underlying provider subscription — Rust's RAII
/// stands in for the explicit "cancel" handle in spec.md §4.1.
pub struct LogSubscription {
    pub stream: LogResultStream,
}

pub type HeaderResultStream = Pin<Box<dyn Stream<Item = Result<BlockHeader, ChainClientError>> + Send>>;

/// A live head subscription (spec.md §4.1 `SubscribeNewHead`), used by the
/// live Subscriber's liveness checks independently of `SubscribeLogs`.
pub struct HeadSubscription {
    pub stream: HeaderResultStream,
}

/// Capability abstraction over an EVM JSON-RPC endpoint (spec.md §4.1).
///
/// One instance per configured chain. `supports_subscriptions` reflects a
/// decision made once at construction time, not a per-call probe.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    fn supports_subscriptions(&self) -> bool;

    async fn block_number(&self) -> Result<u64, ChainClientError>;

    async fn header_by_number(&self, number: u64) -> Result<BlockHeader, ChainClientError>;

    /// Finite, used by catchup. Callers are responsible for chunking to
    /// `block_interval`-sized ranges; this method is responsible for
    /// reporting `RangeTooLarge` when a single call exceeds what the
    /// provider accepts, so the caller can halve and retry.
    async fn filter_logs(&self, range: LogFilterRange) -> Result<Vec<Log>, ChainClientError>;

    /// Only valid when `supports_subscriptions()` is `true`; otherwise
    /// returns `ChainClientError::SubscriptionsNotSupported`.
    async fn subscribe_logs(
        &self,
        address: Address,
        topics: Vec<B256>,
    ) -> Result<LogSubscription, ChainClientError>;

    /// Push subscription over new block headers (spec.md §4.1
    /// `SubscribeNewHead`), used to drive a liveness signal independent of
    /// log traffic. Only valid when `supports_subscriptions()` is `true`;
    /// otherwise returns `ChainClientError::SubscriptionsNotSupported`.
    async fn subscribe_new_head(&self) -> Result<HeadSubscription, ChainClientError>;
}

/// EVM chain client backed by `alloy`. Chooses an HTTP (polling-only) or WS
/// (streaming-capable) transport at construction, per spec.md §4.1/§6:
/// `ws://`/`wss://` URLs are candidates for streaming; `http://`/`https://`
/// are always polling-only; the hard-coded [`POLLING_ONLY_CHAIN_ID`] is
/// always polling-only regardless of URL scheme.
pub struct EvmChainClient {
    chain_id: u64,
    provider: DynProvider,
    supports_subscriptions: bool,
}

impl EvmChainClient {
    pub async fn connect(chain_id: u64, rpc_url: &str) -> anyhow::Result<Self> {
        let is_ws = rpc_url.starts_with("ws://") || rpc_url.starts_with("wss://");
        let force_polling = chain_id == POLLING_ONLY_CHAIN_ID;

        if is_ws && !force_polling {
            match Self::try_connect_ws_with_probe(rpc_url).await {
                Ok(provider) => {
                    return Ok(Self {
                        chain_id,
                        provider,
                        supports_subscriptions: true,
                    });
                }
                Err(e) => {
                    warn!(chain_id, err = %e, "head-subscription probe failed, downgrading to polling");
                }
            }
        }

        let url = rpc_url.parse().map_err(|e| anyhow::anyhow!("invalid RPC URL {rpc_url}: {e}"))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self {
            chain_id,
            provider,
            supports_subscriptions: false,
        })
    }

    async fn try_connect_ws_with_probe(rpc_url: &str) -> anyhow::Result<DynProvider> {
        let ws = WsConnect::new(rpc_url);
        let provider = ProviderBuilder::new().connect_ws(ws).await?.erased();

        let probe = provider.subscribe_blocks().await?;
        let mut stream = probe.into_stream();
        timeout(SUBSCRIBE_PROBE_TIMEOUT, stream.next())
            .await
            .map_err(|_| anyhow::anyhow!("no header within {SUBSCRIBE_PROBE_TIMEOUT:?}"))?
            .ok_or_else(|| anyhow::anyhow!("head subscription closed during probe"))?;

        Ok(provider)
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn supports_subscriptions(&self) -> bool {
        self.supports_subscriptions
    }

    async fn block_number(&self) -> Result<u64, ChainClientError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChainClientError::classify_rpc(anyhow::Error::new(e)))
    }

    async fn header_by_number(&self, number: u64) -> Result<BlockHeader, ChainClientError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await
            .map_err(|e| ChainClientError::classify_rpc(anyhow::Error::new(e)))?
            .ok_or_else(|| ChainClientError::Rpc(anyhow::anyhow!("block {number} not found")))?;

        Ok(BlockHeader {
            number,
            timestamp: block.header.timestamp,
            hash: block.header.hash,
        })
    }

    async fn filter_logs(&self, range: LogFilterRange) -> Result<Vec<Log>, ChainClientError> {
        debug!(chain_id = self.chain_id, from = range.from, to = range.to, "eth_getLogs");
        self.provider
            .get_logs(&range.to_alloy_filter())
            .await
            .map_err(|e| ChainClientError::classify_rpc(anyhow::Error::new(e)))
    }

    async fn subscribe_logs(
        &self,
        address: Address,
        topics: Vec<B256>,
    ) -> Result<LogSubscription, ChainClientError> {
        if !self.supports_subscriptions {
            return Err(ChainClientError::SubscriptionsNotSupported);
        }

        let filter = Filter::new().address(address).event_signature(topics);
        let sub = self
            .provider
            .subscribe_logs(&filter)
            .await
            .map_err(|e| ChainClientError::classify_rpc(anyhow::Error::new(e)))?;

        let stream = sub.into_stream().map(Ok::<Log, ChainClientError>);
        Ok(LogSubscription {
            stream: Box::pin(stream),
        })
    }

    async fn subscribe_new_head(&self) -> Result<HeadSubscription, ChainClientError> {
        if !self.supports_subscriptions {
            return Err(ChainClientError::SubscriptionsNotSupported);
        }

        let sub = self
            .provider
            .subscribe_blocks()
            .await
            .map_err(|e| ChainClientError::classify_rpc(anyhow::Error::new(e)))?;

        let stream = sub.into_stream().map(|header| {
            Ok::<BlockHeader, ChainClientError>(BlockHeader {
                number: header.number,
                timestamp: header.timestamp,
                hash: header.hash,
            })
        });
        Ok(HeadSubscription {
            stream: Box::pin(stream),
        })
    }
}

/// Fetch logs for `range`, halving and retrying when the provider reports
/// the range as too large, until each half succeeds on its own (spec.md
/// §4.1, §8 "filter-range halving").
pub fn filter_logs_with_range_recovery<'a>(
    client: &'a dyn ChainClient,
    range: LogFilterRange,
) -> futures::future::BoxFuture<'a, Result<Vec<Log>, ChainClientError>> {
    Box::pin(async move {
        match client.filter_logs(range.clone()).await {
            Ok(logs) => Ok(logs),
            Err(ChainClientError::RangeTooLarge) => {
                let (lo, hi) = range.halved().ok_or(ChainClientError::RangeTooLarge)?;
                let mut logs = filter_logs_with_range_recovery(client, lo).await?;
                logs.extend(filter_logs_with_range_recovery(client, hi).await?);
                Ok(logs)
            }
            Err(e) => Err(e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn range(from: u64, to: u64) -> LogFilterRange {
        LogFilterRange {
            from,
            to,
            address: address!("0x0000000000000000000000000000000000000001"),
            topics: vec![B256::ZERO],
        }
    }

    #[test]
    fn halving_covers_the_whole_range_without_overlap() {
        let (lo, hi) = range(0, 10_000).halved().unwrap();
        assert_eq!(lo.from, 0);
        assert_eq!(hi.to, 10_000);
        assert_eq!(hi.from, lo.to + 1);
    }

    #[test]
    fn single_block_range_does_not_halve() {
        assert!(range(5, 5).halved().is_none());
    }

    #[test]
    fn polling_only_chain_id_is_hard_coded() {
        assert_eq!(POLLING_ONLY_CHAIN_ID, 7000);
    }
}
