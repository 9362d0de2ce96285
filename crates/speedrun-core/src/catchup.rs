//! Catchup Coordinator: the two-phase startup barrier and the periodic
//! catchup loop (spec.md §4.6).

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use anyhow::{Context, Result};
use futures::future::try_join_all;
use speedrun_chain::{decode_logs, filter_logs_with_range_recovery, ChainClient, LogFilterRange};
use speedrun_storage::EventStore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::apply::apply_decoded_event;
use crate::supervisor::ChainHealthRegistry;
use crate::telemetry::Telemetry;

/// Per-chain wiring the coordinator needs: its client, the contract it
/// watches, the chunk size to request per `FilterLogs` call, and the
/// per-chunk retry policy (spec.md §6 `MAX_RETRIES`/`RETRY_DELAY_S`).
#[derive(Clone)]
pub struct CatchupTarget {
    pub chain_id: u64,
    pub client: Arc<dyn ChainClient>,
    pub contract_address: Address,
    pub block_interval: u64,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Blocks held back from the chain head to avoid ingesting events that
    /// a reorg could still unwind (spec.md §6 `CONFIRMATIONS`).
    pub confirmations: u64,
    /// Floor for the very first catchup scan on a chain with no cursor yet
    /// (spec.md §6 `DEFAULT_BLOCK`).
    pub default_block: u64,
}

/// Fetch and apply every log matching `topics` in `[from, to]`, chunked to
/// `target.block_interval`-sized ranges, with range-too-large recovery
/// handled per chunk and up to `target.max_retries` attempts per chunk on
/// a transient failure (spec.md §4.6, §6 `MAX_RETRIES`/`RETRY_DELAY_S`).
pub(crate) async fn catch_up_range(
    target: &CatchupTarget,
    store: &EventStore,
    telemetry: &Telemetry,
    health: &ChainHealthRegistry,
    topics: &[B256],
    from: u64,
    to: u64,
) -> Result<()> {
    if from > to {
        return Ok(());
    }

    let mut start = from;
    while start <= to {
        let end = start
            .saturating_add(target.block_interval.max(1) - 1)
            .min(to);

        let range = LogFilterRange {
            from: start,
            to: end,
            address: target.contract_address,
            topics: topics.to_vec(),
        };

        let logs = fetch_chunk_with_retry(target, range).await.with_context(|| {
            format!(
                "filter_logs chain={} range=[{start},{end}]",
                target.chain_id
            )
        })?;

        let events = decode_logs(&logs, target.chain_id);
        telemetry.record_decoded(target.chain_id, events.len() as u64);
        for event in &events {
            if let Err(e) = apply_decoded_event(store, telemetry, health, event).await {
                health.record_processing_error(target.chain_id);
                return Err(e);
            }
        }

        start = end + 1;
    }

    Ok(())
}

/// One chunk's worth of `FilterLogs`, retried up to `target.max_retries`
/// times on a transient RPC error with `target.retry_delay` between
/// attempts. Range-too-large is handled underneath by
/// [`filter_logs_with_range_recovery`], which this wraps per half.
async fn fetch_chunk_with_retry(
    target: &CatchupTarget,
    range: LogFilterRange,
) -> Result<Vec<alloy::rpc::types::Log>, speedrun_chain::ChainClientError> {
    let mut attempt = 0u32;
    loop {
        match filter_logs_with_range_recovery(target.client.as_ref(), range.clone()).await {
            Ok(logs) => return Ok(logs),
            Err(e) if attempt < target.max_retries && e.is_transient() => {
                attempt += 1;
                warn!(
                    chain_id = target.chain_id,
                    attempt,
                    max_retries = target.max_retries,
                    err = %e,
                    "retrying filter_logs chunk after transient error"
                );
                sleep(target.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Periodic-catchup variant of [`catch_up_range`]: advances
/// `last_periodic_catchup_block` after *each* chunk, rather than once at
/// the end, so a run cancelled mid-way by [`CatchupCoordinator::run_periodic_loop`]'s
/// timeout leaves the cursor at the last chunk that actually completed
/// (spec.md §4.6 "the cursor only advances for chunks that completed").
async fn catch_up_range_advancing_periodic_cursor(
    target: &CatchupTarget,
    store: &EventStore,
    telemetry: &Telemetry,
    health: &ChainHealthRegistry,
    topics: &[B256],
    from: u64,
    to: u64,
) -> Result<()> {
    if from > to {
        return Ok(());
    }

    let mut start = from;
    while start <= to {
        let end = start
            .saturating_add(target.block_interval.max(1) - 1)
            .min(to);

        let range = LogFilterRange {
            from: start,
            to: end,
            address: target.contract_address,
            topics: topics.to_vec(),
        };

        let logs = fetch_chunk_with_retry(target, range).await.with_context(|| {
            format!(
                "filter_logs chain={} range=[{start},{end}]",
                target.chain_id
            )
        })?;

        let events = decode_logs(&logs, target.chain_id);
        telemetry.record_decoded(target.chain_id, events.len() as u64);
        for event in &events {
            if let Err(e) = apply_decoded_event(store, telemetry, health, event).await {
                health.record_processing_error(target.chain_id);
                return Err(e);
            }
        }

        store.advance_last_periodic_catchup_block(target.chain_id, end).await?;
        start = end + 1;
    }

    Ok(())
}

/// Drives the startup barrier and the periodic re-scan.
pub struct CatchupCoordinator {
    targets: Vec<CatchupTarget>,
    store: EventStore,
    telemetry: Telemetry,
    health: ChainHealthRegistry,
}

impl CatchupCoordinator {
    pub fn new(
        targets: Vec<CatchupTarget>,
        store: EventStore,
        telemetry: Telemetry,
        health: ChainHealthRegistry,
    ) -> Self {
        Self {
            targets,
            store,
            telemetry,
            health,
        }
    }

    /// Phase A (`Initiated` for every chain) must finish before phase B
    /// (`Fulfilled`/`Settled` for every chain) begins, so an intent's
    /// closing events are never processed ahead of its opening one during
    /// the initial scan (spec.md §4.6).
    pub async fn run_startup_barrier(&self) -> Result<()> {
        let initiated = speedrun_chain::initiated_topics();
        info!(chains = self.targets.len(), "catchup phase A: Initiated");
        try_join_all(self.targets.iter().map(|t| self.catch_up_one(t, &initiated))).await?;

        let fulfilled_settled = speedrun_chain::fulfilled_settled_topics();
        info!("catchup phase B: Fulfilled/Settled");
        try_join_all(
            self.targets
                .iter()
                .map(|t| self.catch_up_one(t, &fulfilled_settled)),
        )
        .await?;

        Ok(())
    }

    async fn catch_up_one(&self, target: &CatchupTarget, topics: &[B256]) -> Result<()> {
        let cursor = self.store.cursor(target.chain_id).await?;
        let head = target
            .client
            .block_number()
            .await
            .with_context(|| format!("block_number chain={}", target.chain_id))?;

        let from = cursor.last_processed_block.max(target.default_block);
        let to = head.saturating_sub(target.confirmations);
        if from > to {
            return Ok(());
        }

        catch_up_range(target, &self.store, &self.telemetry, &self.health, topics, from, to).await?;
        self.store
            .advance_last_processed_block(target.chain_id, to)
            .await?;
        Ok(())
    }

    /// Periodically re-scans a trailing window of recent blocks for every
    /// chain, healing any gap a live subscriber's reconnect window might
    /// have missed (spec.md §4.6 periodic catchup). Each chain's scan is
    /// bounded by `timeout`; a scan that runs past it is cancelled and
    /// picked up again on the next tick, with the cursor left wherever the
    /// last completed chunk advanced it to (spec.md §4.6 `PERIODIC_CATCHUP_TIMEOUT_MINUTES`).
    pub async fn run_periodic_loop(
        &self,
        interval: Duration,
        timeout: Duration,
        lookback_blocks: u64,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = sleep(interval) => {}
            }

            for target in &self.targets {
                if shutdown.is_cancelled() {
                    return;
                }

                let head = match target.client.block_number().await {
                    Ok(h) => h,
                    Err(e) => {
                        warn!(chain_id = target.chain_id, err = %e, "periodic catchup: block_number failed");
                        continue;
                    }
                };

                let cursor = match self.store.cursor(target.chain_id).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(chain_id = target.chain_id, err = %e, "periodic catchup: cursor read failed");
                        continue;
                    }
                };

                let from = cursor
                    .last_periodic_catchup_block
                    .max(head.saturating_sub(lookback_blocks));
                let to = head.saturating_sub(target.confirmations);
                if from > to {
                    continue;
                }

                let scan = catch_up_range_advancing_periodic_cursor(
                    target,
                    &self.store,
                    &self.telemetry,
                    &self.health,
                    &all_topics(),
                    from,
                    to,
                );

                match tokio::time::timeout(timeout, scan).await {
                    Ok(Ok(())) => self.telemetry.record_catchup_round(target.chain_id),
                    Ok(Err(e)) => {
                        warn!(chain_id = target.chain_id, err = %e, "periodic catchup round failed");
                    }
                    Err(_) => {
                        warn!(chain_id = target.chain_id, ?timeout, "periodic catchup round exceeded its deadline, resuming next tick");
                    }
                }
            }
        }
    }
}

fn all_topics() -> Vec<B256> {
    speedrun_chain::known_topics().to_vec()
}
