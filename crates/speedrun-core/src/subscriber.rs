//! Per-chain live Subscriber (spec.md §4.5): stays idle until the startup
//! catchup barrier clears, then streams new logs, healing any gap with a
//! targeted catchup whenever the stream drops and is reconnected.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use futures::StreamExt;
use rand::Rng;
use speedrun_chain::{decode_logs, known_topics, ChainClient, ChainClientError};
use speedrun_storage::EventStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::apply::apply_decoded_event;
use crate::catchup::CatchupTarget;
use crate::supervisor::ChainHealthRegistry;
use crate::telemetry::Telemetry;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const LIVENESS_TICK_INTERVAL: Duration = Duration::from_secs(30);

pub struct SubscriberTarget {
    pub chain_id: u64,
    pub client: Arc<dyn ChainClient>,
    pub contract_address: Address,
    pub block_interval: u64,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub confirmations: u64,
    pub default_block: u64,
}

/// Doubles the previous delay and adds up to 50% jitter, so many chains
/// reconnecting after a shared outage don't all retry in lockstep.
fn next_backoff(previous: Duration) -> Duration {
    let doubled = (previous * 2).min(MAX_BACKOFF);
    let jitter_fraction: f64 = rand::thread_rng().gen_range(0.0..0.5);
    doubled.mul_f64(1.0 + jitter_fraction).min(MAX_BACKOFF)
}

/// Runs until `shutdown` fires. Returns `Ok(())` on a clean shutdown;
/// errors only propagate out for configuration problems the caller can't
/// recover from by reconnecting (there are none today — this always
/// returns `Ok(())`, reconnecting internally instead).
pub async fn run_subscriber(
    target: SubscriberTarget,
    store: EventStore,
    telemetry: Telemetry,
    health: ChainHealthRegistry,
    catchup_barrier: CancellationToken,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    tokio::select! {
        () = shutdown.cancelled() => return Ok(()),
        () = catchup_barrier.cancelled() => {}
    }

    let mut backoff = INITIAL_BACKOFF;

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        if let Err(e) = heal_gap(&target, &store, &telemetry, &health).await {
            warn!(chain_id = target.chain_id, err = %e, "targeted catchup before subscribe failed");
        }

        match target
            .client
            .subscribe_logs(target.contract_address, known_topics().to_vec())
            .await
        {
            Ok(mut sub) => {
                info!(chain_id = target.chain_id, "subscribed to live logs");
                backoff = INITIAL_BACKOFF;
                health.record_subscribed(target.chain_id);
                health.record_liveness_tick(target.chain_id);

                let mut liveness_ticker = tokio::time::interval(LIVENESS_TICK_INTERVAL);
                liveness_ticker.reset();

                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => return Ok(()),
                        _ = liveness_ticker.tick() => {
                            health.record_liveness_tick(target.chain_id);
                        }
                        next = sub.stream.next() => {
                            match next {
                                Some(Ok(log)) => {
                                    health.record_liveness_tick(target.chain_id);
                                    let events = decode_logs(std::slice::from_ref(&log), target.chain_id);
                                    telemetry.record_decoded(target.chain_id, events.len() as u64);
                                    for event in &events {
                                        if let Err(e) = apply_decoded_event(&store, &telemetry, &health, event).await {
                                            error!(chain_id = target.chain_id, err = %e, "failed to apply live event");
                                            health.record_processing_error(target.chain_id);
                                        }
                                    }
                                    if let Some(bn) = log.block_number {
                                        if let Err(e) = store.advance_last_processed_block(target.chain_id, bn).await {
                                            warn!(chain_id = target.chain_id, err = %e, "cursor advance failed");
                                        }
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!(chain_id = target.chain_id, err = %e, "live subscription error, reconnecting");
                                    break;
                                }
                                None => {
                                    warn!(chain_id = target.chain_id, "live subscription closed, reconnecting");
                                    break;
                                }
                            }
                        }
                    }
                }
                health.record_unsubscribed(target.chain_id);
            }
            Err(ChainClientError::SubscriptionsNotSupported) => {
                return Err(anyhow::anyhow!(
                    "chain {} client does not support subscriptions; use the polling subscriber instead",
                    target.chain_id
                ));
            }
            Err(e) => {
                warn!(chain_id = target.chain_id, err = %e, "subscribe_logs failed, retrying");
            }
        }

        telemetry.record_reconnect(target.chain_id);
        health.record_reconnect(target.chain_id);
        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = next_backoff(backoff);
    }
}

/// Re-scans from `last_processed_block - confirmations` up to current head
/// before every (re)subscribe attempt, covering whatever the dropped
/// connection might have missed near the confirmation boundary (spec.md
/// §4.5: "trigger a targeted catchup from last_processed_block - confirmations
/// to current head").
async fn heal_gap(
    target: &SubscriberTarget,
    store: &EventStore,
    telemetry: &Telemetry,
    health: &ChainHealthRegistry,
) -> anyhow::Result<()> {
    let cursor = store.cursor(target.chain_id).await?;
    let head = target.client.block_number().await?;

    let from = cursor
        .last_processed_block
        .saturating_sub(target.confirmations)
        .max(target.default_block);
    if from > head {
        return Ok(());
    }

    let catchup_target = CatchupTarget {
        chain_id: target.chain_id,
        client: target.client.clone(),
        contract_address: target.contract_address,
        block_interval: target.block_interval,
        max_retries: target.max_retries,
        retry_delay: target.retry_delay,
        confirmations: target.confirmations,
        default_block: target.default_block,
    };

    crate::catchup::catch_up_range(
        &catchup_target,
        store,
        telemetry,
        health,
        &known_topics(),
        from,
        head,
    )
    .await?;
    store
        .advance_last_processed_block(target.chain_id, head)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut d = INITIAL_BACKOFF;
        for _ in 0..20 {
            let next = next_backoff(d);
            assert!(next >= d, "backoff should not shrink");
            assert!(next <= MAX_BACKOFF, "backoff should respect the cap");
            d = next;
        }
        assert_eq!(d, MAX_BACKOFF.min(d));
    }

    #[test]
    fn backoff_applies_jitter_not_just_doubling() {
        let base = Duration::from_secs(1);
        let samples: Vec<_> = (0..10).map(|_| next_backoff(base)).collect();
        assert!(samples.iter().any(|s| *s != samples[0]), "jitter should vary across calls");
    }
}
