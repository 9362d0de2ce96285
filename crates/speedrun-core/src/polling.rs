//! Polling Subscriber (spec.md §4.7): the same live-tailing job as
//! [`crate::subscriber`], but driven by a fixed-interval `FilterLogs` poll
//! instead of a push subscription. Used for [`speedrun_chain::POLLING_ONLY_CHAIN_ID`]
//! and any chain client whose `supports_subscriptions()` is `false`.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use speedrun_chain::{known_topics, ChainClient};
use speedrun_storage::EventStore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::catchup::CatchupTarget;
use crate::supervisor::ChainHealthRegistry;
use crate::telemetry::Telemetry;

pub struct PollingTarget {
    pub chain_id: u64,
    pub client: Arc<dyn ChainClient>,
    pub contract_address: Address,
    pub block_interval: u64,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub confirmations: u64,
    pub default_block: u64,
}

pub async fn run_polling_subscriber(
    target: PollingTarget,
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

    let mut ticker = tokio::time::interval(target.poll_interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

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
    let topics = known_topics();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let cursor = match store.cursor(target.chain_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(chain_id = target.chain_id, err = %e, "poll: cursor read failed");
                continue;
            }
        };

        let head = match target.client.block_number().await {
            Ok(h) => h,
            Err(e) => {
                warn!(chain_id = target.chain_id, err = %e, "poll: block_number failed");
                continue;
            }
        };

        let to = head.saturating_sub(target.confirmations);
        if cursor.last_processed_block >= to {
            health.record_successful_poll(target.chain_id);
            continue;
        }

        if let Err(e) = crate::catchup::catch_up_range(
            &catchup_target,
            &store,
            &telemetry,
            &health,
            &topics,
            cursor.last_processed_block.saturating_add(1),
            to,
        )
        .await
        {
            warn!(chain_id = target.chain_id, err = %e, "poll round failed");
            continue;
        }

        if let Err(e) = store.advance_last_processed_block(target.chain_id, to).await {
            warn!(chain_id = target.chain_id, err = %e, "poll: cursor advance failed");
        }
        health.record_successful_poll(target.chain_id);
    }
}
