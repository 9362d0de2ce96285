//! Bridges a decoded chain event to the Event Store's idempotent writes
//! (spec.md §4.2 -> §4.3).

use chrono::{TimeZone, Utc};
use speedrun_storage::EventStore;
use speedrun_types::{DecodedEvent, DecodedFields, Fulfillment, Intent, IntentStatus, Settlement};
use tracing::debug;

use crate::supervisor::ChainHealthRegistry;
use crate::telemetry::Telemetry;

/// Applies `event` to the store and records the outcome on both
/// `telemetry` (the `opentelemetry` export counters) and `health` (the
/// Supervisor's per-chain snapshot, spec.md §4.8): a call that changed no
/// row — a duplicate observation — counts as skipped, not processed, so
/// spec.md §8's duplicate-flood scenario (`events_skipped >= 99`) is
/// observable end to end.
pub async fn apply_decoded_event(
    store: &EventStore,
    telemetry: &Telemetry,
    health: &ChainHealthRegistry,
    event: &DecodedEvent,
) -> anyhow::Result<()> {
    let block_time = Utc
        .timestamp_opt(event.block_timestamp as i64, 0)
        .single()
        .unwrap_or_else(Utc::now);

    let created = match &event.fields {
        DecodedFields::Initiated(f) => {
            let intent = Intent {
                id: event.intent_id,
                source_chain: event.chain_id,
                destination_chain: f.destination_chain,
                token: f.token,
                recipient: f.recipient,
                sender: f.sender,
                amount: f.amount,
                intent_fee: f.intent_fee,
                status: IntentStatus::Pending,
                is_call: event.is_call,
                call_data: event.call_data.clone(),
                created_at: block_time,
                updated_at: block_time,
            };
            store.upsert_intent(&intent).await?
        }
        DecodedFields::Fulfilled(f) => {
            let fulfillment = Fulfillment {
                id: event.intent_id,
                asset: f.asset,
                amount: f.amount,
                receiver: f.receiver,
                tx_hash: event.tx_hash,
                block_number: event.block_number,
                is_call: event.is_call,
                call_data: event.call_data.clone(),
                created_at: block_time,
            };
            store.insert_fulfillment(&fulfillment).await?
        }
        DecodedFields::Settled(f) => {
            let settlement = Settlement {
                id: event.intent_id,
                asset: f.asset,
                amount: f.amount,
                receiver: f.receiver,
                fulfilled: f.fulfilled,
                fulfiller: f.fulfiller,
                actual_amount: f.actual_amount,
                paid_tip: f.paid_tip,
                tx_hash: event.tx_hash,
                block_number: event.block_number,
                is_call: event.is_call,
                call_data: event.call_data.clone(),
                created_at: block_time,
            };
            store.insert_settlement(&settlement).await?
        }
    };

    debug!(chain_id = event.chain_id, kind = event.kind.as_str(), intent_id = %event.intent_id, created, "applied event");

    if created {
        telemetry.record_applied(event.chain_id);
        health.record_event_processed(event.chain_id);
    } else {
        telemetry.record_ignored(event.chain_id);
        health.record_event_skipped(event.chain_id);
    }

    Ok(())
}
