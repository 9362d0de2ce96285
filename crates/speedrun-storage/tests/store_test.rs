use alloy::primitives::{address, b256, B256, U256};
use chrono::{TimeZone, Utc};
use speedrun_storage::EventStore;
use speedrun_types::{Fulfillment, Intent, IntentStatus, Settlement};
use sqlx::PgPool;

fn sample_intent(id: B256) -> Intent {
    let now = Utc::now();
    Intent {
        id,
        source_chain: 1,
        destination_chain: 10,
        token: address!("0x0000000000000000000000000000000000000001"),
        recipient: address!("0x0000000000000000000000000000000000000002"),
        sender: address!("0x0000000000000000000000000000000000000003"),
        amount: U256::from(1_000_000u64),
        intent_fee: U256::from(100u64),
        status: IntentStatus::Pending,
        is_call: false,
        call_data: None,
        created_at: now,
        updated_at: now,
    }
}

#[sqlx::test]
async fn upsert_intent_is_idempotent(pool: PgPool) -> sqlx::Result<()> {
    let store = EventStore::from_pool(pool);
    store.migrate().await.unwrap();

    let id = b256!("0x0000000000000000000000000000000000000000000000000000000000000001");
    let intent = sample_intent(id);

    store.upsert_intent(&intent).await.unwrap();
    store.upsert_intent(&intent).await.unwrap();

    let status = store.intent_status(id).await.unwrap();
    assert_eq!(status, Some(IntentStatus::Pending));
    Ok(())
}

#[sqlx::test]
async fn status_never_regresses(pool: PgPool) -> sqlx::Result<()> {
    let store = EventStore::from_pool(pool);
    store.migrate().await.unwrap();

    let id = b256!("0x0000000000000000000000000000000000000000000000000000000000000002");
    store.upsert_intent(&sample_intent(id)).await.unwrap();

    let now = Utc::now();
    store
        .insert_settlement(&Settlement {
            id,
            asset: address!("0x0000000000000000000000000000000000000001"),
            amount: U256::from(1u64),
            receiver: address!("0x0000000000000000000000000000000000000002"),
            fulfilled: true,
            fulfiller: address!("0x0000000000000000000000000000000000000004"),
            actual_amount: U256::from(1u64),
            paid_tip: U256::ZERO,
            tx_hash: B256::repeat_byte(0x11),
            block_number: 50,
            is_call: false,
            call_data: None,
            created_at: now,
        })
        .await
        .unwrap();

    assert_eq!(store.intent_status(id).await.unwrap(), Some(IntentStatus::Settled));

    // A fulfillment observed after the settlement (e.g. a catchup replay
    // processing events out of their natural order) must not regress
    // status back to `fulfilled`.
    store
        .insert_fulfillment(&Fulfillment {
            id,
            asset: address!("0x0000000000000000000000000000000000000001"),
            amount: U256::from(1u64),
            receiver: address!("0x0000000000000000000000000000000000000002"),
            tx_hash: B256::repeat_byte(0x22),
            block_number: 40,
            is_call: false,
            call_data: None,
            created_at: now,
        })
        .await
        .unwrap();

    assert_eq!(store.intent_status(id).await.unwrap(), Some(IntentStatus::Settled));
    Ok(())
}

#[sqlx::test]
async fn late_fulfillment_creates_stub_ahead_of_initiated(pool: PgPool) -> sqlx::Result<()> {
    let store = EventStore::from_pool(pool);
    store.migrate().await.unwrap();

    let id = b256!("0x0000000000000000000000000000000000000000000000000000000000000003");
    let now = Utc::now();

    store
        .insert_fulfillment(&Fulfillment {
            id,
            asset: address!("0x0000000000000000000000000000000000000001"),
            amount: U256::from(5u64),
            receiver: address!("0x0000000000000000000000000000000000000002"),
            tx_hash: B256::repeat_byte(0x33),
            block_number: 10,
            is_call: false,
            call_data: None,
            created_at: now,
        })
        .await
        .unwrap();

    assert_eq!(store.intent_status(id).await.unwrap(), Some(IntentStatus::Fulfilled));

    let mut intent = sample_intent(id);
    intent.amount = U256::from(999u64);
    store.upsert_intent(&intent).await.unwrap();

    // Descriptive fields backfilled, status preserved at its already-advanced rank.
    assert_eq!(store.intent_status(id).await.unwrap(), Some(IntentStatus::Fulfilled));
    Ok(())
}

#[sqlx::test]
async fn late_initiated_backfills_created_at_away_from_the_stub_wall_clock(
    pool: PgPool,
) -> sqlx::Result<()> {
    let store = EventStore::from_pool(pool.clone());
    store.migrate().await.unwrap();

    let id = b256!("0x0000000000000000000000000000000000000000000000000000000000000006");

    store
        .insert_fulfillment(&Fulfillment {
            id,
            asset: address!("0x0000000000000000000000000000000000000001"),
            amount: U256::from(5u64),
            receiver: address!("0x0000000000000000000000000000000000000002"),
            tx_hash: B256::repeat_byte(0x44),
            block_number: 10,
            is_call: false,
            call_data: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let mut intent = sample_intent(id);
    let origin_timestamp = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
    intent.created_at = origin_timestamp;
    intent.updated_at = origin_timestamp;
    let created = store.upsert_intent(&intent).await.unwrap();
    assert!(created, "descriptive fields differ from the stub's zero values");

    let row_created_at: chrono::DateTime<Utc> =
        sqlx::query_scalar("select created_at from intents where id = $1")
            .bind(id.to_string())
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(row_created_at, origin_timestamp);
    Ok(())
}

#[sqlx::test]
async fn cursor_advances_only_forward(pool: PgPool) -> sqlx::Result<()> {
    let store = EventStore::from_pool(pool);
    store.migrate().await.unwrap();

    store.advance_last_processed_block(1, 100).await.unwrap();
    store.advance_last_processed_block(1, 50).await.unwrap();

    let cursor = store.cursor(1).await.unwrap();
    assert_eq!(cursor.last_processed_block, 100);

    store.advance_last_processed_block(1, 150).await.unwrap();
    let cursor = store.cursor(1).await.unwrap();
    assert_eq!(cursor.last_processed_block, 150);
    Ok(())
}
