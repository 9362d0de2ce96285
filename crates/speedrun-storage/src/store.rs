use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgPool, Postgres};
use speedrun_types::{decide, ChainCursor, EventKind, Fulfillment, Intent, IntentStatus, Settlement, Transition};

use crate::migrations;

#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let opts = PgConnectOptions::from_str(database_url)
            .context("parse DATABASE_URL")?
            .log_statements(tracing::log::LevelFilter::Trace)
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_millis(200));

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
            .context("connect to database")?;

        Ok(Self { pool })
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        migrations::migrate(&self.pool).await
    }

    /// Insert a freshly observed `Initiated` intent, or reconcile an
    /// existing row's descriptive fields (spec.md §4.3 `UpsertIntent`).
    /// Returns whether this call changed the row: `false` means the row
    /// already held these exact values (spec.md §4.3 `created bool`).
    ///
    /// Deliberately never touches `status`: a late `Fulfilled`/`Settled`
    /// observation may have already created this row ahead of its
    /// `Initiated` event (spec.md §4.4 footnote 1), and this call must not
    /// regress that status back to `pending`. `created_at` is backfilled
    /// from `excluded` on every conflict: the only row this can conflict
    /// with is that late-intent stub, whose `created_at` is the wall clock
    /// at stub-creation time, not the intent's real origin timestamp
    /// (spec.md §3 "created_at ... never wall clock when the event is the
    /// origin").
    pub async fn upsert_intent(&self, intent: &Intent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            insert into intents (
                id, source_chain, destination_chain, token, recipient, sender,
                amount, intent_fee, status, is_call, call_data, created_at, updated_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            on conflict (id) do update set
                source_chain = excluded.source_chain,
                destination_chain = excluded.destination_chain,
                token = excluded.token,
                recipient = excluded.recipient,
                sender = excluded.sender,
                amount = excluded.amount,
                intent_fee = excluded.intent_fee,
                is_call = excluded.is_call,
                call_data = excluded.call_data,
                created_at = excluded.created_at,
                updated_at = now()
            where
                intents.source_chain is distinct from excluded.source_chain
                or intents.destination_chain is distinct from excluded.destination_chain
                or intents.token is distinct from excluded.token
                or intents.recipient is distinct from excluded.recipient
                or intents.sender is distinct from excluded.sender
                or intents.amount is distinct from excluded.amount
                or intents.intent_fee is distinct from excluded.intent_fee
                or intents.is_call is distinct from excluded.is_call
                or intents.call_data is distinct from excluded.call_data
            "#,
        )
        .bind(hex_id(intent.id))
        .bind(i64::try_from(intent.source_chain).context("source_chain out of range")?)
        .bind(i64::try_from(intent.destination_chain).context("destination_chain out of range")?)
        .bind(intent.token.to_string())
        .bind(intent.recipient.to_string())
        .bind(intent.sender.to_string())
        .bind(intent.amount.to_string())
        .bind(intent.intent_fee.to_string())
        .bind(intent.status.as_str())
        .bind(intent.is_call)
        .bind(intent.call_data.as_deref())
        .bind(intent.created_at)
        .execute(&self.pool)
        .await
        .context("upsert intents")?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a destination-chain fulfillment and advance the intent to
    /// `fulfilled`. Re-observations of the same fulfillment are no-ops
    /// (spec.md §3 Lifecycles); a fulfillment observed before its intent's
    /// `Initiated` event creates a placeholder row (spec.md §4.4 footnote 1).
    /// Returns whether the fulfillment row was newly inserted (spec.md §4.3
    /// `created bool`); `false` means this fulfillment was already recorded.
    pub async fn insert_fulfillment(&self, fulfillment: &Fulfillment) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("begin fulfillment tx")?;

        ensure_intent_stub(&mut tx, fulfillment.id, IntentStatus::Fulfilled).await?;
        advance_status_locked(&mut tx, fulfillment.id, EventKind::Fulfilled).await?;

        let result = sqlx::query(
            r#"
            insert into fulfillments (
                id, asset, amount, receiver, tx_hash, block_number, is_call, call_data, created_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            on conflict (id) do nothing
            "#,
        )
        .bind(hex_id(fulfillment.id))
        .bind(fulfillment.asset.to_string())
        .bind(fulfillment.amount.to_string())
        .bind(fulfillment.receiver.to_string())
        .bind(fulfillment.tx_hash.to_string())
        .bind(i64::try_from(fulfillment.block_number).context("block_number out of range")?)
        .bind(fulfillment.is_call)
        .bind(fulfillment.call_data.as_deref())
        .bind(fulfillment.created_at)
        .execute(&mut *tx)
        .await
        .context("insert fulfillments")?;

        tx.commit().await.context("commit fulfillment tx")?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a source-chain settlement and advance the intent to
    /// `settled`, the terminal status regardless of `fulfilled` (spec.md §9
    /// Open Question: a `Settled` event with `fulfilled = false` is still
    /// terminal — the funds were returned to the sender, not delivered, but
    /// the intent's lifecycle on this chain is over). Returns whether the
    /// settlement row was newly inserted (spec.md §4.3 `created bool`).
    pub async fn insert_settlement(&self, settlement: &Settlement) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("begin settlement tx")?;

        ensure_intent_stub(&mut tx, settlement.id, IntentStatus::Settled).await?;
        advance_status_locked(&mut tx, settlement.id, EventKind::Settled).await?;

        let result = sqlx::query(
            r#"
            insert into settlements (
                id, asset, amount, receiver, fulfilled, fulfiller, actual_amount, paid_tip,
                tx_hash, block_number, is_call, call_data, created_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            on conflict (id) do nothing
            "#,
        )
        .bind(hex_id(settlement.id))
        .bind(settlement.asset.to_string())
        .bind(settlement.amount.to_string())
        .bind(settlement.receiver.to_string())
        .bind(settlement.fulfilled)
        .bind(settlement.fulfiller.to_string())
        .bind(settlement.actual_amount.to_string())
        .bind(settlement.paid_tip.to_string())
        .bind(settlement.tx_hash.to_string())
        .bind(i64::try_from(settlement.block_number).context("block_number out of range")?)
        .bind(settlement.is_call)
        .bind(settlement.call_data.as_deref())
        .bind(settlement.created_at)
        .execute(&mut *tx)
        .await
        .context("insert settlements")?;

        tx.commit().await.context("commit settlement tx")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn intent_status(&self, id: B256) -> Result<Option<IntentStatus>> {
        let row: Option<String> = sqlx::query_scalar("select status from intents where id = $1")
            .bind(hex_id(id))
            .fetch_optional(&self.pool)
            .await
            .context("read intent status")?;

        Ok(row.and_then(|s| IntentStatus::parse(&s)))
    }

    pub async fn cursor(&self, chain_id: u64) -> Result<ChainCursor> {
        let chain_id_db = i64::try_from(chain_id).context("chain_id out of range")?;

        let last_processed_block: Option<i64> = sqlx::query_scalar(
            "select block_number from last_processed_blocks where chain_id = $1",
        )
        .bind(chain_id_db)
        .fetch_optional(&self.pool)
        .await
        .context("read last_processed_blocks")?;

        let last_periodic_catchup_block: Option<i64> = sqlx::query_scalar(
            "select block_number from last_periodic_catchup_blocks where chain_id = $1",
        )
        .bind(chain_id_db)
        .fetch_optional(&self.pool)
        .await
        .context("read last_periodic_catchup_blocks")?;

        Ok(ChainCursor {
            chain_id,
            last_processed_block: last_processed_block.unwrap_or(0) as u64,
            last_periodic_catchup_block: last_periodic_catchup_block.unwrap_or(0) as u64,
        })
    }

    /// Monotonic: a write that would move the cursor backward is a no-op
    /// (spec.md §8 "cursor monotonicity").
    pub async fn advance_last_processed_block(&self, chain_id: u64, block_number: u64) -> Result<()> {
        advance_cursor_table(
            &self.pool,
            "last_processed_blocks",
            chain_id,
            block_number,
        )
        .await
    }

    pub async fn advance_last_periodic_catchup_block(
        &self,
        chain_id: u64,
        block_number: u64,
    ) -> Result<()> {
        advance_cursor_table(
            &self.pool,
            "last_periodic_catchup_blocks",
            chain_id,
            block_number,
        )
        .await
    }
}

async fn advance_cursor_table(
    pool: &PgPool,
    table: &'static str,
    chain_id: u64,
    block_number: u64,
) -> Result<()> {
    let chain_id_db = i64::try_from(chain_id).context("chain_id out of range")?;
    let block_number_db = i64::try_from(block_number).context("block_number out of range")?;

    let sql = format!(
        "insert into {table} (chain_id, block_number, updated_at) values ($1, $2, now()) \
         on conflict (chain_id) do update set block_number = excluded.block_number, updated_at = now() \
         where {table}.block_number < excluded.block_number"
    );

    sqlx::query(&sql)
        .bind(chain_id_db)
        .bind(block_number_db)
        .execute(pool)
        .await
        .with_context(|| format!("advance {table}"))?;

    Ok(())
}

/// Create a placeholder intent row if one doesn't already exist, so a
/// fulfillment/settlement observed ahead of its `Initiated` event has
/// something to reference and advance. Descriptive fields are zeroed and
/// corrected later by [`EventStore::upsert_intent`].
async fn ensure_intent_stub(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    id: B256,
    implied_status: IntentStatus,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into intents (
            id, source_chain, destination_chain, token, recipient, sender,
            amount, intent_fee, status, is_call, call_data, created_at, updated_at
        ) values ($1, 0, 0, $2, $2, $2, '0', '0', $3, false, null, now(), now())
        on conflict (id) do nothing
        "#,
    )
    .bind(hex_id(id))
    .bind(Address::ZERO.to_string())
    .bind(implied_status.as_str())
    .execute(&mut **tx)
    .await
    .context("ensure intent stub")?;

    Ok(())
}

/// Bump `intents.status` forward only, holding a row lock for the
/// read-compare-write so concurrent observations of the same intent can't
/// race each other into a regression (spec.md §5 "row-level locking for
/// status updates"). Delegates the forward/ignore decision to the one
/// canonical [`speedrun_types::decide`] implementation, so this and any
/// other caller can never diverge on what counts as an advance.
async fn advance_status_locked(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    id: B256,
    event: EventKind,
) -> Result<()> {
    let current: Option<String> =
        sqlx::query_scalar("select status from intents where id = $1 for update")
            .bind(hex_id(id))
            .fetch_optional(&mut **tx)
            .await
            .context("lock intent row")?;

    let current_status = current.as_deref().and_then(IntentStatus::parse);

    if let Transition::Apply(new_status) = decide(current_status, event) {
        sqlx::query("update intents set status = $2, updated_at = now() where id = $1")
            .bind(hex_id(id))
            .bind(new_status.as_str())
            .execute(&mut **tx)
            .await
            .context("advance intent status")?;
    }

    Ok(())
}

fn hex_id(id: B256) -> String {
    id.to_string()
}
