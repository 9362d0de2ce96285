//! The ingestion core's binary: wires configuration, chain clients, the
//! store, and the supervisor together (spec.md §2, §9 "replace singletons
//! with an explicitly constructed root object"). Loads config, inits
//! tracing, spawns supervised work, waits on a shutdown signal, and
//! unwinds within `shutdown_timeout`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use speedrun_chain::{ChainClient, EvmChainClient};
use speedrun_config::{AppConfig, ChainConfig};
use speedrun_core::{
    CatchupCoordinator, CatchupTarget, ChainHealthRegistry, PollingTarget, Supervisor,
    SubscriberTarget, Telemetry,
};
use speedrun_storage::EventStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_secs(15);
/// A subscription chain's liveness tick fires every 30s
/// ([`speedrun_core::run_subscriber`]'s `LIVENESS_TICK_INTERVAL`); three
/// missed ticks is a dropped connection, not a slow block.
const SUBSCRIPTION_STALENESS_BOUND: Duration = Duration::from_secs(90);
/// A polling chain is stale once it's missed three poll rounds.
const POLLING_STALENESS_BOUND: Duration = Duration::from_secs(POLL_INTERVAL.as_secs() * 3);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = speedrun_config::load().context("load configuration")?;
    tracing::info!(chains = cfg.chains.len(), "config loaded");

    let shutdown = CancellationToken::new();
    run(cfg, shutdown).await
}

async fn run(cfg: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let store = EventStore::connect(&cfg.database_url, cfg.db_max_connections)
        .await
        .context("connect to database")?;
    store.migrate().await.context("apply schema migrations")?;

    let telemetry = Telemetry::new();

    let mut catchup_targets = Vec::with_capacity(cfg.chains.len());
    let mut clients = Vec::with_capacity(cfg.chains.len());
    for chain in &cfg.chains {
        let client = Arc::new(
            EvmChainClient::connect(chain.chain_id, &chain.rpc_url)
                .await
                .with_context(|| format!("connect chain client for chain {}", chain.chain_id))?,
        );
        catchup_targets.push(catchup_target(chain, client.clone()));
        clients.push((chain.clone(), client));
    }

    let mut supervisor = Supervisor::new(shutdown.clone());
    let chain_health = supervisor.chain_health();

    let coordinator = Arc::new(CatchupCoordinator::new(
        catchup_targets,
        store.clone(),
        telemetry.clone(),
        chain_health.clone(),
    ));

    tracing::info!("running startup catchup barrier");
    coordinator
        .run_startup_barrier()
        .await
        .context("startup catchup barrier failed")?;
    tracing::info!("startup catchup barrier complete, starting live ingestion");

    let catchup_barrier = CancellationToken::new();
    catchup_barrier.cancel();

    for (chain, client) in &clients {
        let subscription_based = !chain.is_polling_only() && client.supports_subscriptions();
        let staleness_bound = if subscription_based {
            SUBSCRIPTION_STALENESS_BOUND
        } else {
            POLLING_STALENESS_BOUND
        };
        chain_health.register_chain(chain.chain_id, subscription_based, staleness_bound);

        spawn_chain_tasks(
            &mut supervisor,
            chain,
            client.clone(),
            store.clone(),
            telemetry.clone(),
            chain_health.clone(),
            catchup_barrier.clone(),
            shutdown.clone(),
        );
    }

    {
        let coordinator = coordinator.clone();
        let interval = cfg.periodic_catchup_interval();
        let timeout = cfg.periodic_catchup_timeout();
        let lookback = cfg.periodic_catchup_lookback_blocks;
        let periodic_shutdown = shutdown.clone();
        supervisor.spawn("periodic-catchup", move || {
            let coordinator = coordinator.clone();
            let shutdown = periodic_shutdown.clone();
            Box::pin(async move {
                coordinator
                    .run_periodic_loop(interval, timeout, lookback, shutdown)
                    .await;
                Ok(())
            }) as BoxFuture<'static, Result<()>>
        });
    }

    shutdown_signal().await?;
    tracing::info!("shutdown requested");

    shutdown.cancel();
    tokio::time::timeout(cfg.shutdown_timeout(), supervisor.join_all())
        .await
        .context("supervised tasks did not unwind within shutdown_timeout")?;

    Ok(())
}

fn catchup_target(chain: &ChainConfig, client: Arc<EvmChainClient>) -> CatchupTarget {
    CatchupTarget {
        chain_id: chain.chain_id,
        client: client as Arc<dyn speedrun_chain::ChainClient>,
        contract_address: chain.intent_addr,
        block_interval: chain.block_interval,
        max_retries: chain.max_retries,
        retry_delay: chain.retry_delay(),
        confirmations: chain.confirmations,
        default_block: chain.default_block,
    }
}

/// One subscriber per `(chain, event-type)` collapses to one task per
/// chain here: [`speedrun_core::run_subscriber`] watches all three event
/// kinds on a single `SubscribeLogs` call, which is both what the
/// `alloy` pubsub transport supports per filter and sufficient to
/// preserve the per-stream ordering guarantee spec.md §4.5 asks for.
fn spawn_chain_tasks(
    supervisor: &mut Supervisor,
    chain: &ChainConfig,
    client: Arc<EvmChainClient>,
    store: EventStore,
    telemetry: Telemetry,
    chain_health: ChainHealthRegistry,
    catchup_barrier: CancellationToken,
    shutdown: CancellationToken,
) {
    let client: Arc<dyn speedrun_chain::ChainClient> = client;
    let chain_id = chain.chain_id;

    if chain.is_polling_only() || !client.supports_subscriptions() {
        let target = PollingTarget {
            chain_id,
            client: client.clone(),
            contract_address: chain.intent_addr,
            block_interval: chain.block_interval,
            poll_interval: POLL_INTERVAL,
            max_retries: chain.max_retries,
            retry_delay: chain.retry_delay(),
            confirmations: chain.confirmations,
            default_block: chain.default_block,
        };
        supervisor.spawn(format!("chain-{chain_id}-poll"), move || {
            let target = PollingTarget {
                chain_id: target.chain_id,
                client: target.client.clone(),
                contract_address: target.contract_address,
                block_interval: target.block_interval,
                poll_interval: target.poll_interval,
                max_retries: target.max_retries,
                retry_delay: target.retry_delay,
                confirmations: target.confirmations,
                default_block: target.default_block,
            };
            let store = store.clone();
            let telemetry = telemetry.clone();
            let chain_health = chain_health.clone();
            let catchup_barrier = catchup_barrier.clone();
            let shutdown = shutdown.clone();
            Box::pin(async move {
                speedrun_core::run_polling_subscriber(
                    target,
                    store,
                    telemetry,
                    chain_health,
                    catchup_barrier,
                    shutdown,
                )
                .await
            }) as BoxFuture<'static, Result<()>>
        });
        return;
    }

    let target = SubscriberTarget {
        chain_id,
        client: client.clone(),
        contract_address: chain.intent_addr,
        block_interval: chain.block_interval,
        max_retries: chain.max_retries,
        retry_delay: chain.retry_delay(),
        confirmations: chain.confirmations,
        default_block: chain.default_block,
    };
    supervisor.spawn(format!("chain-{chain_id}-subscribe"), move || {
        let target = SubscriberTarget {
            chain_id: target.chain_id,
            client: target.client.clone(),
            contract_address: target.contract_address,
            block_interval: target.block_interval,
            max_retries: target.max_retries,
            retry_delay: target.retry_delay,
            confirmations: target.confirmations,
            default_block: target.default_block,
        };
        let store = store.clone();
        let telemetry = telemetry.clone();
        let chain_health = chain_health.clone();
        let catchup_barrier = catchup_barrier.clone();
        let shutdown = shutdown.clone();
        Box::pin(async move {
            speedrun_core::run_subscriber(
                target,
                store,
                telemetry,
                chain_health,
                catchup_barrier,
                shutdown,
            )
            .await
        }) as BoxFuture<'static, Result<()>>
    });
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("ctrl-c")?;
        Ok(())
    }
}
