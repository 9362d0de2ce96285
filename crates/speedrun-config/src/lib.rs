//! Configuration loading (spec.md §6, §13): environment-variable driven,
//! exactly the keys and defaults spec.md §6 enumerates. Out of core *design*
//! scope per spec.md §1, but carried as ambient plumbing like any other
//! service's startup configuration.

use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::Deserialize;
use speedrun_chain::POLLING_ONLY_CHAIN_ID;

/// Per-chain settings named in spec.md §6, read from `CHAIN_{id}_*`
/// environment variables since `SUPPORTED_CHAINS` makes the chain set
/// dynamic — a fixed `envy` struct can't express that, so these are parsed
/// by hand instead.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub intent_addr: Address,
    pub block_interval: u64,
    pub max_retries: u32,
    pub retry_delay_s: u64,
    pub confirmations: u64,
    pub default_block: u64,
}

impl ChainConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_s)
    }

    /// Hard-coded regardless of `RPC_URL` scheme (spec.md §6), matching
    /// `speedrun_chain::POLLING_ONLY_CHAIN_ID`.
    pub fn is_polling_only(&self) -> bool {
        self.chain_id == POLLING_ONLY_CHAIN_ID
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub chains: Vec<ChainConfig>,
    pub periodic_catchup_interval_minutes: u64,
    pub periodic_catchup_timeout_minutes: u64,
    pub periodic_catchup_lookback_blocks: u64,
    pub shutdown_timeout_s: u64,
}

impl AppConfig {
    pub fn periodic_catchup_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_catchup_interval_minutes * 60)
    }

    pub fn periodic_catchup_timeout(&self) -> Duration {
        Duration::from_secs(self.periodic_catchup_timeout_minutes * 60)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_s)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct BaseEnv {
    database_url: String,
    db_max_connections: u32,
    supported_chains: String,
    periodic_catchup_interval_minutes: u64,
    periodic_catchup_timeout_minutes: u64,
    periodic_catchup_lookback_blocks: u64,
    shutdown_timeout_s: u64,
}

impl Default for BaseEnv {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            supported_chains: String::new(),
            periodic_catchup_interval_minutes: DEFAULT_PERIODIC_CATCHUP_INTERVAL_MINUTES,
            periodic_catchup_timeout_minutes: DEFAULT_PERIODIC_CATCHUP_TIMEOUT_MINUTES,
            periodic_catchup_lookback_blocks: DEFAULT_PERIODIC_CATCHUP_LOOKBACK_BLOCKS,
            shutdown_timeout_s: DEFAULT_SHUTDOWN_TIMEOUT_S,
        }
    }
}

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_BLOCK_INTERVAL: u64 = 1;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_S: u64 = 5;
const DEFAULT_CONFIRMATIONS: u64 = 1;
const DEFAULT_DEFAULT_BLOCK: u64 = 0;
const DEFAULT_PERIODIC_CATCHUP_INTERVAL_MINUTES: u64 = 30;
const DEFAULT_PERIODIC_CATCHUP_TIMEOUT_MINUTES: u64 = 15;
const DEFAULT_PERIODIC_CATCHUP_LOOKBACK_BLOCKS: u64 = 1000;
const DEFAULT_SHUTDOWN_TIMEOUT_S: u64 = 30;

/// Load configuration from the process environment (after an optional
/// `.env` file, which the binary loads via `dotenvy::dotenv()` before
/// calling this). Fatal on any missing/malformed required field (spec.md
/// §7 "configuration invalid at startup ... the process refuses to
/// start").
pub fn load() -> Result<AppConfig> {
    let base: BaseEnv = envy::from_env().context("load base env config")?;

    if base.database_url.trim().is_empty() {
        anyhow::bail!("DATABASE_URL must be set");
    }

    let chain_ids = parse_chain_ids(&base.supported_chains)?;
    if chain_ids.is_empty() {
        anyhow::bail!("SUPPORTED_CHAINS must list at least one chain id");
    }

    let mut chains = Vec::with_capacity(chain_ids.len());
    for chain_id in chain_ids {
        chains.push(load_chain_config(chain_id)?);
    }

    Ok(AppConfig {
        database_url: base.database_url,
        db_max_connections: base.db_max_connections.max(1),
        chains,
        periodic_catchup_interval_minutes: base.periodic_catchup_interval_minutes.max(1),
        periodic_catchup_timeout_minutes: base.periodic_catchup_timeout_minutes.max(1),
        periodic_catchup_lookback_blocks: base.periodic_catchup_lookback_blocks,
        shutdown_timeout_s: base.shutdown_timeout_s.max(1),
    })
}

fn load_chain_config(chain_id: u64) -> Result<ChainConfig> {
    let rpc_url = env_var(&format!("CHAIN_{chain_id}_RPC_URL"))
        .with_context(|| format!("CHAIN_{chain_id}_RPC_URL must be set"))?;

    let intent_addr_raw = env_var(&format!("CHAIN_{chain_id}_INTENT_ADDR"))
        .with_context(|| format!("CHAIN_{chain_id}_INTENT_ADDR must be set"))?;
    let intent_addr: Address = intent_addr_raw
        .parse()
        .with_context(|| format!("CHAIN_{chain_id}_INTENT_ADDR is not a valid address"))?;

    let block_interval = env_var_parsed(&format!("CHAIN_{chain_id}_BLOCK_INTERVAL"))?
        .unwrap_or(DEFAULT_BLOCK_INTERVAL)
        .max(1);
    let max_retries =
        env_var_parsed(&format!("CHAIN_{chain_id}_MAX_RETRIES"))?.unwrap_or(DEFAULT_MAX_RETRIES);
    let retry_delay_s = env_var_parsed(&format!("CHAIN_{chain_id}_RETRY_DELAY_S"))?
        .unwrap_or(DEFAULT_RETRY_DELAY_S);
    let confirmations = env_var_parsed(&format!("CHAIN_{chain_id}_CONFIRMATIONS"))?
        .unwrap_or(DEFAULT_CONFIRMATIONS);
    let default_block = env_var_parsed(&format!("CHAIN_{chain_id}_DEFAULT_BLOCK"))?
        .unwrap_or(DEFAULT_DEFAULT_BLOCK);

    Ok(ChainConfig {
        chain_id,
        rpc_url,
        intent_addr,
        block_interval,
        max_retries,
        retry_delay_s,
        confirmations,
        default_block,
    })
}

fn parse_chain_ids(raw: &str) -> Result<Vec<u64>> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u64>().with_context(|| format!("invalid chain id {s:?} in SUPPORTED_CHAINS")))
        .collect()
}

fn env_var(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("missing environment variable {name}"))
}

fn env_var_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => v
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid value for {name}: {e}")),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow::anyhow!("reading {name}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_and_whitespace_separated_chain_ids() {
        assert_eq!(parse_chain_ids("1, 10  42").unwrap(), vec![1, 10, 42]);
    }

    #[test]
    fn empty_chain_list_is_empty_not_an_error() {
        assert_eq!(parse_chain_ids("").unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn rejects_non_numeric_chain_id() {
        assert!(parse_chain_ids("1,abc").is_err());
    }
}
