use crate::domain::{Address, DecodedEvent, B256};
use crate::sync::{RetryPolicy, SyncConfig, SyncMode};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub rpc_url: String,
    pub chunk_size: u64,
    pub sync_mode: SyncMode,
    pub sync_to_block: Option<u64>,
    pub verify_sample_size: usize,
    pub retry: RetryPolicy,
    pub verbose: VerboseFilter,
}

/// Selects events whose application is traced at INFO under the `verbose` target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerboseFilter {
    pub all: bool,
    pub users: HashSet<Address>,
    pub tx_hashes: HashSet<B256>,
}

impl VerboseFilter {
    pub fn is_enabled(&self) -> bool {
        self.all || !self.users.is_empty() || !self.tx_hashes.is_empty()
    }

    pub fn matches(&self, event: &DecodedEvent) -> bool {
        self.all
            || self.tx_hashes.contains(&event.tx_hash)
            || event.event.users().iter().any(|u| self.users.contains(u))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let rpc_url = env_map
            .get("RPC_URL")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("RPC_URL".to_string()))?;

        let chunk_size = parse_number::<u64>(&env_map, "CHUNK_SIZE", "5000")?;
        if chunk_size == 0 {
            return Err(ConfigError::InvalidValue(
                "CHUNK_SIZE".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let sync_mode = match env_map
            .get("SYNC_MODE")
            .map(|s| s.as_str())
            .unwrap_or("continuous")
        {
            "continuous" => SyncMode::Continuous,
            "one_chunk" => SyncMode::OneChunk,
            other => {
                return Err(ConfigError::InvalidValue(
                    "SYNC_MODE".to_string(),
                    format!("must be continuous or one_chunk, got {}", other),
                ))
            }
        };

        let sync_to_block = match env_map.get("SYNC_TO_BLOCK") {
            Some(value) => Some(value.parse::<u64>().map_err(|_| {
                ConfigError::InvalidValue(
                    "SYNC_TO_BLOCK".to_string(),
                    "must be a valid block number".to_string(),
                )
            })?),
            None => None,
        };

        let verify_sample_size = parse_number::<usize>(&env_map, "VERIFY_SAMPLE_SIZE", "16")?;

        let max_attempts = parse_number::<u32>(&env_map, "RETRY_MAX_ATTEMPTS", "5")?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "RETRY_MAX_ATTEMPTS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        let retry = RetryPolicy {
            max_attempts,
            initial_interval: Duration::from_millis(parse_number(&env_map, "RETRY_INITIAL_MS", "250")?),
            max_interval: Duration::from_millis(parse_number(&env_map, "RETRY_MAX_MS", "10000")?),
        };

        let verbose = parse_verbose_filter_from_map(&env_map)?;

        Ok(Config {
            database_path,
            rpc_url,
            chunk_size,
            sync_mode,
            sync_to_block,
            verify_sample_size,
            retry,
            verbose,
        })
    }

    /// Controller settings shared by every market.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            chunk_size: self.chunk_size,
            target_block: self.sync_to_block,
            verify_sample_size: self.verify_sample_size,
            retry: self.retry.clone(),
            verbose: self.verbose.clone(),
            ..SyncConfig::default()
        }
    }
}

fn parse_number<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: &str,
) -> Result<T, ConfigError> {
    env_map
        .get(key)
        .map(|s| s.as_str())
        .unwrap_or(default)
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue(key.to_string(), "must be a valid number".to_string()))
}

fn parse_list<T: FromStr + Eq + Hash>(env_map: &HashMap<String, String>, key: &str) -> Result<HashSet<T>, ConfigError> {
    let Some(list) = env_map.get(key) else {
        return Ok(HashSet::new());
    };
    list.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            T::from_str(s)
                .map_err(|_| ConfigError::InvalidValue(key.to_string(), format!("cannot parse {}", s)))
        })
        .collect()
}

fn parse_verbose_filter_from_map(env_map: &HashMap<String, String>) -> Result<VerboseFilter, ConfigError> {
    let all = match env_map
        .get("LEDGER_VERBOSE_ALL")
        .map(|s| s.as_str())
        .unwrap_or("false")
    {
        "1" | "true" => true,
        "0" | "false" => false,
        other => {
            return Err(ConfigError::InvalidValue(
                "LEDGER_VERBOSE_ALL".to_string(),
                format!("must be true or false, got {}", other),
            ))
        }
    };
    Ok(VerboseFilter {
        all,
        users: parse_list(env_map, "LEDGER_VERBOSE_USERS")?,
        tx_hashes: parse_list(env_map, "LEDGER_VERBOSE_TX")?,
    })
}
