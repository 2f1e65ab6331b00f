use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

const BIND_ADDR_ENV: &str = "CERTICHAIN_BIND_ADDR";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8001";
const DB_PATH_ENV: &str = "CERTICHAIN_DB_PATH";
const DEFAULT_DB_PATH: &str = "data/certichain.db";
const APP_URL_ENV: &str = "CERTICHAIN_APP_URL";
const DEFAULT_APP_URL: &str = "http://localhost:3000";
const CHAIN_ENV: &str = "CERTICHAIN_CHAIN";
const DEFAULT_CHAIN: &str = "polygon";
const VAULT_KEY_ENV: &str = "CERTICHAIN_VAULT_KEY";
const CROSSMINT_API_KEY_ENV: &str = "CROSSMINT_API_KEY";
const CROSSMINT_BASE_URL_ENV: &str = "CROSSMINT_BASE_URL";
const DEFAULT_CROSSMINT_BASE_URL: &str = "https://staging.crossmint.com/api/2022-06-09";
const DEFAULT_COLLECTION_ENV: &str = "CERTICHAIN_DEFAULT_COLLECTION";
pub const DEFAULT_COLLECTION: &str = "default-certichain-collection";
const MINT_MAX_RETRIES_ENV: &str = "CERTICHAIN_MINT_MAX_RETRIES";
const DEFAULT_MINT_MAX_RETRIES: u64 = 3;
const MINT_RETRY_DELAY_ENV: &str = "CERTICHAIN_MINT_RETRY_DELAY_SECS";
const DEFAULT_MINT_RETRY_DELAY_SECS: u64 = 5;
const LOG_JSON_ENV: &str = "CERTICHAIN_LOG_JSON";

#[derive(Clone, Debug)]
pub struct CrossmintConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Settings shared by request handlers.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub app_url: String,
    pub chain: String,
    pub default_collection: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            app_url: DEFAULT_APP_URL.to_string(),
            chain: DEFAULT_CHAIN.to_string(),
            default_collection: DEFAULT_COLLECTION.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MintQueueConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for MintQueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MINT_MAX_RETRIES as u32,
            retry_delay: Duration::from_secs(DEFAULT_MINT_RETRY_DELAY_SECS),
        }
    }
}

/// Process-level configuration read from the environment.
#[derive(Clone)]
pub struct BackendConfig {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub service: ServiceConfig,
    /// Hex key or passphrase for sealing wallet keys. `None` means an
    /// ephemeral key for this process only.
    pub vault_key: Option<String>,
    pub crossmint: Option<CrossmintConfig>,
    pub mint_queue: MintQueueConfig,
    pub log_json: bool,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("bind_addr", &self.bind_addr)
            .field("db_path", &self.db_path)
            .field("service", &self.service)
            .field("vault_key", &self.vault_key.as_ref().map(|_| "<redacted>"))
            .field("crossmint", &self.crossmint.as_ref().map(|c| &c.base_url))
            .field("mint_queue", &self.mint_queue)
            .field("log_json", &self.log_json)
            .finish()
    }
}

impl BackendConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env_or(BIND_ADDR_ENV, DEFAULT_BIND_ADDR)
            .parse::<SocketAddr>()
            .with_context(|| format!("{BIND_ADDR_ENV} must be a socket address"))?;

        let crossmint = non_empty_env(CROSSMINT_API_KEY_ENV).map(|api_key| CrossmintConfig {
            api_key,
            base_url: env_or(CROSSMINT_BASE_URL_ENV, DEFAULT_CROSSMINT_BASE_URL),
        });

        let max_retries = parse_env_u64(MINT_MAX_RETRIES_ENV).unwrap_or(DEFAULT_MINT_MAX_RETRIES);
        let retry_delay =
            parse_env_u64(MINT_RETRY_DELAY_ENV).unwrap_or(DEFAULT_MINT_RETRY_DELAY_SECS);

        Ok(Self {
            bind_addr,
            db_path: PathBuf::from(env_or(DB_PATH_ENV, DEFAULT_DB_PATH)),
            service: ServiceConfig {
                app_url: env_or(APP_URL_ENV, DEFAULT_APP_URL),
                chain: env_or(CHAIN_ENV, DEFAULT_CHAIN),
                default_collection: env_or(DEFAULT_COLLECTION_ENV, DEFAULT_COLLECTION),
            },
            vault_key: non_empty_env(VAULT_KEY_ENV),
            crossmint,
            mint_queue: MintQueueConfig {
                max_retries: u32::try_from(max_retries.max(1)).unwrap_or(u32::MAX),
                retry_delay: Duration::from_secs(retry_delay),
            },
            log_json: parse_env_flag(LOG_JSON_ENV),
        })
    }
}

fn env_or(var: &str, default: &str) -> String {
    non_empty_env(var).unwrap_or_else(|| default.to_string())
}

fn non_empty_env(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env_u64(var: &str) -> Option<u64> {
    env::var(var)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

pub fn parse_env_flag(var: &str) -> bool {
    matches!(
        env::var(var).ok().as_deref().map(str::trim),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}
