//! Configuration parsing.
//!
//! The daemon reads a single TOML file describing the distribution limits,
//! ledger storage, chain endpoint, and HTTP listener. Every section except
//! `[chain]` has usable defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::address::WalletAddress;
use crate::ledger::{DEFAULT_MAX_PARTICIPANTS, LedgerOptions};
use crate::transfer::TransferTimeouts;
use crate::transfer::rpc::RpcSettings;
use crate::types::TokenAmount;

/// Default amount sent per claim, in the token's smallest unit.
pub const DEFAULT_AIRDROP_AMOUNT: TokenAmount = TokenAmount::new(10_000_000_000_000_000);

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AirdropConfig {
    #[serde(default)]
    pub distribution: DistributionConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    pub chain: ChainConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl AirdropConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.distribution.max_participants == 0 {
            return Err(invalid("distribution.max_participants must be at least 1"));
        }
        if self.distribution.airdrop_amount.is_zero() {
            return Err(invalid("distribution.airdrop_amount must be positive"));
        }
        if self.storage.database_path.as_os_str().is_empty() {
            return Err(invalid("storage.database_path must not be empty"));
        }

        let chain = &self.chain;
        if !(chain.rpc_url.starts_with("http://") || chain.rpc_url.starts_with("https://")) {
            return Err(invalid("chain.rpc_url must be an http:// or https:// URL"));
        }
        if chain.gas_limit == 0 {
            return Err(invalid("chain.gas_limit must be positive"));
        }
        for (key, value) in [
            ("chain.submit_timeout_secs", chain.submit_timeout_secs),
            ("chain.confirm_timeout_secs", chain.confirm_timeout_secs),
            ("chain.receipt_poll_interval_ms", chain.receipt_poll_interval_ms),
            ("chain.request_timeout_secs", chain.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{key} must be positive")));
            }
        }
        if chain
            .rpc_auth_token_env
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            return Err(invalid("chain.rpc_auth_token_env must not be blank"));
        }
        Ok(())
    }

    /// Ledger settings derived from `[distribution]` and `[storage]`.
    #[must_use]
    pub const fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            max_participants: self.distribution.max_participants,
            busy_timeout: Duration::from_millis(self.storage.busy_timeout_ms),
        }
    }

    /// Executor timeouts derived from `[chain]`.
    #[must_use]
    pub const fn transfer_timeouts(&self) -> TransferTimeouts {
        TransferTimeouts {
            submit: Duration::from_secs(self.chain.submit_timeout_secs),
            confirm: Duration::from_secs(self.chain.confirm_timeout_secs),
        }
    }

    /// JSON-RPC client settings, reading the bearer token from the process
    /// environment when `rpc_auth_token_env` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the named variable is unset.
    pub fn rpc_settings(&self) -> Result<RpcSettings, ConfigError> {
        self.rpc_settings_with(|name| std::env::var(name).ok())
    }

    fn rpc_settings_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<RpcSettings, ConfigError> {
        let chain = &self.chain;
        let auth_token = match chain.rpc_auth_token_env.as_deref() {
            Some(name) => {
                let token = lookup(name).filter(|value| !value.trim().is_empty()).ok_or_else(
                    || {
                        ConfigError::Validation(format!(
                            "environment variable {name} named by chain.rpc_auth_token_env is not set"
                        ))
                    },
                )?;
                Some(SecretString::from(token))
            },
            None => None,
        };

        Ok(RpcSettings {
            rpc_url: chain.rpc_url.clone(),
            token_contract: chain.token_contract,
            sender: chain.sender_address,
            gas_limit: chain.gas_limit,
            receipt_poll_interval: Duration::from_millis(chain.receipt_poll_interval_ms),
            request_timeout: Duration::from_secs(chain.request_timeout_secs),
            auth_token,
        })
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation(message.to_string())
}

/// `[distribution]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistributionConfig {
    /// Maximum number of participant records, settled or not.
    #[serde(default = "default_max_participants")]
    pub max_participants: u64,

    /// Amount sent to each participant, in the token's smallest unit.
    #[serde(default = "default_airdrop_amount")]
    pub airdrop_amount: TokenAmount,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            max_participants: default_max_participants(),
            airdrop_amount: default_airdrop_amount(),
        }
    }
}

const fn default_max_participants() -> u64 {
    DEFAULT_MAX_PARTICIPANTS
}

const fn default_airdrop_amount() -> TokenAmount {
    DEFAULT_AIRDROP_AMOUNT
}

/// `[storage]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// How long a writer waits for the database lock.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("airdrop-ledger.db")
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// `[chain]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    /// JSON-RPC endpoint of a node that manages `sender_address`.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// ERC-20 contract being distributed.
    pub token_contract: WalletAddress,

    /// Node-managed account that holds the airdrop supply.
    pub sender_address: WalletAddress,

    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,

    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,

    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,

    #[serde(default = "default_receipt_poll_interval_ms")]
    pub receipt_poll_interval_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Name of the environment variable holding a bearer token for the
    /// endpoint, if it requires one.
    #[serde(default)]
    pub rpc_auth_token_env: Option<String>,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

const fn default_gas_limit() -> u64 {
    100_000
}

const fn default_submit_timeout_secs() -> u64 {
    30
}

const fn default_confirm_timeout_secs() -> u64 {
    180
}

const fn default_receipt_poll_interval_ms() -> u64 {
    2_000
}

const fn default_request_timeout_secs() -> u64 {
    15
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
