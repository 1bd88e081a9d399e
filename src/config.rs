//! Configuration management
//!
//! Loads configuration from config.toml with support for:
//! - Server binding settings
//! - Chain RPC endpoint and escrow contract address
//! - Circle API settings
//! - Webhook secrets (env vars take precedence)
//! - Fee parameters

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub chain: ChainConfig,
    pub circle: CircleConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    pub fees: FeeConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Chain RPC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint for the settlement chain
    pub rpc_url: String,
    /// The single escrow contract this deployment watches
    pub escrow_contract_address: String,
    /// Chain id recorded with funding records
    pub chain_id: i32,
    /// Blocks to look back on the first sync run, before any watermark exists
    #[serde(default = "default_lookback_blocks")]
    pub lookback_blocks: u64,
}

fn default_lookback_blocks() -> u64 {
    5000
}

/// Circle API configuration (API key comes from CIRCLE_API_KEY)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircleConfig {
    pub api_base: String,
}

/// Webhook secrets (values here are fallbacks; env vars take precedence)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub circle_secret: String,
    #[serde(default)]
    pub github_secret: String,
}

/// Escrow fee configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Platform fee in basis points, added on top of the prize at funding
    pub fee_bps: u32,
}

impl Config {
    /// Load from config.toml or use defaults
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load from specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            // Use embedded default config
            toml::from_str(DEFAULT_CONFIG).context("Failed to parse default config")
        }
    }

    /// Circle API key (CIRCLE_API_KEY, required for withdrawals)
    pub fn circle_api_key(&self) -> Option<String> {
        match std::env::var("CIRCLE_API_KEY") {
            Ok(key) if !key.is_empty() => Some(key),
            _ => None,
        }
    }

    /// Circle webhook HMAC secret (env var takes precedence)
    pub fn circle_webhook_secret(&self) -> Option<String> {
        env_or_config("CIRCLE_WEBHOOK_SECRET", &self.webhooks.circle_secret)
    }

    /// GitHub webhook HMAC secret (env var takes precedence)
    pub fn github_webhook_secret(&self) -> Option<String> {
        env_or_config("GITHUB_APP_WEBHOOK_SECRET", &self.webhooks.github_secret)
    }
}

fn env_or_config(var: &str, fallback: &str) -> Option<String> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => {
            if fallback.is_empty() {
                None
            } else {
                Some(fallback.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.fees.fee_bps, 300);
        assert_eq!(config.chain.lookback_blocks, 5000);
        assert!(!config.chain.escrow_contract_address.is_empty());
    }

    #[test]
    fn test_lookback_defaults_when_omitted() {
        let raw = r#"
            [server]
            host = "0.0.0.0"
            port = 8080

            [chain]
            rpc_url = "http://localhost:8545"
            escrow_contract_address = "0x0000000000000000000000000000000000000001"
            chain_id = 8453

            [circle]
            api_base = "https://api-sandbox.circle.com/v1"

            [fees]
            fee_bps = 300
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.chain.lookback_blocks, 5000);
        assert!(config.webhooks.circle_secret.is_empty());
    }
}
