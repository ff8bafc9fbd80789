use once_cell::sync::OnceCell;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::errors::{WalletError, WalletResult};

const ENV_WALLET_HOST: &str = "CHERT_WALLET_HOST";
const ENV_NODE_URL: &str = "CHERT_NODE_URL";
const ENV_NETWORK: &str = "CHERT_NETWORK";

/// Domain under which hosted wallet deployments live.
pub const DEPLOYMENT_DOMAIN: &str = "chert.network";
pub const MAINNET_NODE_URL: &str = "https://mainnet.chert.network";
pub const TESTNET_NODE_URL: &str = "https://testnet.chert.network";
pub const DEVNET_NODE_URL: &str = "https://devnet.chert.network";
pub const DEFAULT_LOCAL_NODE_URL: &str = "http://127.0.0.1:8545";

/// Subdomain lookup table for hosted deployments.
const SUBDOMAIN_TABLE: &[(&str, Network)] = &[
    ("wallet", Network::Mainnet),
    ("app", Network::Mainnet),
    ("testnet", Network::Testnet),
    ("testnet-wallet", Network::Testnet),
    ("devnet", Network::Devnet),
    ("devnet-wallet", Network::Devnet),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
    Local,
}

impl Network {
    fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "production" | "prod" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "devnet" | "dev" => Some(Network::Devnet),
            "local" | "localhost" => Some(Network::Local),
            _ => None,
        }
    }
}

/// Observed execution context the node endpoint is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    pub hostname: Option<String>,
    pub node_url_override: Option<String>,
    pub network_override: Option<String>,
}

impl ExecutionContext {
    pub fn from_env() -> Self {
        Self {
            hostname: read_env(ENV_WALLET_HOST),
            node_url_override: read_env(ENV_NODE_URL),
            network_override: read_env(ENV_NETWORK),
        }
    }

    pub fn with_hostname(hostname: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            ..Self::default()
        }
    }
}

fn read_env(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => {
            log::warn!("Environment variable {} is empty", name);
            None
        }
        Ok(value) if value.chars().any(|c| c.is_control()) => {
            log::warn!(
                "Environment variable {} contains control characters, ignoring",
                name
            );
            None
        }
        Ok(value) => Some(value.trim().to_string()),
        Err(_) => None,
    }
}

/// Resolved node endpoint; immutable for the rest of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContext {
    pub base_url: Url,
    pub network: Network,
}

/// Maps an [`ExecutionContext`] to a node base URL.
#[derive(Debug, Clone)]
pub struct NodeEndpointResolver {
    local_node_url: String,
}

impl NodeEndpointResolver {
    pub fn new(local_node_url: impl Into<String>) -> Self {
        Self {
            local_node_url: local_node_url.into(),
        }
    }

    pub fn resolve(&self, context: &ExecutionContext) -> WalletResult<NodeContext> {
        if let Some(url) = context.node_url_override.as_deref() {
            let network = context
                .network_override
                .as_deref()
                .and_then(Network::parse)
                .unwrap_or(Network::Local);
            return Ok(NodeContext {
                base_url: parse_url(url)?,
                network,
            });
        }

        let network = match context.network_override.as_deref() {
            Some(name) => Network::parse(name).ok_or_else(|| {
                WalletError::ConfigError(format!("Unknown network '{}'", name))
            })?,
            None => context
                .hostname
                .as_deref()
                .map(network_for_host)
                .unwrap_or(Network::Local),
        };

        let url = match network {
            Network::Mainnet => MAINNET_NODE_URL,
            Network::Testnet => TESTNET_NODE_URL,
            Network::Devnet => DEVNET_NODE_URL,
            Network::Local => self.local_node_url.as_str(),
        };

        Ok(NodeContext {
            base_url: parse_url(url)?,
            network,
        })
    }
}

impl Default for NodeEndpointResolver {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_NODE_URL)
    }
}

fn network_for_host(hostname: &str) -> Network {
    let host = hostname.trim().to_ascii_lowercase();
    let host = host.split(':').next().unwrap_or_default();
    let Some(subdomain) = host
        .strip_suffix(DEPLOYMENT_DOMAIN)
        .and_then(|prefix| prefix.strip_suffix('.'))
    else {
        return Network::Local;
    };

    SUBDOMAIN_TABLE
        .iter()
        .find(|(label, _)| *label == subdomain)
        .map(|(_, network)| *network)
        .unwrap_or(Network::Local)
}

fn parse_url(raw: &str) -> WalletResult<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| WalletError::ConfigError(format!("Invalid node URL '{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(WalletError::ConfigError(format!(
            "Unsupported node URL scheme '{}'",
            url.scheme()
        )));
    }
    Ok(url)
}

static NODE_CONTEXT: OnceCell<NodeContext> = OnceCell::new();

/// Resolve the node endpoint once per process; later calls return the first result.
pub fn init_node_context(
    resolver: &NodeEndpointResolver,
    context: &ExecutionContext,
) -> WalletResult<&'static NodeContext> {
    NODE_CONTEXT.get_or_try_init(|| {
        let resolved = resolver.resolve(context)?;
        log::info!(
            "Node endpoint resolved to {} ({:?})",
            resolved.base_url,
            resolved.network
        );
        Ok(resolved)
    })
}

pub fn node_context() -> WalletResult<&'static NodeContext> {
    NODE_CONTEXT
        .get()
        .ok_or_else(|| WalletError::ConfigError("Node endpoint not resolved".to_string()))
}
