use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use blake3::Hasher as Blake3;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::endpoint::{ExecutionContext, NodeEndpointResolver, DEFAULT_LOCAL_NODE_URL};
use crate::errors::{WalletError, WalletResult};
use crate::gas::GasConfig;
use crate::network::DEFAULT_REQUEST_TIMEOUT;
use crate::vault::KdfParameters;

const CONFIG_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Node used when the deployment context matches no hosted cluster.
    pub local_node_url: String,
    /// Forces a node URL regardless of the deployment context.
    #[serde(default)]
    pub node_url_override: Option<String>,
    pub request_timeout_secs: u64,
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            local_node_url: DEFAULT_LOCAL_NODE_URL.to_string(),
            node_url_override: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoreConfig {
    pub network: NetworkConfig,
    pub gas: GasConfig,
    pub kdf: KdfParameters,
    pub last_updated: DateTime<Utc>,
    pub version: u16,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            gas: GasConfig::default(),
            kdf: KdfParameters::default(),
            last_updated: Utc::now(),
            version: CONFIG_VERSION,
        }
    }
}

impl CoreConfig {
    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    pub fn resolver(&self) -> NodeEndpointResolver {
        NodeEndpointResolver::new(self.network.local_node_url.clone())
    }

    /// Environment-derived context, with the configured URL override applied on top.
    pub fn execution_context(&self) -> ExecutionContext {
        let mut context = ExecutionContext::from_env();
        if let Some(url) = &self.network.node_url_override {
            context.node_url_override = Some(url.clone());
        }
        context
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigEnvelope {
    version: u16,
    checksum: [u8; 32],
    payload: CoreConfig,
    modified_at_unix: i64,
}

/// Handles persistence of core configuration with integrity checks.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load_or_default(&self) -> WalletResult<CoreConfig> {
        if !self.path.exists() {
            let config = CoreConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let bytes = fs::read(&self.path)?;
        let envelope: ConfigEnvelope = serde_json::from_slice(&bytes)
            .map_err(|e| WalletError::ConfigError(format!("Malformed config: {}", e)))?;
        if envelope.version != CONFIG_VERSION {
            return Err(WalletError::ConfigError(format!(
                "Unsupported config version {}",
                envelope.version
            )));
        }

        if checksum(&envelope.payload)? != envelope.checksum {
            return Err(WalletError::ConfigError(
                "Config integrity verification failed".to_string(),
            ));
        }

        Ok(envelope.payload)
    }

    pub fn save(&self, config: &CoreConfig) -> WalletResult<()> {
        let mut payload = config.clone();
        payload.touch();

        let envelope = ConfigEnvelope {
            version: CONFIG_VERSION,
            checksum: checksum(&payload)?,
            modified_at_unix: payload.last_updated.timestamp(),
            payload,
        };

        let serialized = serde_json::to_vec_pretty(&envelope)?;
        let tmp_path = self.path.with_extension("new");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&serialized)?;
            file.sync_all()?;
        }
        fs::rename(tmp_path, &self.path)?;
        Ok(())
    }

    pub fn update<F>(&self, updater: F) -> WalletResult<CoreConfig>
    where
        F: FnOnce(&mut CoreConfig) -> WalletResult<()>,
    {
        let mut config = self.load_or_default()?;
        updater(&mut config)?;
        config.touch();
        self.save(&config)?;
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn checksum(config: &CoreConfig) -> WalletResult<[u8; 32]> {
    let encoded = serde_json::to_vec(config)?;
    let mut hasher = Blake3::new();
    hasher.update(&encoded);
    Ok(*hasher.finalize().as_bytes())
}
