use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SpvConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("Failed to write configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode configuration: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct SpvConfig {
    pub network: NetworkConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NetworkConfig {
    /// Magic number identifying the peer-to-peer network
    pub magic: u32,
    /// Seed node addresses, `host[:port]`
    pub seed_list: Vec<String>,
    /// Port full nodes serve filtered data on
    pub spv_server_port: u16,
    /// Port announced in our own version message
    pub spv_client_port: u16,
    pub min_protocol_version: u32,
    /// Nonce identifying this client to peers
    pub client_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SyncConfig {
    /// Liveness loop period
    #[serde(with = "duration_serde")]
    pub info_update_interval: Duration,
    /// Peers silent for `info_update_interval * keep_alive_multiplier` are dropped
    pub keep_alive_multiplier: u32,
    pub max_orphans: usize,
    #[serde(with = "duration_serde")]
    pub orphan_ttl: Duration,
    pub tx_cache_size: usize,
    pub false_positive_threshold: u32,
    #[serde(with = "duration_serde")]
    pub false_positive_window: Duration,
    #[serde(with = "duration_serde")]
    pub peer_fault_cooldown: Duration,
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            magic: 7630401,
            seed_list: vec![
                "127.0.0.1:20338".to_string(),
                "127.0.0.1:20339".to_string(),
            ],
            spv_server_port: 20866,
            spv_client_port: 20867,
            min_protocol_version: crate::network::PROTOCOL_VERSION,
            client_id: u64::from(rand::random::<u32>()),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            info_update_interval: Duration::from_secs(15),
            keep_alive_multiplier: 3,
            max_orphans: 1024,
            orphan_ttl: Duration::from_secs(30 * 60),
            tx_cache_size: 4096,
            false_positive_threshold: 7,
            false_positive_window: Duration::from_secs(10 * 60),
            peer_fault_cooldown: Duration::from_secs(10 * 60),
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), SpvConfigError> {
        if self.spv_server_port == 0 || self.spv_client_port == 0 {
            return Err(SpvConfigError::InvalidPort(
                "SPV ports cannot be 0".to_string(),
            ));
        }
        if self.seed_list.is_empty() {
            warn!("No seed nodes configured, peers must be added by the transport");
        }
        Ok(())
    }

    /// Seed list rewritten to the SPV server port
    pub fn spv_seed_addrs(&self) -> Vec<String> {
        to_spv_addrs(&self.seed_list, self.spv_server_port)
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), SpvConfigError> {
        if self.info_update_interval.is_zero() {
            return Err(SpvConfigError::InvalidValue(
                "sync.info_update_interval must be greater than 0".to_string(),
            ));
        }
        if self.keep_alive_multiplier == 0 {
            return Err(SpvConfigError::InvalidValue(
                "sync.keep_alive_multiplier must be greater than 0".to_string(),
            ));
        }
        if self.max_orphans == 0 {
            return Err(SpvConfigError::InvalidValue(
                "sync.max_orphans must be greater than 0".to_string(),
            ));
        }
        if self.tx_cache_size == 0 {
            return Err(SpvConfigError::InvalidValue(
                "sync.tx_cache_size must be greater than 0".to_string(),
            ));
        }
        if self.false_positive_threshold == 0 {
            return Err(SpvConfigError::InvalidValue(
                "sync.false_positive_threshold must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Inactivity span after which an established peer is disconnected
    pub fn keep_alive_timeout(&self) -> Duration {
        self.info_update_interval * self.keep_alive_multiplier
    }
}

impl SpvConfig {
    /// Load configuration: defaults, then the optional TOML file, then
    /// `SPV_` prefixed environment variables (`SPV_SYNC__MAX_ORPHANS=64`).
    pub fn load(path: Option<&Path>) -> Result<Self, SpvConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                info!("Loading configuration from: {:?}", path);
                builder = builder.add_source(
                    File::from(path).format(FileFormat::Toml).required(true),
                );
            }
            None => info!("No configuration file given, using defaults"),
        }

        builder = builder.add_source(
            Environment::with_prefix("SPV")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: SpvConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), SpvConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        info!("Saved configuration to: {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SpvConfigError> {
        self.network.validate()?;
        self.sync.validate()?;
        Ok(())
    }
}

/// Point every seed at `port`, replacing any port it already carries
pub fn to_spv_addrs(seeds: &[String], port: u16) -> Vec<String> {
    seeds
        .iter()
        .map(|seed| match seed.rfind(':') {
            Some(index) if index > 0 => format!("{}:{}", &seed[..index], port),
            _ => format!("{}:{}", seed, port),
        })
        .collect()
}
