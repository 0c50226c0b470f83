//! Node configuration.
//!
//! Loaded from a TOML file; every section and field is optional and falls back
//! to the defaults of the reference hospital deployment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::consensus::{Difficulty, ProofOfWork};
use crate::ledger::{Ledger, LedgerError};
use crate::mempool::{Mempool, DEFAULT_MEMPOOL_CAPACITY};
use crate::runtime::Runtime;
use crate::signature::{SharedSecretVerifier, SignatureVerifier};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub mempool: MempoolConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Shared credential every mutating request must present
    #[serde(default = "default_network_key")]
    pub network_key: String,
    /// Require the network key on read-only endpoints too
    #[serde(default)]
    pub protect_reads: bool,
}

fn default_listen_addr() -> String {
    "127.0.0.1:5001".to_string()
}

fn default_network_key() -> String {
    "hospital-network-2025".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            network_key: default_network_key(),
            protect_reads: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Upper bound on one sealing attempt; 0 leaves the search unbounded
    #[serde(default = "default_seal_timeout_ms", skip_serializing_if = "Option::is_none")]
    pub seal_timeout_ms: Option<u64>,
    /// Seal automatically at this interval when transactions are pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_seal_interval_ms: Option<u64>,
}

fn default_workers() -> usize {
    1
}

fn default_seal_timeout_ms() -> Option<u64> {
    Some(30_000)
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            difficulty: Difficulty::default(),
            workers: default_workers(),
            seal_timeout_ms: default_seal_timeout_ms(),
            auto_seal_interval_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    DEFAULT_MEMPOOL_CAPACITY
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Writer identity → shared secret
    #[serde(default = "default_writers")]
    pub writers: BTreeMap<String, String>,
    #[serde(default = "default_counterparties")]
    pub approved_counterparties: Vec<String>,
}

fn default_writers() -> BTreeMap<String, String> {
    [
        ("doctor_emmanuel", "emma-secret444"),
        ("doctor_alex", "alex-secret123"),
        ("doctor_kim", "kim-key-987"),
        ("doctor_graham", "graham-secret555"),
    ]
    .into_iter()
    .map(|(w, s)| (w.to_string(), s.to_string()))
    .collect()
}

fn default_counterparties() -> Vec<String> {
    ["pharmacy_01", "pharmacy_downtown", "pharmacy_critical_care"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            writers: default_writers(),
            approved_counterparties: default_counterparties(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.network_key.is_empty() {
            return Err(ConfigError::Invalid("network.network_key is empty".into()));
        }
        if self.mempool.capacity == 0 {
            return Err(ConfigError::Invalid("mempool.capacity must be positive".into()));
        }
        if self.consensus.workers == 0 {
            return Err(ConfigError::Invalid("consensus.workers must be positive".into()));
        }
        if self.consensus.difficulty.zero_bits() > 256 {
            return Err(ConfigError::Invalid(format!(
                "consensus.difficulty of {} exceeds a 256-bit digest",
                self.consensus.difficulty
            )));
        }
        if let Some((writer, _)) = self.credentials.writers.iter().find(|(_, s)| s.is_empty()) {
            return Err(ConfigError::Invalid(format!("writer {writer} has an empty secret")));
        }
        Ok(())
    }

    pub fn seal_timeout(&self) -> Option<Duration> {
        self.consensus
            .seal_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn auto_seal_interval(&self) -> Option<Duration> {
        self.consensus
            .auto_seal_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn proof_of_work(&self) -> ProofOfWork {
        ProofOfWork::new(self.consensus.difficulty).with_workers(self.consensus.workers)
    }

    pub fn signature_verifier(&self) -> SignatureVerifier {
        SignatureVerifier::new(
            SharedSecretVerifier::new(self.credentials.writers.clone()),
            self.credentials.approved_counterparties.iter().cloned(),
        )
    }

    /// Fresh ledger and runtime wired from this configuration.
    pub fn build_runtime(&self) -> Result<Runtime, LedgerError> {
        let ledger = Ledger::initialize(Mempool::with_capacity(self.mempool.capacity))?;
        Ok(Runtime::new(
            ledger,
            self.signature_verifier(),
            self.proof_of_work(),
        ))
    }
}
