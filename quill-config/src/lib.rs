//! Node configuration: a TOML file merged with `QUILL__`-prefixed
//! environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use quill_core::ChainParams;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("unknown network {0:?}")]
    UnknownNetwork(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the chain database and block files.
    pub datadir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Bootstrap re-verification depth, levels 1..=7.
    pub check_level: u32,
    /// How many recent blocks to re-verify; 0 means all.
    pub check_blocks: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Hex-encoded compressed master public key override.
    pub master_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuillConfig {
    /// "mainnet" or "testnet".
    pub network: String,
    pub storage: StorageConfig,
    pub validation: ValidationConfig,
    pub checkpoints: CheckpointConfig,
    /// tracing filter directive, e.g. "info" or "quill_chain=debug".
    pub log_filter: String,
}

impl QuillConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("QUILL").separator("__"));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn example() -> Self {
        QuillConfig {
            network: "mainnet".into(),
            storage: StorageConfig {
                datadir: PathBuf::from("/var/lib/quill"),
            },
            validation: ValidationConfig {
                check_level: 1,
                check_blocks: 2500,
            },
            checkpoints: CheckpointConfig { master_key: None },
            log_filter: "info".into(),
        }
    }

    /// Resolve chain parameters, applying the checkpoint key override.
    pub fn chain_params(&self) -> Result<ChainParams, ConfigError> {
        let mut params = match self.network.as_str() {
            "mainnet" => ChainParams::mainnet(),
            "testnet" => ChainParams::testnet(),
            other => return Err(ConfigError::UnknownNetwork(other.to_string())),
        };
        if let Some(key) = &self.checkpoints.master_key {
            params.checkpoint_master_key = key.clone();
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quill.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
network = "testnet"
log_filter = "debug"

[storage]
datadir = "/tmp/quill-test"

[validation]
check_level = 4
check_blocks = 100

[checkpoints]
"#
        )
        .unwrap();
        let cfg = QuillConfig::load(&path).unwrap();
        assert_eq!(cfg.network, "testnet");
        assert_eq!(cfg.validation.check_level, 4);
        assert!(cfg.chain_params().unwrap().is_testnet());
    }

    #[test]
    fn unknown_network_is_rejected() {
        let mut cfg = QuillConfig::example();
        cfg.network = "moonnet".into();
        assert!(matches!(
            cfg.chain_params(),
            Err(ConfigError::UnknownNetwork(_))
        ));
    }

    #[test]
    fn checkpoint_key_override() {
        let mut cfg = QuillConfig::example();
        cfg.checkpoints.master_key = Some("02abc".into());
        assert_eq!(cfg.chain_params().unwrap().checkpoint_master_key, "02abc");
    }
}
