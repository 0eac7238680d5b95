//! Subsystem configuration

use crate::domain::{check_dynamic_chain_parameters, CvnId, DynamicChainParams, PocError, PocResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_NONCE_POOL_SIZE: usize = 20;
pub const MAX_NONCE_POOL_SIZE: usize = 100;
/// Minimum seconds between two local pool announcements
pub const NONCE_POOL_WAIT_TIME: u64 = 20;

/// Proof-of-Cooperation configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PocConfig {
    /// Local validator id
    pub node_id: CvnId,
    /// Directory holding the nonce pool file
    pub data_dir: PathBuf,
    pub nonce_file_name: String,
    /// Entries per announced pool
    pub nonce_pool_size: usize,
    /// Smallest pool accepted from peers
    pub min_nonce_pool_size: usize,
    /// Largest pool accepted from peers
    pub max_nonce_pool_size: usize,
    /// Announce a new pool once the active one drops below this
    pub nonce_refresh_floor: usize,
    pub nonce_pool_wait_secs: u64,
    pub poll_interval_ms: u64,
    pub max_poll_backoff_ms: u64,
    /// Abandoned attempts before a creator is reported as ban-eligible
    pub creator_retry_budget: u32,
    /// Early partial signatures kept per signer until their round is reached
    pub max_buffered_per_signer: usize,
    pub max_chain_data_per_block: usize,
    /// Accepted clock skew for block timestamps
    pub max_timestamp_drift_secs: u64,
    pub genesis_params: DynamicChainParams,
}

impl Default for PocConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            data_dir: PathBuf::from("."),
            nonce_file_name: "pool.dat".to_string(),
            nonce_pool_size: DEFAULT_NONCE_POOL_SIZE,
            min_nonce_pool_size: 1,
            max_nonce_pool_size: MAX_NONCE_POOL_SIZE,
            nonce_refresh_floor: 5,
            nonce_pool_wait_secs: NONCE_POOL_WAIT_TIME,
            poll_interval_ms: 1_000,
            max_poll_backoff_ms: 10_000,
            creator_retry_budget: 10,
            max_buffered_per_signer: 8,
            max_chain_data_per_block: 16,
            max_timestamp_drift_secs: 15,
            genesis_params: DynamicChainParams::default(),
        }
    }
}

fn env_override<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => {
                *target = value;
                info!("[qc-08] config override {key}={raw}");
            }
            Err(_) => warn!("[qc-08] ignoring invalid {key}={raw}"),
        }
    }
}

fn parse_node_id(raw: &str) -> Option<CvnId> {
    match raw.strip_prefix("0x") {
        Some(hex) => CvnId::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

impl PocConfig {
    /// Defaults with `QC_POC_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("QC_POC_NODE_ID") {
            match parse_node_id(&raw) {
                Some(id) => {
                    config.node_id = id;
                    info!("[qc-08] config override QC_POC_NODE_ID={raw}");
                }
                None => warn!("[qc-08] ignoring invalid QC_POC_NODE_ID={raw}"),
            }
        }
        env_override("QC_POC_DATA_DIR", &mut config.data_dir);
        env_override("QC_POC_NONCE_POOL_SIZE", &mut config.nonce_pool_size);
        env_override("QC_POC_POLL_INTERVAL_MS", &mut config.poll_interval_ms);
        env_override("QC_POC_NONCE_POOL_WAIT_SECS", &mut config.nonce_pool_wait_secs);
        config
    }

    pub fn validate(&self) -> PocResult<()> {
        let invalid = |msg: String| Err(PocError::InvalidConfig(msg));
        if self.min_nonce_pool_size == 0 {
            return invalid("min nonce pool size must be positive".into());
        }
        if self.min_nonce_pool_size > self.max_nonce_pool_size {
            return invalid(format!(
                "min nonce pool size {} above max {}",
                self.min_nonce_pool_size, self.max_nonce_pool_size
            ));
        }
        if self.max_nonce_pool_size > MAX_NONCE_POOL_SIZE {
            return invalid(format!(
                "max nonce pool size {} above {MAX_NONCE_POOL_SIZE}",
                self.max_nonce_pool_size
            ));
        }
        if self.nonce_pool_size < self.min_nonce_pool_size
            || self.nonce_pool_size > self.max_nonce_pool_size
        {
            return invalid(format!(
                "nonce pool size {} outside [{}, {}]",
                self.nonce_pool_size, self.min_nonce_pool_size, self.max_nonce_pool_size
            ));
        }
        if self.nonce_refresh_floor >= self.nonce_pool_size {
            return invalid("refresh floor must be below the pool size".into());
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll interval must be positive".into());
        }
        if self.max_buffered_per_signer == 0 {
            return invalid("partial signature buffer must hold at least one entry per signer".into());
        }
        check_dynamic_chain_parameters(&self.genesis_params)
            .map_err(|e| PocError::InvalidConfig(format!("genesis params: {e}")))
    }

    pub fn nonce_file(&self) -> PathBuf {
        self.data_dir.join(&self.nonce_file_name)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_backoff(&self) -> Duration {
        Duration::from_millis(self.max_poll_backoff_ms.max(self.poll_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PocConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.nonce_pool_size, 20);
        assert_eq!(config.nonce_file(), PathBuf::from("./pool.dat"));
    }

    #[test]
    fn test_inconsistent_pool_sizes_rejected() {
        let config = PocConfig {
            min_nonce_pool_size: 50,
            max_nonce_pool_size: 10,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PocError::InvalidConfig(_))));

        let config = PocConfig {
            max_buffered_per_signer: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PocError::InvalidConfig(_))));

        let config = PocConfig {
            nonce_pool_size: 101,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = PocConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_node_id() {
        assert_eq!(parse_node_id("0xc001d00d"), Some(0xc001_d00d));
        assert_eq!(parse_node_id("42"), Some(42));
        assert_eq!(parse_node_id("zz"), None);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: PocConfig =
            serde_json::from_str(r#"{"node_id": 7, "nonce_pool_size": 30}"#).unwrap();
        assert_eq!(config.node_id, 7);
        assert_eq!(config.nonce_pool_size, 30);
        assert_eq!(config.max_nonce_pool_size, MAX_NONCE_POOL_SIZE);
    }
}
