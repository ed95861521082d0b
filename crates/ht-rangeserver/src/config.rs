//! Range server configuration surface (§6), deserialized from whatever config layer the process
//! embedding this crate uses (the properties file format itself is out of scope). Compressor and
//! bloom-filter-mode knobs are read as the same short strings the properties file uses
//! (`snappy`, `zlib`, `rows+cols`, ...) and resolved against `ht-format`/`ht-cellstore`'s enums,
//! rather than requiring those crates to grow a config-specific `Deserialize` impl.

use serde::Deserialize;
use thiserror::Error;

use ht_cellstore::BloomFilterMode;
use ht_format::CompressionType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unrecognized compressor {0:?}; expected one of none, bmz, zlib, lzo, quicklz, snappy")]
    UnknownCompressor(String),

    #[error("unrecognized bloom filter mode {0:?}; expected one of disabled, rows, rows+cols")]
    UnknownBloomFilterMode(String),
}

fn parse_compressor(name: &str) -> Result<CompressionType, ConfigError> {
    match name {
        "none" => Ok(CompressionType::None),
        "bmz" => Ok(CompressionType::Bmz),
        "zlib" => Ok(CompressionType::Zlib),
        "lzo" => Ok(CompressionType::Lzo),
        "quicklz" => Ok(CompressionType::Quicklz),
        "snappy" => Ok(CompressionType::Snappy),
        other => Err(ConfigError::UnknownCompressor(other.to_string())),
    }
}

fn parse_bloom_filter_mode(name: &str) -> Result<BloomFilterMode, ConfigError> {
    match name {
        "disabled" => Ok(BloomFilterMode::Disabled),
        "rows" => Ok(BloomFilterMode::Rows),
        "rows+cols" => Ok(BloomFilterMode::RowsAndColumns),
        other => Err(ConfigError::UnknownBloomFilterMode(other.to_string())),
    }
}

/// `Hypertable.RangeServer.CellStore.DefaultBloomFilter` and its nested knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BloomFilterConfig {
    pub mode:             String,
    pub num_hashes:       Option<u32>,
    pub bits_per_item:    Option<f64>,
    pub false_positive:   Option<f64>,
    pub max_approx_items: Option<u64>,
}

impl BloomFilterConfig {
    pub fn mode(&self) -> Result<BloomFilterMode, ConfigError> {
        parse_bloom_filter_mode(&self.mode)
    }
}

impl Default for BloomFilterConfig {
    fn default() -> Self {
        Self {
            mode: "rows".to_string(),
            num_hashes: None,
            bits_per_item: Some(10.0),
            false_positive: None,
            max_approx_items: None,
        }
    }
}

/// `Hypertable.RangeServer.CellStore.*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CellStoreConfig {
    pub default_block_size:   u32,
    pub default_compressor:   String,
    pub default_bloom_filter: BloomFilterConfig,
}

impl CellStoreConfig {
    pub fn default_compressor(&self) -> Result<CompressionType, ConfigError> {
        parse_compressor(&self.default_compressor)
    }
}

impl Default for CellStoreConfig {
    fn default() -> Self {
        Self {
            default_block_size: 65536,
            default_compressor: "zlib".to_string(),
            default_bloom_filter: BloomFilterConfig::default(),
        }
    }
}

/// `Hypertable.RangeServer.Range.*`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RangeConfig {
    pub split_size:          u64,
    pub metadata_split_size: u64,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self { split_size: 200 * 1024 * 1024, metadata_split_size: 50 * 1024 * 1024 }
    }
}

/// `Hypertable.RangeServer.AccessGroup.*`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AccessGroupConfig {
    pub cell_cache_page_size: usize,
}

impl Default for AccessGroupConfig {
    fn default() -> Self {
        Self { cell_cache_page_size: 8192 }
    }
}

/// `Hypertable.RangeServer.Data.DefaultReplication` and `Hypertable.Metadata.Replication`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReplicationConfig {
    pub default_replication:  Option<i32>,
    pub metadata_replication: Option<i32>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self { default_replication: None, metadata_replication: None }
    }
}

/// `Hypertable.Failover.*`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FailoverConfig {
    pub timeout_ms:        u64,
    pub quorum_percentage: f64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000, quorum_percentage: 50.0 }
    }
}

/// The full range server configuration surface enumerated in §6.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RangeServerConfig {
    pub cell_store:  CellStoreConfig,
    pub range:       RangeConfig,
    pub access_group: AccessGroupConfig,
    pub replication: ReplicationConfig,
    /// `Hypertable.CommitLog.SkipErrors`.
    pub commit_log_skip_errors: bool,
    pub failover: FailoverConfig,
    /// `Hypertable.Master.Split.SoftLimitEnabled`: when set, a range is allowed to exceed
    /// `split_size` rather than be forced to split immediately under load.
    pub master_split_soft_limit_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::RangeServerConfig;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = RangeServerConfig::default();
        assert!(config.range.split_size > config.range.metadata_split_size);
        assert!(config.cell_store.default_block_size > 0);
        assert!(config.cell_store.default_compressor().is_ok());
        assert!(config.cell_store.default_bloom_filter.mode().is_ok());
    }

    #[test]
    fn deserializes_a_partial_json_fragment() {
        let text = r#"{
            "commit-log-skip-errors": true,
            "range": { "split-size": 100, "metadata-split-size": 50 }
        }"#;
        let config: RangeServerConfig = serde_json::from_str(text).unwrap();
        assert!(config.commit_log_skip_errors);
        assert_eq!(config.range.split_size, 100);
        assert_eq!(config.range.metadata_split_size, 50);
    }

    #[test]
    fn rejects_unknown_compressor_name() {
        let mut config = RangeServerConfig::default();
        config.cell_store.default_compressor = "made-up".to_string();
        assert!(config.cell_store.default_compressor().is_err());
    }
}
