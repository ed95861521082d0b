//! Master configuration surface (§6) relevant to failover: quorum sizing and per-step deadlines.
//! Deserialized the same way `ht_rangeserver::config` is, via `serde`, since the properties-file
//! format itself is an external collaborator.

use serde::Deserialize;

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

/// The master-side configuration surface used by the balance plan authority and recovery
/// operations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MasterConfig {
    pub failover: FailoverConfig,
}

#[cfg(test)]
mod tests {
    use super::MasterConfig;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = MasterConfig::default();
        assert!(config.failover.quorum_percentage > 0.0);
        assert!(config.failover.quorum_percentage <= 100.0);
    }

    #[test]
    fn deserializes_a_partial_json_fragment() {
        let text = r#"{ "failover": { "quorum-percentage": 75.0 } }"#;
        let config: MasterConfig = serde_json::from_str(text).unwrap();
        assert!((config.failover.quorum_percentage - 75.0).abs() < f64::EPSILON);
        assert_eq!(config.failover.timeout_ms, MasterConfig::default().failover.timeout_ms);
    }
}
