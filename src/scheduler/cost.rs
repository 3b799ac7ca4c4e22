//! Static per-class cost table.
//!
//! Lookups are pure. The table can be overridden from a YAML file whose keys
//! are class wire names:
//!
//! ```yaml
//! OPEN_ORDER_DETECTED:
//!   expected_latency_ms: 4000
//!   rate_limit_per_minute: 30
//!   primary_endpoint: orders-a
//!   overflow_endpoints: [orders-b]
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::event::{EventClass, WorkerId};

/// Latency assumed when a plan carries no classes at all.
pub const DEFAULT_LATENCY_MS: u64 = 5000;

/// Errors loading a cost table override.
#[derive(Debug, Error)]
pub enum CostError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid cost entry for {class}: {reason}")]
    InvalidEntry { class: EventClass, reason: String },
}

/// Cost and rate-limit profile of one event class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassProfile {
    /// Expected latency of one downstream call.
    pub expected_latency_ms: u64,
    /// Calls allowed per minute on each endpoint.
    pub rate_limit_per_minute: u32,
    /// Endpoint used by worker 1.
    pub primary_endpoint: String,
    /// Alternate endpoints that spread load over more rate-limit buckets.
    #[serde(default)]
    pub overflow_endpoints: Vec<String>,
}

impl ClassProfile {
    fn new(latency_ms: u64, rate: u32, primary: &str, overflow: &[&str]) -> Self {
        Self {
            expected_latency_ms: latency_ms,
            rate_limit_per_minute: rate,
            primary_endpoint: primary.to_string(),
            overflow_endpoints: overflow.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Number of distinct rate-limit buckets available for the class.
    pub fn endpoint_count(&self) -> u32 {
        1 + self.overflow_endpoints.len() as u32
    }
}

/// Per-class lookup table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostModel {
    profiles: BTreeMap<EventClass, ClassProfile>,
}

impl Default for CostModel {
    fn default() -> Self {
        Self::reference()
    }
}

impl CostModel {
    /// The reference deployment table.
    pub fn reference() -> Self {
        let profiles = BTreeMap::from([
            (
                EventClass::RebalanceNeeded,
                ClassProfile::new(8000, 10, "rebalance-a", &["rebalance-b", "rebalance-c"]),
            ),
            (
                EventClass::OpenPositionDetected,
                ClassProfile::new(6000, 20, "positions-a", &["positions-b"]),
            ),
            (
                EventClass::OpenOrderDetected,
                ClassProfile::new(5000, 16, "orders-a", &["orders-b", "orders-c"]),
            ),
            (
                EventClass::NewBalanceUpdate,
                ClassProfile::new(3000, 40, "balances-a", &["balances-b"]),
            ),
            (
                EventClass::BalanceCheckRequired,
                ClassProfile::new(3000, 80, "balance-check-a", &[]),
            ),
        ]);
        Self { profiles }
    }

    /// Loads the reference table with overrides from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, CostError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Loads the reference table with overrides from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, CostError> {
        let overrides: BTreeMap<EventClass, ClassProfile> = serde_yaml::from_str(content)?;
        let mut model = Self::reference();
        for (class, profile) in overrides {
            model = model.with_profile(class, profile)?;
        }
        Ok(model)
    }

    /// Replaces one class profile.
    pub fn with_profile(mut self, class: EventClass, profile: ClassProfile) -> Result<Self, CostError> {
        if profile.rate_limit_per_minute == 0 {
            return Err(CostError::InvalidEntry {
                class,
                reason: "rate_limit_per_minute must be > 0".to_string(),
            });
        }
        if profile.primary_endpoint.trim().is_empty() {
            return Err(CostError::InvalidEntry {
                class,
                reason: "primary_endpoint must be non-empty".to_string(),
            });
        }
        self.profiles.insert(class, profile);
        Ok(self)
    }

    /// Profile for a class.
    pub fn profile(&self, class: EventClass) -> &ClassProfile {
        // Every constructor starts from the reference table, so all classes exist.
        &self.profiles[&class]
    }

    /// Expected latency of one call for the class.
    pub fn expected_latency(&self, class: EventClass) -> Duration {
        Duration::from_millis(self.profile(class).expected_latency_ms)
    }

    /// Per-endpoint rate limit for the class, calls per minute.
    pub fn rate_limit(&self, class: EventClass) -> u32 {
        self.profile(class).rate_limit_per_minute
    }

    /// Selects the endpoint a worker uses for a class.
    ///
    /// Worker 1 always uses the primary endpoint. Other workers take
    /// `overflow[(worker - 1) mod overflow.len()]`, falling back to the
    /// primary when the class has no overflow endpoints.
    pub fn endpoint_for(&self, class: EventClass, worker_id: WorkerId) -> &str {
        let profile = self.profile(class);
        if worker_id <= 1 || profile.overflow_endpoints.is_empty() {
            return &profile.primary_endpoint;
        }
        let index = (worker_id as usize - 1) % profile.overflow_endpoints.len();
        &profile.overflow_endpoints[index]
    }

    /// Number of workers the class's rate limits can keep busy.
    ///
    /// A worker issuing calls back to back produces `60000 / latency` calls
    /// per minute per class; the class can absorb
    /// `rate * endpoints` calls per minute.
    pub fn rate_ceiling(&self, class: EventClass) -> u32 {
        let profile = self.profile(class);
        let capacity =
            profile.rate_limit_per_minute as u64 * profile.endpoint_count() as u64 * profile.expected_latency_ms;
        ((capacity / 60_000) as u32).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_table_lookups() {
        let model = CostModel::reference();
        assert_eq!(
            model.expected_latency(EventClass::OpenOrderDetected),
            Duration::from_millis(5000)
        );
        assert_eq!(model.rate_limit(EventClass::RebalanceNeeded), 10);
        assert_eq!(model.profile(EventClass::BalanceCheckRequired).endpoint_count(), 1);
    }

    #[test]
    fn test_reference_average_latency_is_5000() {
        let model = CostModel::reference();
        let total: u64 = EventClass::ALL
            .iter()
            .map(|c| model.profile(*c).expected_latency_ms)
            .sum();
        assert_eq!(total / EventClass::ALL.len() as u64, 5000);
    }

    #[test]
    fn test_endpoint_selection() {
        let model = CostModel::reference();
        let class = EventClass::RebalanceNeeded;
        assert_eq!(model.endpoint_for(class, 1), "rebalance-a");
        assert_eq!(model.endpoint_for(class, 2), "rebalance-c");
        assert_eq!(model.endpoint_for(class, 3), "rebalance-b");
        assert_eq!(model.endpoint_for(class, 4), "rebalance-c");
        // No overflow endpoints: everyone shares the primary.
        assert_eq!(
            model.endpoint_for(EventClass::BalanceCheckRequired, 7),
            "balance-check-a"
        );
    }

    #[test]
    fn test_rate_ceiling_reference_is_four() {
        let model = CostModel::reference();
        for class in EventClass::ALL {
            assert_eq!(model.rate_ceiling(class), 4, "{class}");
        }
    }

    #[test]
    fn test_yaml_override() {
        let yaml = r#"
OPEN_ORDER_DETECTED:
  expected_latency_ms: 1000
  rate_limit_per_minute: 120
  primary_endpoint: orders-x
"#;
        let model = CostModel::from_yaml_str(yaml).expect("valid yaml");
        let profile = model.profile(EventClass::OpenOrderDetected);
        assert_eq!(profile.expected_latency_ms, 1000);
        assert!(profile.overflow_endpoints.is_empty());
        // Untouched classes keep reference values.
        assert_eq!(model.rate_limit(EventClass::RebalanceNeeded), 10);
    }

    #[test]
    fn test_yaml_override_rejects_zero_rate() {
        let yaml = r#"
NEW_BALANCE_UPDATE:
  expected_latency_ms: 1000
  rate_limit_per_minute: 0
  primary_endpoint: b
"#;
        assert!(matches!(
            CostModel::from_yaml_str(yaml),
            Err(CostError::InvalidEntry { .. })
        ));
    }

    #[test]
    fn test_yaml_override_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("costs.yaml");
        std::fs::write(
            &path,
            "REBALANCE_NEEDED:\n  expected_latency_ms: 2000\n  rate_limit_per_minute: 5\n  primary_endpoint: r\n",
        )
        .unwrap();
        let model = CostModel::from_yaml_file(&path).unwrap();
        assert_eq!(model.rate_limit(EventClass::RebalanceNeeded), 5);
    }
}
