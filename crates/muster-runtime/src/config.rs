use crate::broker::OverflowPolicy;
use crate::monitor::ThresholdRule;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A finite shared resource declared at startup. Not mutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Resource identifier.
    pub id: String,
    /// Free-form resource type, e.g. `"tool"`, `"bay"`, `"license"`.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Total capacity in units.
    pub capacity: u64,
}

/// Tunables for the orchestration runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Heartbeat silence after which an agent is marked offline.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Interval between liveness sweeps.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Interval between scheduling passes (a submission also kicks one).
    #[serde(default = "default_pass_interval_ms")]
    pub pass_interval_ms: u64,
    /// Length of a proposal reconciliation window.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    /// Scheduling passes without an eligible agent before a queued task
    /// fails terminally.
    #[serde(default = "default_retry_budget")]
    pub assignment_retry_budget: u32,
    /// Bounded mailbox size per subscribed agent.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    /// What `send` does on a saturated mailbox.
    #[serde(default = "default_overflow_policy")]
    pub overflow_policy: OverflowPolicy,
    /// Wait after which a pending resource request gains a priority tier.
    #[serde(default = "default_promotion_after_secs")]
    pub promotion_after_secs: u64,
    /// Resources available to agents.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    /// Threshold alerting rules.
    #[serde(default)]
    pub rules: Vec<ThresholdRule>,
}

fn default_kind() -> String {
    "generic".to_string()
}

fn default_heartbeat_timeout_secs() -> u64 {
    30
}

fn default_sweep_interval_ms() -> u64 {
    2000
}

fn default_pass_interval_ms() -> u64 {
    250
}

fn default_reconcile_interval_ms() -> u64 {
    500
}

fn default_retry_budget() -> u32 {
    40
}

fn default_mailbox_capacity() -> usize {
    64
}

fn default_overflow_policy() -> OverflowPolicy {
    OverflowPolicy::Reject
}

fn default_promotion_after_secs() -> u64 {
    10
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            pass_interval_ms: default_pass_interval_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            assignment_retry_budget: default_retry_budget(),
            mailbox_capacity: default_mailbox_capacity(),
            overflow_policy: default_overflow_policy(),
            promotion_after_secs: default_promotion_after_secs(),
            resources: Vec::new(),
            rules: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Heartbeat timeout as a chrono duration for registry sweeps.
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_timeout_secs as i64)
    }

    /// Liveness sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Scheduling pass interval.
    pub fn pass_interval(&self) -> Duration {
        Duration::from_millis(self.pass_interval_ms)
    }

    /// Reconciliation window length.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    /// Starvation promotion bound for pending resource requests.
    pub fn promotion_after(&self) -> Duration {
        Duration::from_secs(self.promotion_after_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.heartbeat_timeout_secs, 30);
        assert_eq!(config.overflow_policy, OverflowPolicy::Reject);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_partial_document_overrides() {
        let config: RuntimeConfig = serde_json::from_value(serde_json::json!({
            "heartbeat_timeout_secs": 5,
            "overflow_policy": "block",
            "resources": [{"id": "gpu", "kind": "accelerator", "capacity": 2}],
        }))
        .unwrap();
        assert_eq!(config.heartbeat_timeout_secs, 5);
        assert_eq!(config.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.resources[0].capacity, 2);
        // Untouched fields keep their defaults.
        assert_eq!(config.assignment_retry_budget, 40);
    }
}
