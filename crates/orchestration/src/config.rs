//! Orchestration configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_THREAD_NAME: &str = "orchestration-worker";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What a composite does when rolling back one of its nested contexts fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RollbackFailurePolicy {
    /// Execute forward again every nested context whose rollback succeeded.
    #[default]
    Reapply,

    /// Leave the nested contexts as the rollback left them.
    Report,
}

impl FromStr for RollbackFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reapply" => Ok(RollbackFailurePolicy::Reapply),
            "report" => Ok(RollbackFailurePolicy::Report),
            other => Err(format!("unknown rollback policy '{other}'")),
        }
    }
}

/// Engine configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `ORCHESTRATION_POOL_SIZE`: worker pool size (default: `4`)
/// - `ORCHESTRATION_THREAD_NAME`: worker thread name (default: `"orchestration-worker"`)
/// - `ORCHESTRATION_RELAY_TIMEOUT_MS`: relay and join waits, `0` waits forever (default: `30000`)
/// - `ORCHESTRATION_LATCH_TIMEOUT_MS`: result bucket wait, `0` waits forever (default: `30000`)
/// - `ORCHESTRATION_ROLLBACK_POLICY`: `reapply` or `report` (default: `reapply`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationConfig {
    pub pool_size: usize,
    pub thread_name: String,
    pub relay_timeout: Option<Duration>,
    pub latch_timeout: Option<Duration>,
    pub rollback_policy: RollbackFailurePolicy,
}

impl OrchestrationConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            pool_size: lookup("ORCHESTRATION_POOL_SIZE")
                .and_then(|v| v.parse().ok())
                .filter(|size| *size > 0)
                .unwrap_or(defaults.pool_size),
            thread_name: lookup("ORCHESTRATION_THREAD_NAME")
                .filter(|name| !name.trim().is_empty())
                .unwrap_or(defaults.thread_name),
            relay_timeout: lookup("ORCHESTRATION_RELAY_TIMEOUT_MS")
                .and_then(|v| parse_timeout(&v))
                .unwrap_or(defaults.relay_timeout),
            latch_timeout: lookup("ORCHESTRATION_LATCH_TIMEOUT_MS")
                .and_then(|v| parse_timeout(&v))
                .unwrap_or(defaults.latch_timeout),
            rollback_policy: lookup("ORCHESTRATION_ROLLBACK_POLICY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.rollback_policy),
        }
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            relay_timeout: Some(DEFAULT_TIMEOUT),
            latch_timeout: Some(DEFAULT_TIMEOUT),
            rollback_policy: RollbackFailurePolicy::Reapply,
        }
    }
}

/// `Some(None)` for an explicit `0` (unbounded), `None` if unparseable.
fn parse_timeout(raw: &str) -> Option<Option<Duration>> {
    let millis: u64 = raw.trim().parse().ok()?;
    Some((millis > 0).then(|| Duration::from_millis(millis)))
}
