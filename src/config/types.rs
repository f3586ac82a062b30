use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::job::backoff::Backoff;

// ─── Engine Config ──────────────────────────────────────────────────────────

/// Process-level settings, read from `stagehand.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Workspace the CLI operates on.
    pub workspace: String,
    pub state: StateConfig,
    pub worker: WorkerConfig,
    pub lock: LockConfig,
    pub verification: VerificationConfig,
    pub dispatch: DispatchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace: "default".to_string(),
            state: StateConfig::default(),
            worker: WorkerConfig::default(),
            lock: LockConfig::default(),
            verification: VerificationConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    pub path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: ".stagehand/state.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Evaluations allowed to run at once.
    pub parallelism: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { parallelism: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub ttl_seconds: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 30,
            poll_interval_ms: 50,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerificationConfig {
    /// Ceiling for any external check, whatever the rule asks for.
    pub timeout_seconds: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self { timeout_seconds: 10 }
    }
}

impl VerificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let backoff = Backoff::default();
        Self {
            max_attempts: backoff.max_attempts,
            base_delay_ms: backoff.base_delay.as_millis() as u64,
        }
    }
}

impl DispatchConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }
}
