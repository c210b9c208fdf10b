use std::time::Duration;

use serde::Deserialize;

/// Limits applied to the sandbox runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Bound on source loading and on each fragment; `0` disables it.
    #[serde(default = "default_timeout_ms")]
    pub execute_timeout_ms: Option<u64>,
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: Option<usize>,
    #[serde(default = "default_max_stack")]
    pub max_stack_bytes: Option<usize>,
}

fn default_timeout_ms() -> Option<u64> {
    Some(30_000)
}
fn default_memory_limit() -> Option<usize> {
    Some(64 * 1024 * 1024)
}
fn default_max_stack() -> Option<usize> {
    Some(1024 * 1024)
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execute_timeout_ms: default_timeout_ms(),
            memory_limit_bytes: default_memory_limit(),
            max_stack_bytes: default_max_stack(),
        }
    }
}

impl SandboxConfig {
    pub fn execute_timeout(&self) -> Option<Duration> {
        self.execute_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
