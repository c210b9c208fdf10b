use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Point-in-time copy of a bridge's telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    /// Wall-clock duration of the most recent `initialize`, successful or not.
    pub init_time_ms: u64,
    /// Wall-clock duration of the most recent execute call (overwritten).
    pub last_execute_time_ms: u64,
    /// Number of execute calls that reached an initialized bridge.
    pub call_count: u64,
}

/// Trait for telemetry sinks. Implementations can forward to a metrics
/// system or simply log.
pub trait TelemetrySink: Send + Sync {
    fn record_init(&self, bridge: &str, elapsed_ms: u64);
    fn record_execute(&self, bridge: &str, elapsed_ms: u64, call_count: u64);
}

/// Logging-based sink. Emits telemetry as structured log events.
pub struct LoggingTelemetry;

impl TelemetrySink for LoggingTelemetry {
    fn record_init(&self, bridge: &str, elapsed_ms: u64) {
        tracing::info!(bridge, elapsed_ms, kind = "init", "telemetry");
    }

    fn record_execute(&self, bridge: &str, elapsed_ms: u64, call_count: u64) {
        tracing::info!(bridge, elapsed_ms, call_count, kind = "execute", "telemetry");
    }
}

/// Per-bridge telemetry owner.
///
/// Updates happen under a mutex so a snapshot is always consistent, even when
/// the host lets two calls overlap.
pub struct StatsRecorder {
    bridge: &'static str,
    stats: Mutex<PerformanceStats>,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl std::fmt::Debug for StatsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsRecorder")
            .field("bridge", &self.bridge)
            .field("stats", &self.snapshot())
            .finish()
    }
}

impl StatsRecorder {
    pub fn new(bridge: &'static str) -> Self {
        Self {
            bridge,
            stats: Mutex::new(PerformanceStats::default()),
            sink: None,
        }
    }

    pub fn with_sink(bridge: &'static str, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new(bridge)
        }
    }

    pub fn record_init(&self, elapsed: Duration) {
        let elapsed_ms = elapsed_ms(elapsed);
        self.lock().init_time_ms = elapsed_ms;
        if let Some(sink) = &self.sink {
            sink.record_init(self.bridge, elapsed_ms);
        }
    }

    pub fn record_execute(&self, elapsed: Duration) {
        let elapsed_ms = elapsed_ms(elapsed);
        let call_count = {
            let mut stats = self.lock();
            stats.last_execute_time_ms = elapsed_ms;
            stats.call_count += 1;
            stats.call_count
        };
        if let Some(sink) = &self.sink {
            sink.record_execute(self.bridge, elapsed_ms, call_count);
        }
    }

    pub fn snapshot(&self) -> PerformanceStats {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, PerformanceStats> {
        // Plain counters: a poisoned lock still holds usable data.
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Whole milliseconds in `elapsed`, saturating at `u64::MAX`.
pub fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
