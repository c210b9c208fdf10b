//! Core contracts shared by every crossbridge backend.
//!
//! - [`Bridge`]: the initialize → execute → dispose lifecycle
//! - [`invocation`]: named invocations and their flat wire form
//! - [`StatsRecorder`] / [`PerformanceStats`]: per-bridge telemetry
//! - [`CallbackRegistry`]: correlation of asynchronous callback events
//! - [`StorageApi`]: the host capability surface injected into sandboxes

pub mod bridge;
pub mod capability;
pub mod correlation;
pub mod error;
pub mod invocation;
pub mod stats;

pub use bridge::{Bridge, BridgeFuture, BridgePhase, ExecuteRequest};
pub use capability::{MemoryStorage, StorageApi, UserRecord};
pub use correlation::{CallbackEvent, CallbackRegistry, CallbackToken};
pub use error::{BridgeError, ErrorKind, StorageError};
pub use invocation::Invocation;
pub use stats::{LoggingTelemetry, PerformanceStats, StatsRecorder, TelemetrySink, elapsed_ms};
