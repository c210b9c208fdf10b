//! Embedded JavaScript sandbox bridge for crossbridge.
//!
//! [`SandboxBridge`] evaluates a source file in a QuickJS context with an
//! allow-listed global scope, then runs code fragments against it. Host
//! capabilities ([`StorageApi`](crossbridge_core::StorageApi)) are exposed
//! to sandboxed code as the frozen `HostStorage` object.
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use crossbridge_core::MemoryStorage;
//! use crossbridge_sandbox::{SandboxBridge, SandboxConfig};
//!
//! # async fn run() -> Result<(), crossbridge_core::BridgeError> {
//! let bridge = SandboxBridge::new(SandboxConfig::default());
//! bridge.initialize_source(Path::new("external-libs/hello.js")).await?;
//! bridge.inject_capabilities(Arc::new(MemoryStorage::new())).await?;
//!
//! let created = bridge
//!     .execute_with_capabilities("await HostStorage.createUser('1', 'Ada', 36)")
//!     .await?;
//! assert_eq!(created, serde_json::json!(true));
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
mod context;
mod worker;

pub use bridge::SandboxBridge;
pub use config::SandboxConfig;
