//! Process runtime bridge for crossbridge.
//!
//! [`ProcessBridge`] binds to an artifact on disk (a JAR by default), checks
//! that the external interpreter answers a liveness probe, and then runs each
//! invocation in a fresh runner process:
//!
//! ```text
//! java -cp <artifact>:<artifact dir>/java-src JavaRunner <target> <member> <args…>
//! ```
//!
//! The runner resolves `target.member`, coerces the textual arguments, prints
//! one line of result on success, or exits non-zero with a diagnostic on
//! stderr.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use crossbridge_core::{Bridge, Invocation};
//! use crossbridge_process::{ProcessBridge, ProcessConfig};
//! use std::path::Path;
//!
//! # async fn run() -> Result<(), crossbridge_core::BridgeError> {
//! let bridge = ProcessBridge::new(ProcessConfig::default());
//! bridge.initialize(Path::new("external-libs/hello-java.jar")).await?;
//!
//! let greeting = bridge
//!     .execute(&Invocation::new("com.example.HelloWorld", "sayHello").arg("World"))
//!     .await?;
//! assert_eq!(greeting, "Hello from Java: World [v1.0.0]");
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod runner;

pub use bridge::ProcessBridge;
pub use config::ProcessConfig;
