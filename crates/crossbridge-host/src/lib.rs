//! Bridge host for crossbridge.
//!
//! [`BridgeHost`] builds and owns one process bridge, one sandbox bridge and
//! the storage surface the sandbox can be given, and exposes them as a set of
//! named operations that always answer with a [`Reply`]. [`server::serve`]
//! frames those operations as JSON lines over any async byte stream; the
//! `crossbridge serve` binary runs it on stdio.

pub mod config;
pub mod error;
pub mod host;
pub mod protocol;
pub mod server;

pub use config::HostConfig;
pub use error::HostError;
pub use host::BridgeHost;
pub use protocol::{Outbound, Reply, Request};
