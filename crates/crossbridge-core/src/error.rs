use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure a bridge can surface to its caller.
///
/// Bridges never let a lower-level fault escape as anything other than one of
/// these variants; the management surface turns them into structured replies.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{bridge} bridge is not initialized; call initialize() first")]
    NotInitialized { bridge: &'static str },

    #[error("artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error("source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("invocation failed ({}): {stderr}", exit_label(.exit_code))]
    InvocationFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("malformed invocation: {0}")]
    MalformedInvocation(String),

    #[error("capabilities not injected; call inject_capabilities() first")]
    CapabilitiesNotInjected,

    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("callback limit reached: {0} registrations outstanding")]
    CallbackLimitReached(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".into(),
    }
}

/// Serializable discriminant of [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotInitialized,
    ArtifactNotFound,
    SourceNotFound,
    RuntimeUnavailable,
    InvocationFailed,
    ExecutionFailed,
    MalformedInvocation,
    CapabilitiesNotInjected,
    Timeout,
    CallbackLimitReached,
    Io,
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::NotInitialized { .. } => ErrorKind::NotInitialized,
            BridgeError::ArtifactNotFound(_) => ErrorKind::ArtifactNotFound,
            BridgeError::SourceNotFound(_) => ErrorKind::SourceNotFound,
            BridgeError::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            BridgeError::InvocationFailed { .. } => ErrorKind::InvocationFailed,
            BridgeError::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
            BridgeError::MalformedInvocation(_) => ErrorKind::MalformedInvocation,
            BridgeError::CapabilitiesNotInjected => ErrorKind::CapabilitiesNotInjected,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::CallbackLimitReached(_) => ErrorKind::CallbackLimitReached,
            BridgeError::Io(_) => ErrorKind::Io,
        }
    }

    /// Captured diagnostic text (stderr of the runner, thrown JS error), if any.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            BridgeError::InvocationFailed { stderr, .. } if !stderr.is_empty() => Some(stderr),
            BridgeError::ExecutionFailed(detail) => Some(detail),
            _ => None,
        }
    }
}

/// Errors raised by a host capability surface.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
