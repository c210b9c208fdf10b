use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::invocation::Invocation;
use crate::stats::PerformanceStats;

/// Boxed future returned by [`Bridge`] methods (keeps the trait dyn-compatible).
pub type BridgeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BridgeError>> + Send + 'a>>;

/// Lifecycle phase of a bridge instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgePhase {
    Uninitialized,
    Initializing,
    Ready,
    Disposed,
}

impl fmt::Display for BridgePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BridgePhase::Uninitialized => "uninitialized",
            BridgePhase::Initializing => "initializing",
            BridgePhase::Ready => "ready",
            BridgePhase::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

/// What a caller asks a bridge to run.
///
/// Process-isolated backends take a named [`Invocation`]; in-process backends
/// take a code fragment. A bridge rejects the shape it does not understand with
/// [`BridgeError::MalformedInvocation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExecuteRequest {
    Invocation(Invocation),
    Fragment { code: String },
}

/// A uniform initialize → execute → dispose lifecycle over one foreign
/// execution environment.
///
/// Each implementation owns exactly one underlying resource and serialises its
/// own lifecycle calls; `execute` before a successful `initialize` always fails
/// with [`BridgeError::NotInitialized`].
pub trait Bridge: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Bind the bridge to an artifact or source location.
    fn initialize<'a>(&'a self, location: &'a Path) -> BridgeFuture<'a, ()>;

    /// Run one request. Success values are JSON; process output is a string.
    fn dispatch<'a>(&'a self, request: ExecuteRequest) -> BridgeFuture<'a, serde_json::Value>;

    fn phase(&self) -> BridgePhase;

    fn is_initialized(&self) -> bool {
        self.phase() == BridgePhase::Ready
    }

    /// Release the bound resource. Calling it again is a no-op.
    fn dispose<'a>(&'a self) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    fn stats(&self) -> PerformanceStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_request_uses_tagged_json() {
        let req: ExecuteRequest = serde_json::from_value(serde_json::json!({
            "kind": "fragment",
            "code": "add(2,3)"
        }))
        .unwrap();
        assert_eq!(
            req,
            ExecuteRequest::Fragment {
                code: "add(2,3)".into()
            }
        );

        let req: ExecuteRequest = serde_json::from_value(serde_json::json!({
            "kind": "invocation",
            "target": "HelloWorld",
            "member": "sayHello",
            "arguments": ["World"]
        }))
        .unwrap();
        assert!(matches!(req, ExecuteRequest::Invocation(ref inv) if inv.member == "sayHello"));
    }

    #[test]
    fn phase_display_is_lowercase() {
        assert_eq!(BridgePhase::Ready.to_string(), "ready");
        assert_eq!(
            serde_json::to_string(&BridgePhase::Disposed).unwrap(),
            "\"disposed\""
        );
    }
}
