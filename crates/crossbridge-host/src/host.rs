use std::sync::Arc;

use crossbridge_core::{
    Bridge, BridgeError, CallbackEvent, CallbackRegistry, CallbackToken, LoggingTelemetry,
    MemoryStorage, TelemetrySink,
};
use crossbridge_process::ProcessBridge;
use crossbridge_sandbox::SandboxBridge;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::config::HostConfig;
use crate::protocol::{Reply, Request, invocation_from_wire};

/// Composition root: owns one bridge of each kind, the capability surface
/// handed to the sandbox, and the callback event channel.
///
/// Callback events are emitted on the channel returned by [`BridgeHost::new`].
/// Tokens minted through [`register_callback`](Self::register_callback) are
/// handled in-process by [`route_event`](Self::route_event); any other token
/// belongs to the remote caller and is left for the transport.
pub struct BridgeHost {
    process: Arc<ProcessBridge>,
    sandbox: Arc<SandboxBridge>,
    storage: Arc<MemoryStorage>,
    callbacks: Arc<CallbackRegistry>,
    events: mpsc::UnboundedSender<CallbackEvent>,
}

impl BridgeHost {
    pub fn new(config: &HostConfig) -> (Self, mpsc::UnboundedReceiver<CallbackEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();

        let (process, sandbox) = if config.telemetry.log_events {
            let sink: Arc<dyn TelemetrySink> = Arc::new(LoggingTelemetry);
            (
                ProcessBridge::with_telemetry(config.process.clone(), sink.clone()),
                SandboxBridge::with_telemetry(config.sandbox.clone(), sink),
            )
        } else {
            (
                ProcessBridge::new(config.process.clone()),
                SandboxBridge::new(config.sandbox.clone()),
            )
        };

        let callbacks = match config.callback_limit() {
            Some(limit) => CallbackRegistry::with_limit(limit),
            None => CallbackRegistry::new(),
        };

        let host = Self {
            process: Arc::new(process),
            sandbox: Arc::new(sandbox),
            storage: Arc::new(MemoryStorage::new()),
            callbacks: Arc::new(callbacks),
            events,
        };
        (host, receiver)
    }

    pub fn process(&self) -> &Arc<ProcessBridge> {
        &self.process
    }

    pub fn sandbox(&self) -> &Arc<SandboxBridge> {
        &self.sandbox
    }

    pub fn storage(&self) -> &Arc<MemoryStorage> {
        &self.storage
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    /// Register an in-process handler; pass the returned token with
    /// `process.executeWithCallback`.
    pub fn register_callback<F>(&self, handler: F) -> Result<CallbackToken, BridgeError>
    where
        F: FnOnce(String) + Send + 'static,
    {
        self.callbacks.register(handler)
    }

    /// Deliver `event` to an in-process registration, or hand it back when
    /// its token is not registered here.
    pub fn route_event(&self, event: CallbackEvent) -> Option<CallbackEvent> {
        if self.callbacks.deliver(&event.token, event.message.clone()) {
            None
        } else {
            Some(event)
        }
    }

    /// Run one management operation. Failures come back as `ok: false`
    /// replies, never as errors.
    pub async fn handle(&self, request: Request) -> Reply {
        let op = request.op();
        tracing::debug!(op, "Handling request");

        let reply = match request {
            Request::ProcessInitialize { path } => {
                Reply::from_unit(self.process.initialize_artifact(&path).await)
            }
            Request::ProcessExecute {
                target,
                member,
                args,
            } => match invocation_from_wire(target, member, &args) {
                Ok(invocation) => Reply::from_result(
                    self.process.execute(&invocation).await.map(Value::String),
                ),
                Err(e) => Reply::failure(&e),
            },
            Request::ProcessExecuteWithCallback {
                target,
                member,
                args,
                token,
            } => match invocation_from_wire(target, member, &args) {
                Ok(invocation) => {
                    let events = self.events.clone();
                    let event_token = token.clone();
                    let result = self
                        .process
                        .execute_with_callback(&invocation, move |message| {
                            let event = CallbackEvent {
                                token: event_token,
                                message,
                            };
                            if events.send(event).is_err() {
                                tracing::warn!("Callback event channel closed, event dropped");
                            }
                        })
                        .await;
                    // No event will follow a failed call
                    if result.is_err() && self.callbacks.cancel(&token) {
                        tracing::debug!(%token, "Released in-process callback");
                    }
                    Reply::from_unit(result)
                }
                Err(e) => {
                    self.callbacks.cancel(&token);
                    Reply::failure(&e)
                }
            },
            Request::ProcessGetStats => Reply::value(json!(self.process.stats())),
            Request::ProcessDispose => {
                self.process.dispose_artifact().await;
                Reply::done()
            }

            Request::SandboxInitialize { path } => {
                Reply::from_unit(self.sandbox.initialize_source(&path).await)
            }
            Request::SandboxExecute { code } => Reply::from_result(self.sandbox.execute(&code).await),
            Request::SandboxInjectCapabilities => Reply::from_unit(
                self.sandbox
                    .inject_capabilities(self.storage.clone())
                    .await,
            ),
            Request::SandboxExecuteWithCapabilities { code } => {
                Reply::from_result(self.sandbox.execute_with_capabilities(&code).await)
            }
            Request::SandboxGetStats => Reply::value(json!(self.sandbox.stats())),
            Request::SandboxDispose => {
                self.sandbox.dispose_sandbox().await;
                Reply::done()
            }

            Request::BridgesList => Reply::value(Value::Array(
                self.bridges().into_iter().map(describe).collect(),
            )),
        };

        if !reply.ok {
            tracing::warn!(op, error = ?reply.error, "Request failed");
        }
        reply
    }

    /// Dispose every bridge. Safe to call more than once.
    pub async fn shutdown(&self) {
        for bridge in self.bridges() {
            bridge.dispose().await;
        }
        tracing::info!(pending_callbacks = self.callbacks.pending(), "Bridge host shut down");
    }

    fn bridges(&self) -> Vec<&dyn Bridge> {
        vec![&*self.process as &dyn Bridge, &*self.sandbox]
    }
}

fn describe(bridge: &dyn Bridge) -> Value {
    json!({
        "name": bridge.name(),
        "phase": bridge.phase(),
        "stats": bridge.stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbridge_core::{BridgePhase, ErrorKind};
    use std::sync::Mutex;

    fn host() -> BridgeHost {
        BridgeHost::new(&HostConfig::default()).0
    }

    #[tokio::test]
    async fn execute_before_initialize_is_a_failure_reply() {
        let host = host();
        let reply = host
            .handle(Request::ProcessExecute {
                target: "HelloWorld".into(),
                member: "sayHello".into(),
                args: vec![json!("World")],
            })
            .await;
        assert!(!reply.ok);
        assert_eq!(reply.kind, Some(ErrorKind::NotInitialized));
    }

    #[tokio::test]
    async fn capability_gate_is_reported() {
        let host = host();
        let reply = host
            .handle(Request::SandboxExecuteWithCapabilities {
                code: "1".into(),
            })
            .await;
        assert_eq!(reply.kind, Some(ErrorKind::CapabilitiesNotInjected));
    }

    #[tokio::test]
    async fn lists_both_bridges() {
        let host = host();
        let reply = host.handle(Request::BridgesList).await;
        let list = reply.result.unwrap();
        assert_eq!(list[0]["name"], json!("process"));
        assert_eq!(list[1]["name"], json!("sandbox"));
        assert_eq!(list[1]["phase"], json!("uninitialized"));
        assert_eq!(list[0]["stats"]["callCount"], json!(0));
    }

    #[tokio::test]
    async fn stats_reply_uses_camel_case() {
        let host = host();
        let reply = host.handle(Request::SandboxGetStats).await;
        let stats = reply.result.unwrap();
        assert_eq!(
            stats,
            json!({"initTimeMs": 0, "lastExecuteTimeMs": 0, "callCount": 0})
        );
    }

    #[tokio::test]
    async fn shutdown_disposes_all() {
        let host = host();
        host.shutdown().await;
        assert_eq!(host.process().phase(), BridgePhase::Disposed);
        assert_eq!(host.sandbox().phase(), BridgePhase::Disposed);
    }

    #[test]
    fn registered_tokens_are_routed_locally() {
        let host = host();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let token = host
            .register_callback(move |msg| *sink.lock().unwrap() = Some(msg))
            .unwrap();

        let leftover = host.route_event(CallbackEvent {
            token: token.clone(),
            message: "hello".into(),
        });
        assert!(leftover.is_none());
        assert_eq!(seen.lock().unwrap().as_deref(), Some("hello"));

        let foreign = CallbackEvent {
            token: CallbackToken::from("remote-1"),
            message: "for the client".into(),
        };
        assert_eq!(host.route_event(foreign.clone()), Some(foreign));
    }

    #[test]
    fn callback_limit_comes_from_config() {
        let mut config = HostConfig::default();
        config.callbacks.max_pending = 1;
        let (host, _events) = BridgeHost::new(&config);

        host.register_callback(|_| {}).unwrap();
        let err = host.register_callback(|_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallbackLimitReached);
    }

    #[tokio::test]
    async fn failed_callback_call_releases_local_registration() {
        let mut config = HostConfig::default();
        config.callbacks.max_pending = 1;
        let (host, _events) = BridgeHost::new(&config);

        let token = host.register_callback(|_| {}).unwrap();
        let reply = host
            .handle(Request::ProcessExecuteWithCallback {
                target: "HelloWorld".into(),
                member: "sayHelloWithCallback".into(),
                args: vec![json!("Alice")],
                token,
            })
            .await;

        assert_eq!(reply.kind, Some(ErrorKind::NotInitialized));
        assert_eq!(host.callbacks().pending(), 0);
        assert!(host.register_callback(|_| {}).is_ok());
    }
}
