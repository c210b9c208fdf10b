//! The thread that owns the QuickJS runtime.
//!
//! QuickJS values are not `Send`, so the runtime, its current context and
//! every host closure live on one dedicated OS thread. Async callers talk to
//! it through a command channel and get each answer back on a oneshot.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use crossbridge_core::{BridgeError, StorageApi, elapsed_ms};
use rquickjs::Runtime;
use tokio::sync::oneshot;

use crate::config::SandboxConfig;
use crate::context::{Failure, SandboxContext};

const WORKER_STACK_BYTES: usize = 8 * 1024 * 1024;

enum Command {
    /// Build a fresh context, run `source` in it and make it current. The
    /// previous context stays current if any step fails.
    Load {
        source: Arc<str>,
        storage: Option<Arc<dyn StorageApi>>,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    Eval {
        code: String,
        reply: oneshot::Sender<Result<serde_json::Value, BridgeError>>,
    },
}

/// Sending side of a worker. The thread exits once every clone is dropped.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    commands: mpsc::Sender<Command>,
}

impl WorkerHandle {
    /// Start the worker and wait until its runtime exists.
    pub(crate) async fn spawn(config: &SandboxConfig) -> Result<Self, BridgeError> {
        let (commands, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let config = config.clone();

        std::thread::Builder::new()
            .name("crossbridge-sandbox".into())
            .stack_size(WORKER_STACK_BYTES)
            .spawn(move || run(config, inbox, ready_tx))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self { commands }),
            Ok(Err(message)) => Err(BridgeError::RuntimeUnavailable(message)),
            Err(_) => Err(BridgeError::RuntimeUnavailable(
                "sandbox worker exited during startup".into(),
            )),
        }
    }

    pub(crate) async fn load(
        &self,
        source: Arc<str>,
        storage: Option<Arc<dyn StorageApi>>,
    ) -> Result<(), BridgeError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Load {
            source,
            storage,
            reply,
        })?;
        response.await.map_err(|_| worker_stopped())?
    }

    pub(crate) async fn eval(&self, code: String) -> Result<serde_json::Value, BridgeError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Eval { code, reply })?;
        response.await.map_err(|_| worker_stopped())?
    }

    fn send(&self, command: Command) -> Result<(), BridgeError> {
        self.commands.send(command).map_err(|_| worker_stopped())
    }
}

fn worker_stopped() -> BridgeError {
    BridgeError::ExecutionFailed("sandbox worker stopped".into())
}

fn run(
    config: SandboxConfig,
    inbox: mpsc::Receiver<Command>,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut engine = match Engine::new(&config) {
        Ok(engine) => {
            let _ = ready.send(Ok(()));
            engine
        }
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    tracing::debug!("Sandbox worker started");

    while let Ok(command) = inbox.recv() {
        match command {
            Command::Load {
                source,
                storage,
                reply,
            } => {
                let _ = reply.send(engine.load(&source, storage));
            }
            Command::Eval { code, reply } => {
                let _ = reply.send(engine.eval(&code));
            }
        }
    }

    drop(engine);
    tracing::debug!("Sandbox worker stopped");
}

/// Deadline shared with the runtime's interrupt handler.
#[derive(Default)]
struct Watchdog {
    deadline: Cell<Option<Instant>>,
    tripped: Cell<bool>,
}

impl Watchdog {
    fn arm(&self, limit: Option<Duration>) -> Option<Instant> {
        let deadline = limit.map(|limit| Instant::now() + limit);
        self.deadline.set(deadline);
        self.tripped.set(false);
        deadline
    }

    /// Returns whether the deadline was hit since the last `arm`.
    fn disarm(&self) -> bool {
        self.deadline.set(None);
        self.tripped.replace(false)
    }

    fn expired(&self) -> bool {
        match self.deadline.get() {
            Some(deadline) if Instant::now() >= deadline => {
                self.tripped.set(true);
                true
            }
            _ => false,
        }
    }
}

struct Engine {
    // Field order matters: the context must drop before its runtime.
    current: Option<SandboxContext>,
    watchdog: Rc<Watchdog>,
    limit: Option<Duration>,
    runtime: Runtime,
}

impl Engine {
    fn new(config: &SandboxConfig) -> rquickjs::Result<Self> {
        let runtime = Runtime::new()?;
        if let Some(bytes) = config.memory_limit_bytes {
            runtime.set_memory_limit(bytes);
        }
        if let Some(bytes) = config.max_stack_bytes {
            runtime.set_max_stack_size(bytes);
        }

        let watchdog = Rc::new(Watchdog::default());
        let interrupt = watchdog.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.expired())));

        Ok(Self {
            current: None,
            watchdog,
            limit: config.execute_timeout(),
            runtime,
        })
    }

    fn load(
        &mut self,
        source: &str,
        storage: Option<Arc<dyn StorageApi>>,
    ) -> Result<(), BridgeError> {
        let with_storage = storage.is_some();
        let context = SandboxContext::build(&self.runtime, storage).map_err(|e| {
            BridgeError::ExecutionFailed(format!("failed to create sandbox context: {e}"))
        })?;

        self.watchdog.arm(self.limit);
        let result = context.evaluate_source(source);
        self.settle_outcome(result)?;

        self.current = Some(context);
        tracing::debug!(host_storage = with_storage, "Sandbox context replaced");
        Ok(())
    }

    fn eval(&self, code: &str) -> Result<serde_json::Value, BridgeError> {
        let Some(context) = self.current.as_ref() else {
            return Err(BridgeError::ExecutionFailed("no source loaded".into()));
        };

        let deadline = self.watchdog.arm(self.limit);
        let result = context.evaluate_fragment(code, deadline);
        self.settle_outcome(result)
    }

    fn settle_outcome<T>(&self, result: Result<T, Failure>) -> Result<T, BridgeError> {
        let tripped = self.watchdog.disarm();
        let timeout = || BridgeError::Timeout {
            after_ms: self.limit.map(elapsed_ms).unwrap_or(0),
        };

        match result {
            Ok(value) => Ok(value),
            Err(_) if tripped => Err(timeout()),
            Err(Failure::DeadlineExceeded) => Err(timeout()),
            Err(Failure::Thrown(message)) => Err(BridgeError::ExecutionFailed(message)),
            Err(Failure::Unsettled) => Err(BridgeError::ExecutionFailed(
                "fragment awaited a promise that can never settle".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbridge_core::ErrorKind;

    fn config(timeout_ms: u64) -> SandboxConfig {
        SandboxConfig {
            execute_timeout_ms: Some(timeout_ms),
            ..SandboxConfig::default()
        }
    }

    #[tokio::test]
    async fn eval_before_load_fails() {
        let worker = WorkerHandle::spawn(&SandboxConfig::default()).await.unwrap();
        let err = worker.eval("1".into()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
    }

    #[tokio::test]
    async fn busy_loop_is_interrupted() {
        let worker = WorkerHandle::spawn(&config(100)).await.unwrap();
        worker.load("".into(), None).await.unwrap();

        let err = worker.eval("while (true) {}".into()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        assert_eq!(worker.eval("'still usable'".into()).await.unwrap(), "still usable");
    }

    #[tokio::test]
    async fn failed_load_keeps_previous_context() {
        let worker = WorkerHandle::spawn(&SandboxConfig::default()).await.unwrap();
        worker
            .load("function greet() { return 'hi'; }".into(), None)
            .await
            .unwrap();

        let err = worker.load("function (".into(), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutionFailed);

        assert_eq!(worker.eval("greet()".into()).await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn runaway_recursion_fails_cleanly() {
        let worker = WorkerHandle::spawn(&SandboxConfig::default()).await.unwrap();
        worker.load("".into(), None).await.unwrap();

        let err = worker
            .eval("function dive(n) { return dive(n + 1) + 1; } dive(0)".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
    }

    #[tokio::test]
    async fn startup_does_not_hold_the_runtime_thread() {
        let ticker = async {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            "ticked"
        };
        let config_a = SandboxConfig::default();
        let config_b = SandboxConfig::default();
        let (first, second, ticked) = tokio::join!(
            WorkerHandle::spawn(&config_a),
            WorkerHandle::spawn(&config_b),
            ticker,
        );
        assert_eq!(ticked, "ticked");

        for worker in [first.unwrap(), second.unwrap()] {
            worker.load("var n = 2;".into(), None).await.unwrap();
            assert_eq!(worker.eval("n * 21".into()).await.unwrap(), 42);
        }
    }
}
