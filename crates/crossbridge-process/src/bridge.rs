use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crossbridge_core::invocation;
use crossbridge_core::{
    Bridge, BridgeError, BridgeFuture, BridgePhase, ExecuteRequest, Invocation, PerformanceStats,
    StatsRecorder, TelemetrySink, elapsed_ms,
};
use tokio::sync::Mutex;

use crate::config::ProcessConfig;
use crate::runner;

const NAME: &str = "process";

/// An artifact that passed `initialize`.
#[derive(Debug, Clone)]
struct ResolvedArtifact {
    path: PathBuf,
    search_path: OsString,
}

#[derive(Debug)]
struct ProcessState {
    phase: BridgePhase,
    artifact: Option<ResolvedArtifact>,
}

/// Bridge to an external interpreter, one fresh process per call.
///
/// There is no pooling and no channel back into a running process: a call
/// spawns the runner, waits for it to exit and reads its full output.
///
/// # Threading
///
/// `ProcessBridge` is `Send + Sync` and is typically wrapped in `Arc`. All
/// lifecycle calls pass through a FIFO call gate, so at most one runner process
/// is outstanding per bridge and queued calls run in arrival order. Phase and
/// telemetry reads never wait on the gate.
pub struct ProcessBridge {
    config: ProcessConfig,
    gate: Mutex<()>,
    state: RwLock<ProcessState>,
    stats: StatsRecorder,
}

impl ProcessBridge {
    pub fn new(config: ProcessConfig) -> Self {
        Self::with_stats(config, StatsRecorder::new(NAME))
    }

    pub fn with_telemetry(config: ProcessConfig, sink: Arc<dyn TelemetrySink>) -> Self {
        Self::with_stats(config, StatsRecorder::with_sink(NAME, sink))
    }

    fn with_stats(config: ProcessConfig, stats: StatsRecorder) -> Self {
        Self {
            config,
            gate: Mutex::new(()),
            state: RwLock::new(ProcessState {
                phase: BridgePhase::Uninitialized,
                artifact: None,
            }),
            stats,
        }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Absolute path of the bound artifact, while initialized.
    pub fn artifact_path(&self) -> Option<PathBuf> {
        self.read_state().artifact.as_ref().map(|a| a.path.clone())
    }

    /// Resolve the artifact, probe the interpreter and become `Ready`.
    ///
    /// `init_time_ms` is recorded whether or not this succeeds.
    pub async fn initialize_artifact(&self, location: &Path) -> Result<(), BridgeError> {
        let _gate = self.gate.lock().await;
        let started = Instant::now();
        self.transition(BridgePhase::Initializing, None);

        let result = self.resolve_and_probe(location).await;
        self.stats.record_init(started.elapsed());

        match result {
            Ok(artifact) => {
                tracing::info!(
                    artifact = %artifact.path.display(),
                    init_time_ms = self.stats.snapshot().init_time_ms,
                    "Process bridge initialized"
                );
                self.transition(BridgePhase::Ready, Some(artifact));
                Ok(())
            }
            Err(e) => {
                tracing::error!(location = %location.display(), error = %e, "Process bridge initialization failed");
                self.transition(BridgePhase::Uninitialized, None);
                Err(e)
            }
        }
    }

    /// Spawn the runner for `invocation` and return its trimmed stdout.
    pub async fn execute(&self, invocation: &Invocation) -> Result<String, BridgeError> {
        let _gate = self.gate.lock().await;
        let artifact = self.ready_artifact()?;

        let started = Instant::now();
        let result = self.run(&artifact, invocation).await;
        let elapsed = started.elapsed();
        self.stats.record_execute(elapsed);

        match &result {
            Ok(output) => tracing::info!(
                call = %invocation.qualified_name(),
                elapsed_ms = elapsed_ms(elapsed),
                output = %output,
                "Invocation succeeded"
            ),
            Err(e) => tracing::warn!(
                call = %invocation.qualified_name(),
                elapsed_ms = elapsed_ms(elapsed),
                error = %e,
                "Invocation failed"
            ),
        }
        result
    }

    /// Same dispatch as [`execute`](Self::execute), but the output is handed to
    /// `on_message` exactly once instead of being returned.
    ///
    /// The runner has already exited when its output is read, so this is a
    /// single deferred delivery rather than a live callback channel into the
    /// external process. On failure the handler is never called.
    pub async fn execute_with_callback<F>(
        &self,
        invocation: &Invocation,
        on_message: F,
    ) -> Result<(), BridgeError>
    where
        F: FnOnce(String) + Send,
    {
        let output = self.execute(invocation).await?;
        on_message(output);
        Ok(())
    }

    /// Forget the artifact. In-flight calls finish first (they hold the gate).
    pub async fn dispose_artifact(&self) {
        let _gate = self.gate.lock().await;
        let was = self.read_state().phase;
        self.transition(BridgePhase::Disposed, None);
        if was != BridgePhase::Disposed {
            tracing::info!("Process bridge disposed");
        }
    }

    async fn resolve_and_probe(&self, location: &Path) -> Result<ResolvedArtifact, BridgeError> {
        let path = std::path::absolute(location)
            .map_err(|_| BridgeError::ArtifactNotFound(location.to_path_buf()))?;

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(BridgeError::ArtifactNotFound(path));
        }

        tracing::debug!(artifact = %path.display(), interpreter = %self.config.interpreter, "Probing interpreter");
        runner::probe(&self.config, self.config.execute_timeout()).await?;

        let search_path = runner::compose_search_path(&path, &self.config.runner_dir)?;
        Ok(ResolvedArtifact { path, search_path })
    }

    async fn run(
        &self,
        artifact: &ResolvedArtifact,
        invocation: &Invocation,
    ) -> Result<String, BridgeError> {
        let wire = invocation::encode(invocation)?;
        tracing::debug!(wire = %wire, "Dispatching invocation");

        let command = runner::invocation_command(&self.config, &artifact.search_path, invocation);
        let output = runner::capture(command, self.config.execute_timeout()).await?;
        runner::interpret(output)
    }

    fn ready_artifact(&self) -> Result<ResolvedArtifact, BridgeError> {
        let state = self.read_state();
        match (&state.phase, &state.artifact) {
            (BridgePhase::Ready, Some(artifact)) => Ok(artifact.clone()),
            _ => Err(BridgeError::NotInitialized { bridge: NAME }),
        }
    }

    fn transition(&self, phase: BridgePhase, artifact: Option<ResolvedArtifact>) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        state.phase = phase;
        state.artifact = artifact;
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ProcessState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }
}

impl Bridge for ProcessBridge {
    fn name(&self) -> &'static str {
        NAME
    }

    fn initialize<'a>(&'a self, location: &'a Path) -> BridgeFuture<'a, ()> {
        Box::pin(self.initialize_artifact(location))
    }

    fn dispatch<'a>(&'a self, request: ExecuteRequest) -> BridgeFuture<'a, serde_json::Value> {
        Box::pin(async move {
            match request {
                ExecuteRequest::Invocation(invocation) => self
                    .execute(&invocation)
                    .await
                    .map(serde_json::Value::String),
                ExecuteRequest::Fragment { .. } => Err(BridgeError::MalformedInvocation(
                    "process bridge expects a named invocation, not a code fragment".into(),
                )),
            }
        })
    }

    fn phase(&self) -> BridgePhase {
        self.read_state().phase
    }

    fn dispose<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(self.dispose_artifact())
    }

    fn stats(&self) -> PerformanceStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbridge_core::ErrorKind;

    #[tokio::test]
    async fn execute_before_initialize_fails() {
        let bridge = ProcessBridge::new(ProcessConfig::default());
        let err = bridge
            .execute(&Invocation::new("HelloWorld", "sayHello").arg("World"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
        assert_eq!(bridge.stats().call_count, 0);
    }

    #[tokio::test]
    async fn missing_artifact_is_reported_with_elapsed_time() {
        let tmp = tempfile::tempdir().unwrap();
        let bridge = ProcessBridge::new(ProcessConfig::default());

        let err = bridge
            .initialize(&tmp.path().join("missing.jar"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArtifactNotFound);
        assert!(!bridge.is_initialized());
        assert_eq!(bridge.phase(), BridgePhase::Uninitialized);
    }

    #[tokio::test]
    async fn fragments_are_rejected() {
        let bridge = ProcessBridge::new(ProcessConfig::default());
        let err = bridge
            .dispatch(ExecuteRequest::Fragment {
                code: "1 + 1".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedInvocation);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let bridge = ProcessBridge::new(ProcessConfig::default());
        bridge.dispose().await;
        bridge.dispose().await;
        assert!(!bridge.is_initialized());
        assert_eq!(bridge.phase(), BridgePhase::Disposed);
        assert!(bridge.artifact_path().is_none());
    }
}
