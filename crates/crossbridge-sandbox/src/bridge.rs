use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crossbridge_core::{
    Bridge, BridgeError, BridgeFuture, BridgePhase, ExecuteRequest, PerformanceStats,
    StatsRecorder, StorageApi, TelemetrySink, elapsed_ms,
};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::SandboxConfig;
use crate::worker::WorkerHandle;

const NAME: &str = "sandbox";

/// Source text that loaded successfully, kept for context rebuilds.
#[derive(Clone)]
struct LoadedSource {
    path: PathBuf,
    text: Arc<str>,
    digest: String,
}

struct SandboxState {
    phase: BridgePhase,
    worker: Option<WorkerHandle>,
    source: Option<LoadedSource>,
    capabilities: Option<Arc<dyn StorageApi>>,
}

/// Bridge to an in-process JavaScript sandbox.
///
/// `initialize` reads a source file and evaluates it in a fresh context whose
/// globals are restricted to the language built-ins, `console`, timers and,
/// once injected, `HostStorage`. Functions the source declares stay callable
/// from every later fragment.
///
/// Injecting capabilities into a ready bridge rebuilds the context and
/// replays the loaded source into it; the new context replaces the old one
/// only when the replay succeeds.
///
/// # Threading
///
/// Same discipline as the process bridge: one FIFO call gate for lifecycle
/// and execution, lock-free reads of phase and telemetry. Evaluation itself
/// happens on the sandbox worker thread.
pub struct SandboxBridge {
    config: SandboxConfig,
    gate: Mutex<()>,
    state: RwLock<SandboxState>,
    stats: StatsRecorder,
}

impl SandboxBridge {
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_stats(config, StatsRecorder::new(NAME))
    }

    pub fn with_telemetry(config: SandboxConfig, sink: Arc<dyn TelemetrySink>) -> Self {
        Self::with_stats(config, StatsRecorder::with_sink(NAME, sink))
    }

    fn with_stats(config: SandboxConfig, stats: StatsRecorder) -> Self {
        Self {
            config,
            gate: Mutex::new(()),
            state: RwLock::new(SandboxState {
                phase: BridgePhase::Uninitialized,
                worker: None,
                source: None,
                capabilities: None,
            }),
            stats,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Path of the loaded source, while initialized.
    pub fn source_path(&self) -> Option<PathBuf> {
        self.read_state().source.as_ref().map(|s| s.path.clone())
    }

    /// Hex SHA-256 of the loaded source, while initialized.
    pub fn source_digest(&self) -> Option<String> {
        self.read_state().source.as_ref().map(|s| s.digest.clone())
    }

    pub fn has_capabilities(&self) -> bool {
        self.read_state().capabilities.is_some()
    }

    /// Read the source at `location`, evaluate it in a new context and become
    /// `Ready`. A previously injected capability surface is installed into the
    /// new context.
    ///
    /// `init_time_ms` is recorded whether or not this succeeds.
    pub async fn initialize_source(&self, location: &Path) -> Result<(), BridgeError> {
        let _gate = self.gate.lock().await;
        let started = Instant::now();
        let capabilities = {
            let mut state = self.write_state();
            state.phase = BridgePhase::Initializing;
            state.worker = None;
            state.source = None;
            state.capabilities.clone()
        };

        let result = self.load(location, capabilities).await;
        self.stats.record_init(started.elapsed());

        let mut state = self.write_state();
        match result {
            Ok((worker, source)) => {
                tracing::info!(
                    source = %source.path.display(),
                    digest = %&source.digest[..12],
                    host_storage = state.capabilities.is_some(),
                    init_time_ms = self.stats.snapshot().init_time_ms,
                    "Sandbox bridge initialized"
                );
                state.phase = BridgePhase::Ready;
                state.worker = Some(worker);
                state.source = Some(source);
                Ok(())
            }
            Err(e) => {
                tracing::error!(location = %location.display(), error = %e, "Sandbox bridge initialization failed");
                state.phase = BridgePhase::Uninitialized;
                Err(e)
            }
        }
    }

    /// Evaluate `code` in the current context and return its settled value.
    pub async fn execute(&self, code: &str) -> Result<serde_json::Value, BridgeError> {
        let _gate = self.gate.lock().await;
        self.run(code).await
    }

    /// Make `surface` available as `HostStorage`.
    ///
    /// On a ready bridge the context is rebuilt and the source replayed right
    /// away; otherwise the surface is installed at the next `initialize`. If
    /// the rebuild fails the previous surface and context stay in place.
    pub async fn inject_capabilities(&self, surface: Arc<dyn StorageApi>) -> Result<(), BridgeError> {
        let _gate = self.gate.lock().await;
        let (previous, ready) = {
            let mut state = self.write_state();
            let previous = state.capabilities.replace(surface.clone());
            let ready = match (&state.phase, &state.worker, &state.source) {
                (BridgePhase::Ready, Some(worker), Some(source)) => {
                    Some((worker.clone(), source.clone()))
                }
                _ => None,
            };
            (previous, ready)
        };

        let Some((worker, source)) = ready else {
            tracing::info!("Capabilities stored; installed at next initialize");
            return Ok(());
        };

        match worker.load(source.text.clone(), Some(surface)).await {
            Ok(()) => {
                tracing::info!(
                    source = %source.path.display(),
                    digest = %&source.digest[..12],
                    "Sandbox context rebuilt with capabilities"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Capability injection failed; keeping previous context");
                self.write_state().capabilities = previous;
                Err(e)
            }
        }
    }

    /// [`execute`](Self::execute), refused unless a surface has been injected.
    pub async fn execute_with_capabilities(
        &self,
        code: &str,
    ) -> Result<serde_json::Value, BridgeError> {
        let _gate = self.gate.lock().await;
        if self.read_state().capabilities.is_none() {
            return Err(BridgeError::CapabilitiesNotInjected);
        }
        self.run(code).await
    }

    /// Tear down the context and forget the source and capabilities.
    pub async fn dispose_sandbox(&self) {
        let _gate = self.gate.lock().await;
        let mut state = self.write_state();
        let was = state.phase;
        state.phase = BridgePhase::Disposed;
        state.worker = None;
        state.source = None;
        state.capabilities = None;
        if was != BridgePhase::Disposed {
            tracing::info!("Sandbox bridge disposed");
        }
    }

    async fn load(
        &self,
        location: &Path,
        capabilities: Option<Arc<dyn StorageApi>>,
    ) -> Result<(WorkerHandle, LoadedSource), BridgeError> {
        let path = std::path::absolute(location)
            .map_err(|_| BridgeError::SourceNotFound(location.to_path_buf()))?;
        let is_file = tokio::fs::metadata(&path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(BridgeError::SourceNotFound(path));
        }

        let text: Arc<str> = tokio::fs::read_to_string(&path).await?.into();
        let digest = hex::encode(Sha256::digest(text.as_bytes()));
        tracing::debug!(source = %path.display(), bytes = text.len(), "Loading sandbox source");

        let worker = WorkerHandle::spawn(&self.config).await?;
        worker.load(text.clone(), capabilities).await?;
        Ok((worker, LoadedSource { path, text, digest }))
    }

    async fn run(&self, code: &str) -> Result<serde_json::Value, BridgeError> {
        let worker = self.ready_worker()?;

        let started = Instant::now();
        let result = worker.eval(code.to_owned()).await;
        let elapsed = started.elapsed();
        self.stats.record_execute(elapsed);

        match &result {
            Ok(_) => tracing::info!(
                elapsed_ms = elapsed_ms(elapsed),
                "Fragment evaluated"
            ),
            Err(e) => tracing::warn!(
                elapsed_ms = elapsed_ms(elapsed),
                error = %e,
                "Fragment failed"
            ),
        }
        result
    }

    fn ready_worker(&self) -> Result<WorkerHandle, BridgeError> {
        let state = self.read_state();
        match (&state.phase, &state.worker) {
            (BridgePhase::Ready, Some(worker)) => Ok(worker.clone()),
            _ => Err(BridgeError::NotInitialized { bridge: NAME }),
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, SandboxState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SandboxState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl Bridge for SandboxBridge {
    fn name(&self) -> &'static str {
        NAME
    }

    fn initialize<'a>(&'a self, location: &'a Path) -> BridgeFuture<'a, ()> {
        Box::pin(self.initialize_source(location))
    }

    fn dispatch<'a>(&'a self, request: ExecuteRequest) -> BridgeFuture<'a, serde_json::Value> {
        Box::pin(async move {
            match request {
                ExecuteRequest::Fragment { code } => self.execute(&code).await,
                ExecuteRequest::Invocation(invocation) => Err(BridgeError::MalformedInvocation(
                    format!(
                        "sandbox bridge expects a code fragment, not the invocation {}",
                        invocation.qualified_name()
                    ),
                )),
            }
        })
    }

    fn phase(&self) -> BridgePhase {
        self.read_state().phase
    }

    fn dispose<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(self.dispose_sandbox())
    }

    fn stats(&self) -> PerformanceStats {
        self.stats.snapshot()
    }
}
