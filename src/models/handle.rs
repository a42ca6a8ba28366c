// ARCHITECTURE: Model Handle - Shared Inference Lifecycle and Admission
//
// STATE MACHINE:
// UNINITIALIZED --load ok--> READY
// UNINITIALIZED --load err / no runtime--> FAILED
// READY --transient failure or timeout--> DEGRADED
// DEGRADED --success--> READY
// READY | DEGRADED --unrecoverable failure or invocation cap--> FAILED
// any --reload--> UNINITIALIZED --load--> READY | FAILED
//
// FAILED is terminal until an explicit reload. Every state change goes
// through `apply_transition`, which rejects anything not listed above.
//
// ADMISSION:
// - At most `max_concurrent` invocations run at once; excess callers wait
//   up to `queue_budget` for a permit, then get ResourceExhausted
// - Each invocation is wrapped in a hard timeout; on expiry the backend
//   future is dropped, its permit released, and Timeout reported
// - A lifetime invocation cap marks the handle FAILED once exceeded

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use super::traits::{InferenceBackend, InferenceError, ModelState};
use crate::{detection::RawDetection, security::validator::ValidatedImage};

// CONFIGURATION: ModelHandleConfig
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHandleConfig {
    pub timeout_ms: u64,        // Hard per-invocation deadline (default: 5s)
    pub max_concurrent: usize,  // Simultaneous invocations (default: 2)
    pub queue_budget_ms: u64,   // Longest wait for a free slot (default: 250ms)
    pub max_invocations: u64,   // Lifetime cap before FAILED (default: 100k)
}

impl Default for ModelHandleConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_concurrent: 2,
            queue_budget_ms: 250,
            max_invocations: 100_000,
        }
    }
}

impl ModelHandleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn queue_budget(&self) -> Duration {
        Duration::from_millis(self.queue_budget_ms)
    }
}

/// Point-in-time view of the handle for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub state: ModelState,
    pub backend: Option<String>,
    pub runtime_available: bool,
    pub invocations: u64,
    pub max_invocations: u64,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub last_error: Option<String>,
    pub state_since: DateTime<Utc>,
}

#[derive(Debug)]
struct Lifecycle {
    state: ModelState,
    since: DateTime<Utc>,
    last_error: Option<String>,
}

// CORE SYSTEM: ModelHandle
#[derive(Debug)]
pub struct ModelHandle {
    config: ModelHandleConfig,
    backend: Option<Arc<dyn InferenceBackend>>,
    lifecycle: RwLock<Lifecycle>,
    permits: Arc<Semaphore>,
    invocations: AtomicU64,
    runtime_available: AtomicBool,
}

impl ModelHandle {
    /// Creates an UNINITIALIZED handle. `None` means no runtime is configured.
    pub fn new(backend: Option<Arc<dyn InferenceBackend>>) -> Self {
        Self::with_config(ModelHandleConfig::default(), backend)
    }

    pub fn with_config(config: ModelHandleConfig, backend: Option<Arc<dyn InferenceBackend>>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            backend,
            lifecycle: RwLock::new(Lifecycle {
                state: ModelState::Uninitialized,
                since: Utc::now(),
                last_error: None,
            }),
            permits,
            invocations: AtomicU64::new(0),
            runtime_available: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ModelHandleConfig {
        &self.config
    }

    // LIFECYCLE: Probe the backend once and settle into READY or FAILED
    pub async fn initialize(&self) -> ModelState {
        let Some(backend) = self.backend.clone() else {
            self.runtime_available.store(false, Ordering::Release);
            warn!("No inference runtime configured, all requests will be simulated");
            self.transition(ModelState::Failed, Some("no runtime configured".to_string())).await;
            return self.state().await;
        };

        info!(backend = backend.name(), "Loading inference backend");
        match backend.load().await {
            Ok(()) => {
                self.runtime_available.store(true, Ordering::Release);
                self.transition(ModelState::Ready, None).await;
            }
            Err(e) => {
                self.runtime_available.store(false, Ordering::Release);
                error!(backend = backend.name(), error = %e, "Inference backend failed to load");
                self.transition(ModelState::Failed, Some(e.to_string())).await;
            }
        }
        self.state().await
    }

    /// Leaves FAILED (or any state) by running the load sequence again.
    /// The lifetime invocation counter starts over.
    pub async fn reload(&self) -> ModelState {
        info!("Reloading inference backend");
        self.transition(ModelState::Uninitialized, None).await;
        self.invocations.store(0, Ordering::Release);
        self.initialize().await
    }

    /// Marks the handle FAILED, for maintenance or tests.
    pub async fn force_failed(&self, reason: &str) {
        self.transition(ModelState::Failed, Some(reason.to_string())).await;
    }

    pub async fn state(&self) -> ModelState {
        self.lifecycle.read().await.state
    }

    /// True when invocations are accepted (READY or DEGRADED).
    pub async fn is_ready(&self) -> bool {
        matches!(self.state().await, ModelState::Ready | ModelState::Degraded)
    }

    /// Whether a runtime answered its readiness probe at the last initialization.
    pub fn runtime_available(&self) -> bool {
        self.runtime_available.load(Ordering::Acquire)
    }

    pub async fn status(&self) -> ModelStatus {
        let lifecycle = self.lifecycle.read().await;
        let max_concurrent = self.config.max_concurrent.max(1);
        ModelStatus {
            state: lifecycle.state,
            backend: self.backend.as_ref().map(|b| b.name().to_string()),
            runtime_available: self.runtime_available(),
            invocations: self.invocations.load(Ordering::Acquire),
            max_invocations: self.config.max_invocations,
            in_flight: max_concurrent.saturating_sub(self.permits.available_permits()),
            max_concurrent,
            last_error: lifecycle.last_error.clone(),
            state_since: lifecycle.since,
        }
    }

    // CORE FUNCTION: Run one bounded, cancellable invocation
    pub async fn invoke(
        &self,
        image: &ValidatedImage,
        timeout: Duration,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        let state = self.state().await;
        let backend = match (&self.backend, state) {
            (Some(backend), ModelState::Ready | ModelState::Degraded) => backend.clone(),
            _ => return Err(InferenceError::Unavailable(state)),
        };

        let _permit = match tokio::time::timeout(
            self.config.queue_budget(),
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(InferenceError::Unavailable(state)),
            Err(_) => {
                warn!(
                    max_concurrent = self.config.max_concurrent,
                    queue_budget_ms = self.config.queue_budget_ms,
                    "Model invocation slots exhausted"
                );
                return Err(InferenceError::ResourceExhausted(format!(
                    "{} invocations already in flight",
                    self.config.max_concurrent
                )));
            }
        };

        // State may have moved while this caller waited for a slot
        let state = self.state().await;
        if !matches!(state, ModelState::Ready | ModelState::Degraded) {
            return Err(InferenceError::Unavailable(state));
        }

        let count = self.invocations.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.config.max_invocations {
            let err = InferenceError::Unrecoverable(format!(
                "lifetime invocation cap of {} reached",
                self.config.max_invocations
            ));
            self.record_outcome(&err).await;
            return Err(err);
        }

        let outcome = match tokio::time::timeout(timeout, backend.infer(image)).await {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Timeout {
                after_ms: timeout.as_millis() as u64,
            }),
        };

        match &outcome {
            Ok(detections) => {
                debug!(detections = detections.len(), invocation = count, "Model invocation succeeded");
                self.recover().await;
            }
            Err(e) => self.record_outcome(e).await,
        }
        outcome
    }

    async fn record_outcome(&self, err: &InferenceError) {
        if err.is_transient() {
            warn!(error = %err, "Transient model failure");
            self.transition(ModelState::Degraded, Some(err.to_string())).await;
        } else if matches!(err, InferenceError::Unrecoverable(_)) {
            error!(error = %err, "Unrecoverable model failure");
            self.transition(ModelState::Failed, Some(err.to_string())).await;
        }
    }

    async fn recover(&self) {
        let mut lifecycle = self.lifecycle.write().await;
        if lifecycle.state == ModelState::Degraded {
            apply_transition(&mut lifecycle, ModelState::Ready, None);
        }
    }

    async fn transition(&self, to: ModelState, reason: Option<String>) -> bool {
        let mut lifecycle = self.lifecycle.write().await;
        apply_transition(&mut lifecycle, to, reason)
    }
}

// TRANSITION: The only place the state changes
fn apply_transition(lifecycle: &mut Lifecycle, to: ModelState, reason: Option<String>) -> bool {
    let from = lifecycle.state;

    if reason.is_some() {
        lifecycle.last_error = reason.clone();
    }
    if from == to {
        return true;
    }

    let allowed = matches!(
        (from, to),
        (_, ModelState::Uninitialized)
            | (ModelState::Uninitialized, ModelState::Ready | ModelState::Failed)
            | (ModelState::Ready, ModelState::Degraded | ModelState::Failed)
            | (ModelState::Degraded, ModelState::Ready | ModelState::Failed)
    );
    if !allowed {
        debug!(from = %from, to = %to, "Ignoring transition");
        return false;
    }

    lifecycle.state = to;
    lifecycle.since = Utc::now();
    if to == ModelState::Ready {
        lifecycle.last_error = None;
    }

    match to {
        ModelState::Failed => error!(from = %from, to = %to, reason = ?reason, "Model handle transitioned"),
        ModelState::Degraded => warn!(from = %from, to = %to, reason = ?reason, "Model handle transitioned"),
        _ => info!(from = %from, to = %to, "Model handle transitioned"),
    }
    true
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::security::validator::ImageFormat;

    #[derive(Debug, Default)]
    struct ScriptedBackend {
        load_error: Option<InferenceError>,
        delay: Duration,
        script: Mutex<VecDeque<Result<Vec<RawDetection>, InferenceError>>>,
    }

    impl ScriptedBackend {
        fn with_script(script: Vec<Result<Vec<RawDetection>, InferenceError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn load(&self) -> Result<(), InferenceError> {
            match &self.load_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        async fn infer(&self, _image: &ValidatedImage) -> Result<Vec<RawDetection>, InferenceError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.script.lock().await.pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    fn image() -> ValidatedImage {
        ValidatedImage {
            bytes: vec![0u8; 128].into(),
            width: 64,
            height: 64,
            channels: 3,
            format: ImageFormat::Png,
        }
    }

    fn crack() -> RawDetection {
        RawDetection {
            label: "crack".to_string(),
            confidence: 0.9,
            bbox: [1.0, 1.0, 20.0, 20.0],
        }
    }

    async fn ready_handle(backend: ScriptedBackend, config: ModelHandleConfig) -> Arc<ModelHandle> {
        let handle = Arc::new(ModelHandle::with_config(config, Some(Arc::new(backend))));
        assert_eq!(handle.initialize().await, ModelState::Ready);
        handle
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn missing_runtime_fails_at_startup() {
        let handle = ModelHandle::new(None);
        assert_eq!(handle.state().await, ModelState::Uninitialized);
        assert_eq!(handle.initialize().await, ModelState::Failed);
        assert!(!handle.runtime_available());
        assert!(!handle.is_ready().await);

        let err = handle.invoke(&image(), TIMEOUT).await.unwrap_err();
        assert_eq!(err, InferenceError::Unavailable(ModelState::Failed));
    }

    #[tokio::test]
    async fn failed_load_is_failed() {
        let backend = ScriptedBackend {
            load_error: Some(InferenceError::Unrecoverable("incompatible runtime".into())),
            ..Default::default()
        };
        let handle = ModelHandle::new(Some(Arc::new(backend)));
        assert_eq!(handle.initialize().await, ModelState::Failed);
        assert_eq!(handle.status().await.last_error.as_deref(), Some("unrecoverable inference failure: incompatible runtime"));
    }

    #[tokio::test]
    async fn uninitialized_handle_rejects_invocations() {
        let handle = ModelHandle::new(Some(Arc::new(ScriptedBackend::default())));
        let err = handle.invoke(&image(), TIMEOUT).await.unwrap_err();
        assert_eq!(err, InferenceError::Unavailable(ModelState::Uninitialized));
    }

    #[tokio::test]
    async fn transient_failure_degrades_and_success_recovers() {
        let backend = ScriptedBackend::with_script(vec![
            Err(InferenceError::Transient("503".into())),
            Ok(vec![crack()]),
        ]);
        let handle = ready_handle(backend, ModelHandleConfig::default()).await;

        assert!(handle.invoke(&image(), TIMEOUT).await.is_err());
        assert_eq!(handle.state().await, ModelState::Degraded);
        assert!(handle.is_ready().await);

        let detections = handle.invoke(&image(), TIMEOUT).await.unwrap();
        assert_eq!(detections, vec![crack()]);
        assert_eq!(handle.state().await, ModelState::Ready);
        assert_eq!(handle.status().await.invocations, 2);
    }

    #[tokio::test]
    async fn unrecoverable_failure_is_terminal_until_reload() {
        let backend = ScriptedBackend::with_script(vec![Err(InferenceError::Unrecoverable("schema".into()))]);
        let handle = ready_handle(backend, ModelHandleConfig::default()).await;

        assert!(handle.invoke(&image(), TIMEOUT).await.is_err());
        assert_eq!(handle.state().await, ModelState::Failed);
        assert!(matches!(
            handle.invoke(&image(), TIMEOUT).await,
            Err(InferenceError::Unavailable(ModelState::Failed))
        ));

        assert_eq!(handle.reload().await, ModelState::Ready);
        assert!(handle.invoke(&image(), TIMEOUT).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_and_degrades() {
        let backend = ScriptedBackend {
            delay: Duration::from_secs(30),
            ..Default::default()
        };
        let handle = ready_handle(backend, ModelHandleConfig::default()).await;

        let err = handle.invoke(&image(), TIMEOUT).await.unwrap_err();
        assert_eq!(err, InferenceError::Timeout { after_ms: 5_000 });
        assert_eq!(handle.state().await, ModelState::Degraded);
        assert_eq!(handle.status().await.in_flight, 0);
    }

    #[tokio::test]
    async fn invocation_cap_marks_failed() {
        let config = ModelHandleConfig {
            max_invocations: 2,
            ..Default::default()
        };
        let handle = ready_handle(ScriptedBackend::default(), config).await;

        assert!(handle.invoke(&image(), TIMEOUT).await.is_ok());
        assert!(handle.invoke(&image(), TIMEOUT).await.is_ok());
        assert!(matches!(
            handle.invoke(&image(), TIMEOUT).await,
            Err(InferenceError::Unrecoverable(_))
        ));
        assert_eq!(handle.state().await, ModelState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_slots_are_resource_exhausted() {
        let config = ModelHandleConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let backend = ScriptedBackend {
            delay: Duration::from_secs(2),
            ..Default::default()
        };
        let handle = ready_handle(backend, config).await;

        let busy = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.invoke(&image(), TIMEOUT).await })
        };
        while handle.status().await.in_flight == 0 {
            tokio::task::yield_now().await;
        }

        let err = handle.invoke(&image(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, InferenceError::ResourceExhausted(_)));
        assert_eq!(handle.state().await, ModelState::Ready);

        assert!(busy.await.unwrap().is_ok());
        assert_eq!(handle.status().await.invocations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_caller_sees_failure_of_the_call_ahead() {
        let config = ModelHandleConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let backend = ScriptedBackend {
            delay: Duration::from_millis(100),
            ..ScriptedBackend::with_script(vec![
                Err(InferenceError::Unrecoverable("corrupted weights".into())),
                Ok(vec![crack()]),
            ])
        };
        let handle = ready_handle(backend, config).await;

        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.invoke(&image(), TIMEOUT).await })
        };
        while handle.status().await.in_flight == 0 {
            tokio::task::yield_now().await;
        }

        let second = handle.invoke(&image(), TIMEOUT).await;
        assert!(matches!(first.await.unwrap(), Err(InferenceError::Unrecoverable(_))));
        assert_eq!(second, Err(InferenceError::Unavailable(ModelState::Failed)));
        assert_eq!(handle.state().await, ModelState::Failed);
        assert_eq!(handle.status().await.invocations, 1);
    }

    #[tokio::test]
    async fn force_failed_disables_invocation() {
        let handle = ready_handle(ScriptedBackend::default(), ModelHandleConfig::default()).await;
        handle.force_failed("maintenance").await;

        let status = handle.status().await;
        assert_eq!(status.state, ModelState::Failed);
        assert_eq!(status.last_error.as_deref(), Some("maintenance"));
        assert_eq!(status.backend.as_deref(), Some("scripted"));
        assert!(!handle.is_ready().await);
    }
}
