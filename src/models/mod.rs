pub mod handle;
pub mod remote;
pub mod simulator;
pub mod traits;

pub use handle::{ModelHandle, ModelHandleConfig, ModelStatus};
pub use remote::{RemoteBackendConfig, RemoteVisionBackend};
pub use simulator::{FallbackSimulator, SimulatorConfig};
pub use traits::{InferenceBackend, InferenceError, ModelState};

use std::sync::Arc;

use tracing::info;

/// Builds and initializes the model handle for the configured runtime.
/// A missing URL yields a handle that settles in FAILED.
pub async fn create_production_model_handle(
    config: ModelHandleConfig,
    backend_url: Option<&str>,
) -> anyhow::Result<Arc<ModelHandle>> {
    let backend: Option<Arc<dyn InferenceBackend>> = match backend_url {
        Some(url) => Some(Arc::new(RemoteVisionBackend::new(RemoteBackendConfig::new(url))?)),
        None => None,
    };

    let handle = Arc::new(ModelHandle::with_config(config, backend));
    let state = handle.initialize().await;
    info!(state = %state, runtime_available = handle.runtime_available(), "Model handle initialized");
    Ok(handle)
}
