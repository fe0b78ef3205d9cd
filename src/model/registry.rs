use std::{sync::Arc, time::Instant};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::task;
use tracing::info;

use crate::{
    error::ServiceError,
    model::{
        GenerationOutcome, GenerationParams, InferenceRequest, ModelLoader, ModelMetadata,
        VisionLanguageModel, bridge,
    },
};

/// Lazily loaded, process-wide model handle.
///
/// The first caller of [`ModelRegistry::ensure_loaded`] performs the load while
/// later concurrent callers wait on the same lock and then observe the same
/// handle. Once loaded, lookups never touch the lock again.
pub struct ModelRegistry {
    loader: Box<dyn ModelLoader>,
    handle: OnceCell<Arc<dyn VisionLanguageModel>>,
    load_lock: Mutex<()>,
}

impl ModelRegistry {
    pub fn new(loader: Box<dyn ModelLoader>) -> Self {
        Self {
            loader,
            handle: OnceCell::new(),
            load_lock: Mutex::new(()),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.get().is_some()
    }

    pub fn metadata(&self) -> Option<ModelMetadata> {
        self.handle.get().map(|model| model.metadata())
    }

    pub fn ensure_loaded(&self) -> Result<Arc<dyn VisionLanguageModel>, ServiceError> {
        if let Some(model) = self.handle.get() {
            return Ok(model.clone());
        }

        let _guard = self.load_lock.lock();
        if let Some(model) = self.handle.get() {
            return Ok(model.clone());
        }

        info!("loading OCR model");
        let start = Instant::now();
        let model = self.loader.load()?;
        let metadata = model.metadata();
        info!(
            name = %metadata.name,
            device = %metadata.device,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model loaded"
        );

        // still under the lock, so nobody else can have set it
        let _ = self.handle.set(model.clone());
        Ok(model)
    }

    /// Loads the model if needed, off the async runtime, and runs one
    /// streamed generation.
    pub async fn generate(
        self: &Arc<Self>,
        request: InferenceRequest,
        params: &GenerationParams,
    ) -> Result<GenerationOutcome, ServiceError> {
        let registry = self.clone();
        let model = task::spawn_blocking(move || registry.ensure_loaded())
            .await
            .map_err(|err| ServiceError::Inference(format!("model load task failed: {err}")))??;

        bridge::generate(model, request, params).await
    }
}
