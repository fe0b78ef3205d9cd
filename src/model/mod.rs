mod bridge;
mod prompt;
mod registry;
mod stream;
mod types;

#[cfg(feature = "tch-backend")]
mod loader;

pub use bridge::generate;
pub use prompt::{END_OF_TURN, OCR_INSTRUCTION, render_chat_prompt};
pub use registry::ModelRegistry;
pub use stream::{Detokenize, TokenTextStream};
pub use types::{
    GenerationOutcome, GenerationParams, InferenceRequest, ModelLoader, ModelMetadata,
    StreamEvent, StreamSink, VisionLanguageModel,
};

#[cfg(feature = "tch-backend")]
pub use loader::TorchModelLoader;
