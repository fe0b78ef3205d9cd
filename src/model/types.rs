use std::{sync::Arc, time::Duration};

use image::RgbImage;
use serde::Serialize;

use crate::error::ServiceError;

/// One OCR call: the decoded cheque image plus the instruction sent with it.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub image: RgbImage,
    pub instruction: String,
}

/// Fixed decoding policy shared by every request.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub min_p: f64,
    #[serde(rename = "token_timeout_secs", serialize_with = "as_secs")]
    pub token_timeout: Duration,
    #[serde(skip)]
    pub stream_capacity: usize,
}

fn as_secs<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub path: String,
    pub device: String,
    pub dtype: String,
    pub size_bytes: u64,
    pub max_seq_length: usize,
}

/// Messages sent from the generation worker to the request thread.
#[derive(Debug)]
pub enum StreamEvent {
    /// The worker owns the compute device and is about to decode.
    Started,
    Fragment(String),
    Finished,
    Failed(ServiceError),
}

/// Accumulated result of one streamed generation.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub text: String,
    pub fragments: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// A loaded vision-language model together with its tokenizer.
pub trait VisionLanguageModel: Send + Sync {
    fn metadata(&self) -> ModelMetadata;

    /// Generates text for `request`, calling `sink.started()` once the model
    /// is free to run and then `sink.fragment()` for each decoded piece in
    /// order. Either call returns `false` once nobody is listening, after which
    /// generation should stop early.
    fn generate_stream(
        &self,
        request: &InferenceRequest,
        params: &GenerationParams,
        sink: &mut dyn StreamSink,
    ) -> Result<(), ServiceError>;
}

/// Receiving end of a streamed generation, as seen by the model.
pub trait StreamSink {
    fn started(&mut self) -> bool;
    fn fragment(&mut self, text: String) -> bool;
}

/// Materializes the model handle. Called at most once per successful load.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<Arc<dyn VisionLanguageModel>, ServiceError>;
}
