use std::{fs, path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use tch::{Device, IValue, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;
use tracing::debug;

use crate::{
    config::AppConfig,
    error::ServiceError,
    imaging::to_normalized_chw,
    model::{
        GenerationParams, InferenceRequest, ModelLoader, ModelMetadata, StreamSink,
        VisionLanguageModel,
        prompt::{END_OF_TURN, render_chat_prompt},
        stream::TokenTextStream,
    },
};

/// Loads a traced vision-language model from a directory holding the
/// TorchScript module and its `tokenizer.json`.
///
/// The module takes `(pixel_values [1, 3, H, W], input_ids [1, seq])` and
/// returns logits `[1, seq, vocab]`, either bare or as the first tuple element.
pub struct TorchModelLoader {
    model_dir: PathBuf,
    module_path: PathBuf,
    tokenizer_path: PathBuf,
    device: Device,
    max_seq_length: usize,
    image_size: u32,
}

impl TorchModelLoader {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model_dir: config.model_path.clone(),
            module_path: config.model_path.join(&config.model_file),
            tokenizer_path: config.model_path.join(&config.tokenizer_file),
            device: config.device,
            max_seq_length: config.max_seq_length,
            image_size: config.image_size,
        }
    }
}

impl ModelLoader for TorchModelLoader {
    fn load(&self) -> Result<Arc<dyn VisionLanguageModel>, ServiceError> {
        for path in [&self.model_dir, &self.module_path, &self.tokenizer_path] {
            if !path.exists() {
                return Err(ServiceError::ModelNotFound(path.clone()));
            }
        }

        let size_bytes = fs::metadata(&self.module_path)?.len();
        // half kernels are GPU-only in libtorch
        let kind = if self.device.is_cuda() {
            Kind::Half
        } else {
            Kind::Float
        };

        let mut module = tch::CModule::load_on_device(&self.module_path, self.device)
            .map_err(|e| ServiceError::Inference(e.to_string()))?;
        module.set_eval();
        module.to(self.device, kind, false);

        let tokenizer = Tokenizer::from_file(&self.tokenizer_path)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let end_of_turn_id = tokenizer.token_to_id(END_OF_TURN).ok_or_else(|| {
            ServiceError::Tokenizer(format!("tokenizer has no {END_OF_TURN} token"))
        })?;

        let name = self
            .model_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());

        Ok(Arc::new(TorchVisionModel {
            name,
            path: self.model_dir.display().to_string(),
            device: self.device,
            kind,
            size_bytes,
            max_seq_length: self.max_seq_length,
            image_size: self.image_size,
            tokenizer,
            end_of_turn_id,
            module: Mutex::new(module),
        }))
    }
}

pub struct TorchVisionModel {
    name: String,
    path: String,
    device: Device,
    kind: Kind,
    size_bytes: u64,
    max_seq_length: usize,
    image_size: u32,
    tokenizer: Tokenizer,
    end_of_turn_id: u32,
    module: Mutex<tch::CModule>,
}

impl TorchVisionModel {
    fn pixel_values(&self, request: &InferenceRequest) -> Tensor {
        let side = self.image_size as i64;
        let data = to_normalized_chw(&request.image, self.image_size);
        Tensor::from_slice(&data)
            .reshape([1, 3, side, side])
            .to_kind(self.kind)
            .to(self.device)
    }
}

impl VisionLanguageModel for TorchVisionModel {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            name: self.name.clone(),
            path: self.path.clone(),
            device: format!("{:?}", self.device),
            dtype: match self.kind {
                Kind::Half => "float16".to_string(),
                _ => "float32".to_string(),
            },
            size_bytes: self.size_bytes,
            max_seq_length: self.max_seq_length,
        }
    }

    fn generate_stream(
        &self,
        request: &InferenceRequest,
        params: &GenerationParams,
        sink: &mut dyn StreamSink,
    ) -> Result<(), ServiceError> {
        let prompt = render_chat_prompt(&request.instruction);
        let encoding = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let prompt_len = input_ids.len();
        if prompt_len >= self.max_seq_length {
            return Err(ServiceError::Inference(format!(
                "prompt of {prompt_len} tokens leaves no room within max sequence length {}",
                self.max_seq_length
            )));
        }
        let budget = params.max_new_tokens.min(self.max_seq_length - prompt_len);

        let pixel_values = self.pixel_values(request);
        let mut text_stream = TokenTextStream::new();

        no_grad(|| {
            let module = self.module.lock();
            if !sink.started() {
                debug!("stream consumer went away while waiting for the model");
                return Ok(());
            }

            for _ in 0..budget {
                let input_tensor = Tensor::from_slice(&input_ids)
                    .reshape([1, input_ids.len() as i64])
                    .to(self.device);

                let output = module
                    .forward_is(&[
                        IValue::Tensor(pixel_values.shallow_clone()),
                        IValue::Tensor(input_tensor),
                    ])
                    .map_err(|e| ServiceError::Inference(e.to_string()))?;

                let logits = match output {
                    IValue::Tensor(t) => t,
                    IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                        IValue::Tensor(t) => t.shallow_clone(),
                        _ => {
                            return Err(ServiceError::Inference(
                                "Expected tensor as first tuple element".into(),
                            ));
                        }
                    },
                    _ => {
                        return Err(ServiceError::Inference(
                            "Unexpected model output format".into(),
                        ));
                    }
                };

                let last_logits = logits.select(1, -1).squeeze();
                let next_token_id = sample_min_p(&last_logits, params.temperature, params.min_p);
                input_ids.push(next_token_id);

                let token = next_token_id as u32;
                if let Some(fragment) = text_stream.push(&self.tokenizer, token)? {
                    if !sink.fragment(fragment) {
                        debug!("stream consumer went away, stopping generation");
                        return Ok(());
                    }
                }
                if token == self.end_of_turn_id {
                    break;
                }
            }

            if let Some(fragment) = text_stream.flush(&self.tokenizer)? {
                sink.fragment(fragment);
            }
            Ok::<(), ServiceError>(())
        })
    }
}

/// Temperature-scaled sampling restricted to tokens whose probability is at
/// least `min_p` times the most likely token's.
fn sample_min_p(logits: &Tensor, temperature: f64, min_p: f64) -> i64 {
    let logits = logits.to_kind(Kind::Float);
    if temperature <= 0.0 {
        return logits.argmax(-1, false).int64_value(&[]);
    }
    let probs = (logits / temperature).softmax(-1, Kind::Float);
    let max_prob = probs.max().double_value(&[]);
    let mask = probs.lt(min_p * max_prob);
    probs
        .masked_fill(&mask, 0.0)
        .multinomial(1, false)
        .int64_value(&[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_p_never_picks_filtered_tokens() {
        // token 2 dominates; tokens 0 and 1 fall below 0.5 * max
        let logits = Tensor::from_slice(&[0.0f32, 1.0, 5.0]);
        for _ in 0..20 {
            assert_eq!(sample_min_p(&logits, 1.0, 0.5), 2);
        }
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let logits = Tensor::from_slice(&[0.3f32, 2.0, 1.0]);
        assert_eq!(sample_min_p(&logits, 0.0, 0.1), 1);
    }

    #[test]
    fn missing_model_directory_is_reported() {
        let loader = TorchModelLoader {
            model_dir: PathBuf::from("/definitely/not/here"),
            module_path: PathBuf::from("/definitely/not/here/model.pt"),
            tokenizer_path: PathBuf::from("/definitely/not/here/tokenizer.json"),
            device: Device::Cpu,
            max_seq_length: 1024,
            image_size: 448,
        };
        match loader.load() {
            Err(ServiceError::ModelNotFound(path)) => {
                assert_eq!(path, PathBuf::from("/definitely/not/here"))
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("load should fail"),
        }
    }
}
