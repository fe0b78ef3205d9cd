use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    config::AppConfig,
    error::ServiceError,
    imaging::{decode_base64_image, decode_image},
    model::{GenerationParams, InferenceRequest, ModelMetadata, ModelRegistry, OCR_INSTRUCTION},
    parser::parse_structured,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub params: GenerationParams,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_loaded: bool,
}

#[derive(Serialize)]
struct MetadataResponse {
    model_loaded: bool,
    model: Option<ModelMetadata>,
    generation: GenerationParams,
}

#[derive(Debug, Deserialize)]
struct PredictPayload {
    image: Option<String>,
    filename: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub success: bool,
    pub filename: String,
    pub raw_output: String,
    pub data: Option<Value>,
    pub processing_time: f64,
}

#[derive(Debug, Serialize)]
struct PredictFailure {
    success: bool,
    error: String,
    processing_time: f64,
}

/// Where the image bytes came from, before decoding.
enum Upload {
    File { filename: String, bytes: Vec<u8> },
    Base64 { filename: String, encoded: String },
}

pub fn build_router(config: Arc<AppConfig>, registry: Arc<ModelRegistry>) -> Router {
    let state = AppState {
        params: config.generation_params(),
        registry,
    };

    Router::new()
        .route("/health", get(health))
        .route("/metadata", get(metadata))
        .route("/predict", post(predict))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model_loaded: state.registry.is_loaded(),
    })
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    Json(MetadataResponse {
        model_loaded: state.registry.is_loaded(),
        model: state.registry.metadata(),
        generation: state.params.clone(),
    })
}

async fn predict(State(state): State<AppState>, request: Request) -> Response {
    let start = Instant::now();

    let upload = match read_upload(request).await {
        Ok(Some(upload)) => upload,
        Ok(None) => return ServiceError::MissingInput.into_response(),
        Err(err) => return failure(err, start),
    };

    match run_prediction(&state, upload).await {
        Ok((filename, raw_output)) => {
            let data = parse_structured(&raw_output);
            let processing_time = seconds_since(start);
            info!(%filename, processing_time, parsed = data.is_some(), "processed cheque");
            Json(PredictResponse {
                success: true,
                filename,
                raw_output,
                data,
                processing_time,
            })
            .into_response()
        }
        Err(err) => failure(err, start),
    }
}

async fn run_prediction(
    state: &AppState,
    upload: Upload,
) -> Result<(String, String), ServiceError> {
    let (filename, image) = decode_upload(upload).await?;
    info!(%filename, width = image.width(), height = image.height(), "processing image");

    let request = InferenceRequest {
        image,
        instruction: OCR_INSTRUCTION.to_string(),
    };
    let outcome = state.registry.generate(request, &state.params).await?;
    if outcome.timed_out {
        warn!(%filename, fragments = outcome.fragments, "returning output of a stalled generation");
    }
    info!(
        %filename,
        fragments = outcome.fragments,
        generation_ms = outcome.elapsed.as_millis() as u64,
        "generation complete"
    );
    Ok((filename, outcome.text))
}

async fn read_upload(request: Request) -> Result<Option<Upload>, ServiceError> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| upload_error(e.status(), e.body_text()))?;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| upload_error(e.status(), e.body_text()))?
        {
            if field.name() != Some("file") {
                continue;
            }
            let filename = field.file_name().unwrap_or("unknown").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| upload_error(e.status(), e.body_text()))?;
            return Ok(Some(Upload::File {
                filename,
                bytes: bytes.to_vec(),
            }));
        }
        Ok(None)
    } else if content_type.starts_with("application/json") {
        let Json(payload) = Json::<PredictPayload>::from_request(request, &())
            .await
            .map_err(|e| upload_error(e.status(), e.body_text()))?;
        Ok(payload.image.map(|encoded| Upload::Base64 {
            filename: payload.filename.unwrap_or_else(|| "upload.jpg".to_string()),
            encoded,
        }))
    } else {
        Ok(None)
    }
}

/// Body-limit rejections keep their 413; anything else is an unreadable upload.
fn upload_error(status: StatusCode, message: String) -> ServiceError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ServiceError::PayloadTooLarge(message)
    } else {
        ServiceError::Decode(message)
    }
}

async fn decode_upload(upload: Upload) -> Result<(String, RgbImage), ServiceError> {
    task::spawn_blocking(move || match upload {
        Upload::File { filename, bytes } => decode_image(&bytes).map(|image| (filename, image)),
        Upload::Base64 { filename, encoded } => {
            decode_base64_image(&encoded).map(|image| (filename, image))
        }
    })
    .await
    .map_err(|err| ServiceError::Other(format!("decode task failed: {err}")))?
}

fn failure(err: ServiceError, start: Instant) -> Response {
    let status = err.status();
    if status.is_server_error() {
        error!(error = %err, "prediction failed");
    } else {
        warn!(error = %err, %status, "rejected upload");
    }
    let body = PredictFailure {
        success: false,
        error: err.to_string(),
        processing_time: seconds_since(start),
    };
    (status, Json(body)).into_response()
}

fn seconds_since(start: Instant) -> f64 {
    (start.elapsed().as_secs_f64() * 100.0).round() / 100.0
}
