use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("model not found at {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("No file or image provided")]
    MissingInput,
    #[error("invalid image upload: {0}")]
    Decode(String),
    #[error("upload too large: {0}")]
    PayloadTooLarge(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("generation worker panicked")]
    WorkerPanicked,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::MissingInput => StatusCode::BAD_REQUEST,
            ServiceError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::Decode(_)
            | ServiceError::ModelNotFound(_)
            | ServiceError::Tokenizer(_)
            | ServiceError::Inference(_)
            | ServiceError::WorkerPanicked => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_input_renders_the_client_message() {
        assert_eq!(ServiceError::MissingInput.to_string(), "No file or image provided");
        assert_eq!(ServiceError::MissingInput.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn model_errors_are_server_errors() {
        let err = ServiceError::ModelNotFound(PathBuf::from("/models/missing"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("/models/missing"));
        assert_eq!(
            ServiceError::WorkerPanicked.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn undecodable_uploads_are_server_errors() {
        let err = ServiceError::Decode("invalid base64".into());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            ServiceError::PayloadTooLarge("length limit exceeded".into()).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
