pub mod config;
pub mod error;
pub mod imaging;
pub mod model;
pub mod parser;
pub mod server;

pub use config::AppConfig;
pub use error::ServiceError;
pub use model::{InferenceRequest, ModelLoader, ModelRegistry, VisionLanguageModel};
pub use server::build_router;
