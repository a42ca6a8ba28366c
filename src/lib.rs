pub mod api;
pub mod audit;
pub mod config;
pub mod detection;
pub mod error;
pub mod gateway;
pub mod models;
pub mod security;

pub use config::Config;
pub use detection::{Defect, DefectLabel, DetectionResult, InferenceSource, Verdict};
pub use error::{GatewayError, Result};
pub use gateway::{DetectionGateway, DetectionRequest, GatewayComponents};
