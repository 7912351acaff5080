use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("Browser error: {0}")]
    Browser(String),
    #[error("Login failed: {0}")]
    Login(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<chromiumoxide::error::CdpError> for AppError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        AppError::Browser(e.to_string())
    }
}

impl From<rumqttc::ClientError> for AppError {
    fn from(e: rumqttc::ClientError) -> Self {
        AppError::Mqtt(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
