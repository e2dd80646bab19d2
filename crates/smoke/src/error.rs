//! Error types for the smoke harness

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SmokeError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server exited before it became ready: {0}")]
    ServerExited(String),

    #[error("Browser failed to launch: {0}")]
    Launch(String),

    #[error("Navigation to {url} timed out after {timeout_ms} ms")]
    NavigationTimeout { url: String, timeout_ms: u64 },

    #[error("Element not found: {matcher} ({reason})")]
    ElementNotFound { matcher: String, reason: String },

    #[error("Interrupt not observed: {0}")]
    InterruptNotObserved(String),

    #[error("Browser session is closed")]
    SessionClosed,

    #[error("Browser driver error: {0}")]
    Driver(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scenario parse error: {0}")]
    Scenario(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl SmokeError {
    pub(crate) fn not_found(matcher: impl ToString, reason: impl Into<String>) -> Self {
        SmokeError::ElementNotFound {
            matcher: matcher.to_string(),
            reason: reason.into(),
        }
    }
}

pub type SmokeResult<T> = Result<T, SmokeError>;
