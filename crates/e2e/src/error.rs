//! Error types for the end-to-end harness

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Control server failed to start: {0}")]
    ServerStartup(String),

    #[error("Control server health check failed after {0} attempts")]
    ServerHealthCheck(usize),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Agent error: {0}")]
    Agent(#[from] meshagent_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type E2eResult<T> = Result<T, E2eError>;
