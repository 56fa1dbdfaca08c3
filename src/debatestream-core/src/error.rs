//! Error types for the debate stream.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("OpenAI API error: {0}")]
    OpenAIError(#[from] async_openai::error::OpenAIError),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Text generation error: {0}")]
    GenerationError(String),

    #[error("TTS error: {0}")]
    TtsError(String),

    #[error("Render error: {0}")]
    RenderError(String),

    #[error("Presentation error: {0}")]
    PresentationError(String),

    #[error("API error: {status} {body}")]
    ApiError { status: u16, body: String },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        StreamError::WebSocketError(Box::new(err))
    }
}

impl StreamError {
    /// Whether a retry has any chance of succeeding.
    ///
    /// Configuration problems, failed render jobs and client-side HTTP
    /// errors (other than 408/429) are permanent; everything else is treated
    /// as a transport hiccup.
    pub fn is_transient(&self) -> bool {
        match self {
            StreamError::ConfigError(_) | StreamError::RenderError(_) => false,
            StreamError::ApiError { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            StreamError::HttpError(err) => match err.status() {
                Some(status) => status.is_server_error() || status.as_u16() == 429,
                None => true,
            },
            _ => true,
        }
    }
}

/// Cut a response body down to something that fits in a log line.
pub(crate) fn truncate_for_log(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let cut: String = body.chars().take(max_chars).collect();
    format!("{cut}...")
}
