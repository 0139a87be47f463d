//! Error types for the show.

use std::time::Duration;

use async_openai::error::{ApiError, OpenAIError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShowError {
    #[error("Topic provider error: {0}")]
    ExternalFetch(String),

    #[error("Dialogue generation failed for turn {index}: {reason}")]
    GenerationFailed { index: usize, reason: String },

    #[error("Speech synthesis error: {0}")]
    Synthesis(String),

    #[error("Playback for {speaker} did not drain within {waited:?}")]
    PlaybackDrainTimeout { speaker: String, waited: Duration },

    #[error("Only {found} distinct candidate topic(s) available, need 2")]
    InsufficientCandidates { found: usize },

    #[error("No voting window is open")]
    VotingNotOpen,

    #[error("Output channel for {0} already has an active writer")]
    ChannelBusy(String),

    #[error("Audio sink error: {0}")]
    Sink(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Could not fetch a starting topic: {0}")]
    StartupFetch(String),

    #[error("OpenAI API error: {0}")]
    OpenAIError(#[from] OpenAIError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

impl ShowError {
    /// Whether retrying the same external call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ShowError::Http(e) => http_transient(e),
            ShowError::ExternalFetch(_) => true,
            ShowError::OpenAIError(OpenAIError::Reqwest(e)) => http_transient(e),
            ShowError::OpenAIError(OpenAIError::ApiError(e)) => api_transient(e),
            _ => false,
        }
    }
}

fn http_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request()
}

/// Server errors arrive with no type or code; rate limits are tagged.
fn api_transient(e: &ApiError) -> bool {
    let is_rate_limit = |field: &Option<String>| {
        field.as_deref().is_some_and(|v| v.contains("rate_limit"))
    };
    let server_error = e.r#type.as_deref() == Some("server_error");
    (e.r#type.is_none() && e.code.is_none())
        || server_error
        || is_rate_limit(&e.r#type)
        || is_rate_limit(&e.code)
}
