use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("Session already exists for participant {0}")]
    DuplicateSession(String),

    #[error("No session for participant {0}")]
    SessionNotFound(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Voice connection not ready: {0}")]
    ConnectionNotReady(String),

    #[error("Transcription link error: {0}")]
    TranscriptionLink(String),

    #[error("Synthesis link error: {0}")]
    SynthesisLink(String),

    #[error("Reasoning service error: {0}")]
    ReasoningService(String),

    #[error("Malformed audio: {len} bytes is not a whole number of 16-bit samples")]
    MalformedAudio { len: usize },

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Playback did not finish within {0}s")]
    PlaybackTimeout(u64),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Errors that end playback should release capture suppression.
    pub fn is_playback_failure(&self) -> bool {
        matches!(
            self,
            Self::SynthesisLink(_) | Self::Playback(_) | Self::PlaybackTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_audio_message() {
        let err = ParleyError::MalformedAudio { len: 7 };
        assert!(err.to_string().contains("7 bytes"));
    }

    #[test]
    fn test_playback_failure_classification() {
        assert!(ParleyError::SynthesisLink("closed".into()).is_playback_failure());
        assert!(ParleyError::PlaybackTimeout(60).is_playback_failure());
        assert!(!ParleyError::ReasoningService("quota".into()).is_playback_failure());
    }
}
