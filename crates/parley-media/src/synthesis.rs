//! Streaming speech synthesis over a persistent WebSocket (Murf stream-input).

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use parley_core::config::TtsConfig;
use parley_core::error::{ParleyError, Result};

const DEFAULT_STREAM_URL: &str = "wss://api.murf.ai/v1/speech/stream-input";

/// Events delivered by an open synthesis connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    /// Mono s16le audio fragment.
    Audio(Vec<u8>),
    /// Last fragment of the current utterance (possibly empty).
    FinalAudio(Vec<u8>),
    Error(String),
    /// The connection is gone; the sender side should be discarded.
    Closed,
}

/// A live synthesis connection. Each string sent on `text_tx` is one
/// complete utterance; dropping `text_tx` closes the connection.
pub struct SynthesisConnection {
    pub text_tx: mpsc::UnboundedSender<String>,
    pub events: mpsc::UnboundedReceiver<SynthesisEvent>,
}

#[async_trait]
pub trait SynthesisService: Send + Sync {
    /// Open a connection with the voice configuration already sent.
    async fn open(&self) -> Result<SynthesisConnection>;
}

/// Murf.ai streaming TTS client.
pub struct MurfSynthesizer {
    config: TtsConfig,
    api_key: String,
}

impl MurfSynthesizer {
    pub fn new(config: TtsConfig) -> Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| ParleyError::Config("No TTS API key configured".into()))?;
        Ok(Self { config, api_key })
    }

    pub fn stream_url(&self) -> String {
        build_stream_url(&self.config, &self.api_key)
    }

    fn voice_config(&self) -> serde_json::Value {
        serde_json::json!({
            "voice_config": {
                "voiceId": self.config.voice_id,
                "style": self.config.style,
            }
        })
    }
}

/// Build the stream-input URL for mono PCM at the configured rate.
pub fn build_stream_url(config: &TtsConfig, api_key: &str) -> String {
    let base = config.base_url.as_deref().unwrap_or(DEFAULT_STREAM_URL);
    format!(
        "{base}?api-key={}&sample_rate={}&channel_type=MONO&format=PCM",
        urlencoding::encode(api_key),
        config.sample_rate
    )
}

/// Decode one server frame. Frames with neither audio nor a final marker
/// yield `None`.
pub fn parse_frame(raw: &str) -> Option<SynthesisEvent> {
    let payload: serde_json::Value = serde_json::from_str(raw).ok()?;

    if let Some(err) = payload.get("error").and_then(serde_json::Value::as_str) {
        return Some(SynthesisEvent::Error(err.to_string()));
    }

    let audio = match payload.get("audio").and_then(serde_json::Value::as_str) {
        Some(b64) => match STANDARD.decode(b64) {
            Ok(bytes) => bytes,
            Err(e) => return Some(SynthesisEvent::Error(format!("bad audio payload: {e}"))),
        },
        None => Vec::new(),
    };

    let is_final = payload
        .get("isFinalAudio")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    match (is_final, audio.is_empty()) {
        (true, _) => Some(SynthesisEvent::FinalAudio(audio)),
        (false, false) => Some(SynthesisEvent::Audio(audio)),
        (false, true) => None,
    }
}

#[async_trait]
impl SynthesisService for MurfSynthesizer {
    async fn open(&self) -> Result<SynthesisConnection> {
        let url = self.stream_url();
        debug!(voice = %self.config.voice_id, "Opening synthesis connection");

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ParleyError::SynthesisLink(format!("connect failed: {e}")))?;
        let (mut write, mut read) = stream.split();

        write
            .send(Message::Text(self.voice_config().to_string().into()))
            .await
            .map_err(|e| ParleyError::SynthesisLink(format!("voice config failed: {e}")))?;
        info!("Synthesis connection open");

        let (text_tx, mut text_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, events) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    text = text_rx.recv() => {
                        let Some(text) = text else {
                            let _ = write.close().await;
                            break;
                        };
                        let frame = serde_json::json!({ "text": text, "end": true });
                        if let Err(e) = write.send(Message::Text(frame.to_string().into())).await {
                            let _ = event_tx.send(SynthesisEvent::Error(format!("send failed: {e}")));
                            break;
                        }
                    }
                    msg = read.next() => {
                        let raw = match msg {
                            Some(Ok(Message::Text(text))) => text.to_string(),
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                let _ = event_tx.send(SynthesisEvent::Error(e.to_string()));
                                break;
                            }
                        };
                        if let Some(event) = parse_frame(&raw) {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        } else {
                            warn!(len = raw.len(), "Ignoring unrecognised synthesis frame");
                        }
                    }
                }
            }
            debug!("Synthesis connection closed");
            let _ = event_tx.send(SynthesisEvent::Closed);
        });

        Ok(SynthesisConnection { text_tx, events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url() {
        let config = TtsConfig::default();
        let url = build_stream_url(&config, "k&y");
        assert!(url.starts_with("wss://api.murf.ai/v1/speech/stream-input?"));
        assert!(url.contains("api-key=k%26y"));
        assert!(url.contains("sample_rate=48000"));
        assert!(url.contains("channel_type=MONO&format=PCM"));
    }

    #[test]
    fn test_parse_audio_frame() {
        let raw = r#"{"audio":"AQIDBA==","isFinalAudio":false}"#;
        assert_eq!(parse_frame(raw), Some(SynthesisEvent::Audio(vec![1, 2, 3, 4])));
    }

    #[test]
    fn test_parse_final_frame() {
        assert_eq!(
            parse_frame(r#"{"isFinalAudio":true}"#),
            Some(SynthesisEvent::FinalAudio(vec![]))
        );
        assert_eq!(
            parse_frame(r#"{"audio":"AQI=","isFinalAudio":true}"#),
            Some(SynthesisEvent::FinalAudio(vec![1, 2]))
        );
    }

    #[test]
    fn test_parse_error_and_noise() {
        assert!(matches!(
            parse_frame(r#"{"error":"invalid api key"}"#),
            Some(SynthesisEvent::Error(_))
        ));
        assert!(matches!(
            parse_frame(r#"{"audio":"***"}"#),
            Some(SynthesisEvent::Error(_))
        ));
        assert_eq!(parse_frame(r#"{"context_id":"x"}"#), None);
        assert_eq!(parse_frame("not json"), None);
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let config = TtsConfig {
            api_key: None,
            api_key_env: Some("PARLEY_TEST_UNSET_MURF_KEY".into()),
            ..TtsConfig::default()
        };
        assert!(matches!(
            MurfSynthesizer::new(config),
            Err(ParleyError::Config(_))
        ));
    }
}
