//! Streaming speech-to-text link (AssemblyAI v3 realtime WebSocket).

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

use parley_core::config::TranscriptionConfig;
use parley_core::error::{ParleyError, Result};

const DEFAULT_STREAM_URL: &str = "wss://streaming.assemblyai.com/v3/ws";

/// One incremental transcript fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptTurn {
    pub text: String,
    /// Monotonic turn marker assigned by the service.
    pub order: u64,
    pub end_of_turn: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionEvent {
    Opened { session_id: String },
    Turn(TranscriptTurn),
    Error(String),
    Closed,
}

/// A live transcription session: audio goes in, events come out.
/// Dropping `audio_tx` terminates the session gracefully.
pub struct TranscriptionLink {
    pub audio_tx: mpsc::UnboundedSender<Vec<u8>>,
    pub events: mpsc::UnboundedReceiver<TranscriptionEvent>,
}

#[async_trait]
pub trait TranscriptionService: Send + Sync {
    async fn connect(&self) -> Result<TranscriptionLink>;
}

/// AssemblyAI universal-streaming client.
pub struct AssemblyAiTranscriber {
    config: TranscriptionConfig,
    api_key: String,
}

impl AssemblyAiTranscriber {
    pub fn new(config: TranscriptionConfig) -> Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| ParleyError::Config("No transcription API key configured".into()))?;
        Ok(Self { config, api_key })
    }
}

/// Build the realtime URL: s16le at the configured rate, with keyterms.
pub fn build_stream_url(config: &TranscriptionConfig) -> String {
    let base = config.base_url.as_deref().unwrap_or(DEFAULT_STREAM_URL);
    let mut url = format!(
        "{base}?sample_rate={}&encoding=pcm_s16le&format_turns={}",
        config.sample_rate, config.format_turns
    );
    if !config.keyterms.is_empty() {
        let terms = serde_json::Value::from(config.keyterms.clone()).to_string();
        url.push_str("&keyterms_prompt=");
        url.push_str(&urlencoding::encode(&terms));
    }
    url
}

/// Decode one server message.
pub fn parse_message(raw: &str) -> Option<TranscriptionEvent> {
    let payload: serde_json::Value = serde_json::from_str(raw).ok()?;

    if let Some(err) = payload.get("error").and_then(serde_json::Value::as_str) {
        return Some(TranscriptionEvent::Error(err.to_string()));
    }

    match payload.get("type").and_then(serde_json::Value::as_str)? {
        "Begin" => Some(TranscriptionEvent::Opened {
            session_id: payload
                .get("id")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        "Turn" => Some(TranscriptionEvent::Turn(TranscriptTurn {
            text: payload
                .get("transcript")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
            order: payload
                .get("turn_order")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0),
            end_of_turn: payload
                .get("end_of_turn")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
        })),
        "Termination" => Some(TranscriptionEvent::Closed),
        _ => None,
    }
}

#[async_trait]
impl TranscriptionService for AssemblyAiTranscriber {
    async fn connect(&self) -> Result<TranscriptionLink> {
        let url = build_stream_url(&self.config);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ParleyError::TranscriptionLink(format!("bad url: {e}")))?;
        let auth = HeaderValue::from_str(&self.api_key)
            .map_err(|e| ParleyError::Config(format!("invalid transcription key: {e}")))?;
        request.headers_mut().insert("Authorization", auth);

        debug!(sample_rate = self.config.sample_rate, "Connecting transcription link");
        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| ParleyError::TranscriptionLink(format!("connect failed: {e}")))?;
        let (mut write, mut read) = stream.split();

        let (audio_tx, mut audio_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (event_tx, events) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut terminating = false;
            loop {
                tokio::select! {
                    chunk = audio_rx.recv(), if !terminating => {
                        match chunk {
                            Some(bytes) => {
                                if let Err(e) = write.send(Message::Binary(bytes.into())).await {
                                    let _ = event_tx.send(TranscriptionEvent::Error(format!("send failed: {e}")));
                                    break;
                                }
                            }
                            None => {
                                // Ask the service to flush and close
                                terminating = true;
                                let terminate = serde_json::json!({ "type": "Terminate" });
                                if write.send(Message::Text(terminate.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    msg = read.next() => {
                        let raw = match msg {
                            Some(Ok(Message::Text(text))) => text.to_string(),
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                let _ = event_tx.send(TranscriptionEvent::Error(e.to_string()));
                                break;
                            }
                        };
                        match parse_message(&raw) {
                            Some(TranscriptionEvent::Closed) => break,
                            Some(event) => {
                                if let TranscriptionEvent::Opened { session_id } = &event {
                                    info!(session_id = %session_id, "Transcription session opened");
                                }
                                if event_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            None => warn!(len = raw.len(), "Ignoring unrecognised transcription message"),
                        }
                    }
                }
            }
            let _ = write.close().await;
            debug!("Transcription link closed");
            let _ = event_tx.send(TranscriptionEvent::Closed);
        });

        Ok(TranscriptionLink { audio_tx, events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url_with_keyterms() {
        let config = TranscriptionConfig {
            keyterms: vec!["Node.js".into(), "Kubernetes".into()],
            ..TranscriptionConfig::default()
        };
        let url = build_stream_url(&config);
        assert!(url.starts_with("wss://streaming.assemblyai.com/v3/ws?"));
        assert!(url.contains("sample_rate=48000"));
        assert!(url.contains("encoding=pcm_s16le"));
        assert!(url.contains("format_turns=true"));
        assert!(url.contains("keyterms_prompt=%5B%22Node.js%22%2C%22Kubernetes%22%5D"));
    }

    #[test]
    fn test_stream_url_without_keyterms() {
        let url = build_stream_url(&TranscriptionConfig::default());
        assert!(!url.contains("keyterms_prompt"));
    }

    #[test]
    fn test_parse_turn() {
        let raw = r#"{"type":"Turn","transcript":"hello there","turn_order":3,"end_of_turn":true}"#;
        assert_eq!(
            parse_message(raw),
            Some(TranscriptionEvent::Turn(TranscriptTurn {
                text: "hello there".into(),
                order: 3,
                end_of_turn: true,
            }))
        );
    }

    #[test]
    fn test_parse_lifecycle() {
        assert_eq!(
            parse_message(r#"{"type":"Begin","id":"abc","expires_at":1}"#),
            Some(TranscriptionEvent::Opened { session_id: "abc".into() })
        );
        assert_eq!(
            parse_message(r#"{"type":"Termination","audio_duration_seconds":4}"#),
            Some(TranscriptionEvent::Closed)
        );
        assert!(matches!(
            parse_message(r#"{"error":"unauthorized"}"#),
            Some(TranscriptionEvent::Error(_))
        ));
        assert_eq!(parse_message(r#"{"type":"SpeechStarted"}"#), None);
    }
}
