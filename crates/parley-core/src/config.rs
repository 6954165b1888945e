//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level parley configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// --- Service configs ---

/// Reasoning service (Gemini) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_reasoning_key_env")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Model name (default: "gemini-1.5-flash").
    #[serde(default = "default_reasoning_model")]
    pub model: String,

    /// Output token cap for conversation replies.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Per-request HTTP timeout (default: 30s).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_reasoning_key_env(),
            base_url: None,
            model: default_reasoning_model(),
            max_output_tokens: default_max_output_tokens(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_reasoning_key_env() -> Option<String> {
    Some("GEMINI_API_KEY".into())
}

fn default_reasoning_model() -> String {
    "gemini-1.5-flash".into()
}

fn default_max_output_tokens() -> u32 {
    200
}

fn default_request_timeout() -> u64 {
    30
}

impl ReasoningConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Streaming speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_transcription_key_env")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Vocabulary the recognizer should favour (product names, jargon).
    #[serde(default)]
    pub keyterms: Vec<String>,

    #[serde(default = "default_true")]
    pub format_turns: bool,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_transcription_key_env(),
            base_url: None,
            sample_rate: default_sample_rate(),
            keyterms: Vec::new(),
            format_turns: true,
        }
    }
}

fn default_transcription_key_env() -> Option<String> {
    Some("ASSEMBLY_API_KEY".into())
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Streaming text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_tts_key_env")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Voice ID (default: "en-US-Ken").
    #[serde(default = "default_voice_id")]
    pub voice_id: String,

    /// Voice style (default: "Conversational").
    #[serde(default = "default_voice_style")]
    pub style: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_tts_key_env(),
            base_url: None,
            voice_id: default_voice_id(),
            style: default_voice_style(),
            sample_rate: default_sample_rate(),
        }
    }
}

fn default_tts_key_env() -> Option<String> {
    Some("MURF_API_KEY".into())
}

fn default_voice_id() -> String {
    "en-US-Ken".into()
}

fn default_voice_style() -> String {
    "Conversational".into()
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Turn-taking and audio pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Quiet period before a transcript is finalized (default: 1200ms).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// How long to wait for the voice connection (default: 30s).
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// How long one reply may take to play out (default: 60s).
    #[serde(default = "default_playback_timeout")]
    pub playback_timeout_secs: u64,

    /// How long one reasoning call may take before a fallback reply is used (default: 30s).
    #[serde(default = "default_reasoning_timeout")]
    pub reasoning_timeout_secs: u64,

    /// Transcription frame size in bytes (default: 9600, ~100ms of 48kHz mono s16le).
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            ready_timeout_secs: default_ready_timeout(),
            playback_timeout_secs: default_playback_timeout(),
            reasoning_timeout_secs: default_reasoning_timeout(),
            chunk_bytes: default_chunk_bytes(),
            input_device: None,
            output_device: None,
        }
    }
}

fn default_debounce_ms() -> u64 {
    1200
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_playback_timeout() -> u64 {
    60
}

fn default_reasoning_timeout() -> u64 {
    30
}

fn default_chunk_bytes() -> usize {
    4800 * 2
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_true() -> bool {
    true
}

impl VoiceConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn playback_timeout(&self) -> Duration {
        Duration::from_secs(self.playback_timeout_secs)
    }

    pub fn reasoning_timeout(&self) -> Duration {
        Duration::from_secs(self.reasoning_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_media=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern");
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        let config: Self = json5::from_str(&substituted)
            .map_err(|e| crate::error::ParleyError::Config(e.to_string()))?;

        let (_warnings, errors) = config.validate();
        if !errors.is_empty() {
            return Err(crate::error::ParleyError::Config(format!(
                "{}: {}",
                path.display(),
                errors.join("; ")
            )));
        }
        Ok(config)
    }

    /// Default config file location: `~/.parley/config.json`
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn reasoning(&self) -> ReasoningConfig {
        self.reasoning.clone().unwrap_or_default()
    }

    pub fn transcription(&self) -> TranscriptionConfig {
        self.transcription.clone().unwrap_or_default()
    }

    pub fn tts(&self) -> TtsConfig {
        self.tts.clone().unwrap_or_default()
    }

    pub fn voice(&self) -> VoiceConfig {
        self.voice.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.reasoning().resolve_api_key().is_none() {
            warnings.push("Reasoning service has no API key configured".to_string());
        }
        if self.transcription().resolve_api_key().is_none() {
            warnings.push("Transcription service has no API key configured".to_string());
        }
        if self.tts().resolve_api_key().is_none() {
            warnings.push("TTS service has no API key configured".to_string());
        }

        if self.reasoning().request_timeout_secs == 0 {
            errors.push("reasoning.request_timeout_secs cannot be 0".to_string());
        }

        let voice = self.voice();
        if voice.debounce_ms == 0 {
            errors.push("voice.debounce_ms cannot be 0".to_string());
        }
        if voice.ready_timeout_secs == 0 {
            errors.push("voice.ready_timeout_secs cannot be 0".to_string());
        }
        if voice.playback_timeout_secs == 0 {
            errors.push("voice.playback_timeout_secs cannot be 0".to_string());
        }
        if voice.reasoning_timeout_secs == 0 {
            errors.push("voice.reasoning_timeout_secs cannot be 0".to_string());
        }
        if voice.chunk_bytes == 0 || voice.chunk_bytes % 2 != 0 {
            errors.push(format!(
                "voice.chunk_bytes must be a positive multiple of 2, got {}",
                voice.chunk_bytes
            ));
        }

        (warnings, errors)
    }
}

/// Base directory for parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, unique variable name
        unsafe { std::env::set_var("TEST_PARLEY_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_PARLEY_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_PARLEY_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_PARLEY_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        let voice = config.voice();
        assert_eq!(voice.debounce(), Duration::from_millis(1200));
        assert_eq!(voice.ready_timeout(), Duration::from_secs(30));
        assert_eq!(voice.chunk_bytes, 9600);
        assert_eq!(voice.reasoning_timeout(), Duration::from_secs(30));
        assert_eq!(config.reasoning().request_timeout_secs, 30);
        assert_eq!(config.tts().voice_id, "en-US-Ken");
        assert_eq!(config.transcription().sample_rate, 48_000);
        assert_eq!(config.reasoning().model, "gemini-1.5-flash");
    }

    #[test]
    fn test_secret_resolution_prefers_direct_value() {
        // SAFETY: test-only, unique variable name
        unsafe { std::env::set_var("TEST_PARLEY_TTS_KEY", "from-env") };
        let mut tts = TtsConfig {
            api_key_env: Some("TEST_PARLEY_TTS_KEY".into()),
            ..TtsConfig::default()
        };
        assert_eq!(tts.resolve_api_key(), Some("from-env".into()));

        tts.api_key = Some("direct-key".into());
        assert_eq!(tts.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_PARLEY_TTS_KEY") };
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let json_str = r#"{
            voice: { debounce_ms: 800 },
            transcription: { keyterms: ["Rust", "Tokio"] },
        }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        let voice = config.voice();
        assert_eq!(voice.debounce_ms, 800);
        assert_eq!(voice.playback_timeout_secs, 60);
        let transcription = config.transcription();
        assert_eq!(transcription.keyterms, vec!["Rust", "Tokio"]);
        assert!(transcription.format_turns);
        assert_eq!(
            transcription.api_key_env.as_deref(),
            Some("ASSEMBLY_API_KEY")
        );
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging();
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are fine in JSON5
                tts: { voice_id: "en-UK-Hazel", style: "Promo" },
                logging: { format: "json", filters: ["parley_media=debug"] },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.tts().voice_id, "en-UK-Hazel");
        assert_eq!(config.logging().format, "json");
        assert_eq!(config.logging().filters, vec!["parley_media=debug"]);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.voice.is_none());
    }

    #[test]
    fn test_load_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ voice: ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, crate::error::ParleyError::Config(_)));
    }

    #[test]
    fn test_load_rejects_zero_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ voice: { chunk_bytes: 0 } }").unwrap();
        let err = Config::load(&path).unwrap_err();
        match err {
            crate::error::ParleyError::Config(msg) => assert!(msg.contains("chunk_bytes"), "{msg}"),
            other => panic!("Expected a config error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_rejects_zero_reasoning_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ voice: { reasoning_timeout_secs: 0 } }").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(crate::error::ParleyError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_odd_chunk_size() {
        let config = Config {
            voice: Some(VoiceConfig {
                chunk_bytes: 9601,
                ..VoiceConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(
            errors.iter().any(|e| e.contains("chunk_bytes")),
            "Expected a chunk_bytes error, got: {errors:?}"
        );
    }

    #[test]
    fn test_validate_missing_keys_warn() {
        let config = Config {
            reasoning: Some(ReasoningConfig {
                api_key_env: Some("NONEXISTENT_PARLEY_GEMINI".into()),
                ..ReasoningConfig::default()
            }),
            ..Config::default()
        };
        let (warnings, _errors) = config.validate();
        assert!(warnings.iter().any(|w| w.contains("Reasoning")));
    }
}
