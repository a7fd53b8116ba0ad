pub mod base;
pub mod elevenlabs;

pub use base::{
    AudioChunk, BaseSynthesizer, BoxedSynthesizer, CollectedUtterance, RetryPolicy, SynthResult,
    SynthesisEvent, SynthesisStream, SynthesizerConfig, SynthesizerError, UtteranceState,
};
pub use elevenlabs::{
    ELEVENLABS_TTS_URL, ElevenLabsConfig, ElevenLabsSynthesizer, ElevenLabsWsSynthesizer,
    OutputFormat,
};
use std::collections::HashMap;
use tracing::info;

/// Factory function to create a synthesizer backend.
///
/// The backend kind is taken from `config.provider` (case-insensitive);
/// when a kind supports both transport modes, `config.streaming` selects
/// the persistent-streaming variant. Validation failures surface here
/// rather than at first synthesis.
///
/// # Supported Backends
///
/// - `"elevenlabs"` - ElevenLabs TTS API (per-request HTTP, or persistent
///   `stream-input` websocket when `streaming` is set)
///
/// # Example
///
/// ```rust,ignore
/// use voice_synth::synthesizer::{create_synthesizer, SynthesizerConfig};
///
/// let config = SynthesizerConfig {
///     provider: "elevenlabs".to_string(),
///     api_key: "your-api-key".to_string(),
///     voice_id: Some("EXAVITQu4vr4xnSDxMaL".to_string()),
///     ..Default::default()
/// };
///
/// let synthesizer = create_synthesizer(config)?;
/// ```
pub fn create_synthesizer(config: SynthesizerConfig) -> SynthResult<BoxedSynthesizer> {
    config.validate()?;

    match config.provider.to_lowercase().as_str() {
        "elevenlabs" | "eleven-labs" | "eleven_labs" | "11labs" => {
            if config.streaming {
                info!("creating elevenlabs synthesizer (persistent websocket)");
                Ok(Box::new(ElevenLabsWsSynthesizer::new(config)?))
            } else {
                info!("creating elevenlabs synthesizer (per-request HTTP)");
                Ok(Box::new(ElevenLabsSynthesizer::new(config)?))
            }
        }
        other => Err(SynthesizerError::UnsupportedConfig(format!(
            "Unsupported synthesizer backend: {other}. Supported backends: elevenlabs"
        ))),
    }
}

/// Reusable handle around [`create_synthesizer`] for callers that inject
/// the factory as a value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SynthesizerFactory;

impl SynthesizerFactory {
    pub fn new() -> Self {
        Self
    }

    /// Create a synthesizer for the given configuration.
    pub fn create(&self, config: SynthesizerConfig) -> SynthResult<BoxedSynthesizer> {
        create_synthesizer(config)
    }
}

/// Returns a map of backend kinds to their default API endpoint URLs.
pub fn get_synthesizer_urls() -> HashMap<String, String> {
    let mut urls = HashMap::new();
    urls.insert("elevenlabs".to_string(), ELEVENLABS_TTS_URL.to_string());
    urls
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SynthesizerConfig {
        SynthesizerConfig {
            provider: "elevenlabs".to_string(),
            api_key: "test_key".to_string(),
            voice_id: Some("test_voice_id".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_synthesizer() {
        let result = create_synthesizer(test_config());
        assert!(result.is_ok());
        assert_eq!(result.unwrap().kind(), "elevenlabs");
    }

    #[tokio::test]
    async fn test_create_synthesizer_aliases() {
        for alias in ["eleven-labs", "eleven_labs", "11labs"] {
            let config = SynthesizerConfig {
                provider: alias.to_string(),
                ..test_config()
            };
            let result = create_synthesizer(config);
            assert!(result.is_ok(), "alias {alias} should resolve");
        }
    }

    #[tokio::test]
    async fn test_create_synthesizer_case_insensitive() {
        let config = SynthesizerConfig {
            provider: "ElevenLabs".to_string(),
            ..test_config()
        };
        assert!(create_synthesizer(config).is_ok());

        let config = SynthesizerConfig {
            provider: "ELEVENLABS".to_string(),
            ..test_config()
        };
        assert!(create_synthesizer(config).is_ok());
    }

    #[tokio::test]
    async fn test_streaming_flag_selects_websocket_variant() {
        // Both variants report the same canonical kind; the flag only
        // changes the transport
        let http = create_synthesizer(test_config()).unwrap();
        assert_eq!(http.kind(), "elevenlabs");
        assert!(!http.config().streaming);

        let config = SynthesizerConfig {
            streaming: true,
            ..test_config()
        };
        let ws = create_synthesizer(config).unwrap();
        assert_eq!(ws.kind(), "elevenlabs");
        assert!(ws.config().streaming);
    }

    #[tokio::test]
    async fn test_unknown_backend_lists_supported() {
        let config = SynthesizerConfig {
            provider: "acme-voice".to_string(),
            ..test_config()
        };
        match create_synthesizer(config) {
            Err(SynthesizerError::UnsupportedConfig(msg)) => {
                assert!(msg.contains("acme-voice"));
                assert!(
                    msg.contains("elevenlabs"),
                    "Error message should list supported backends"
                );
            }
            Err(other) => panic!("Expected UnsupportedConfig error, got: {other:?}"),
            Ok(_) => panic!("Expected error for unknown backend"),
        }
    }

    #[tokio::test]
    async fn test_invalid_config_fails_at_creation() {
        let config = SynthesizerConfig {
            api_key: String::new(),
            ..test_config()
        };
        assert!(matches!(
            create_synthesizer(config),
            Err(SynthesizerError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_get_synthesizer_urls() {
        let urls = get_synthesizer_urls();
        assert!(urls.contains_key("elevenlabs"));
        assert_eq!(urls.get("elevenlabs").unwrap(), ELEVENLABS_TTS_URL);
    }
}
