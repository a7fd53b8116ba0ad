//! ElevenLabs-specific configuration derived from the generic
//! [`SynthesizerConfig`].

use serde::{Deserialize, Serialize};

use super::{
    DEFAULT_MODEL, DEFAULT_SIMILARITY_BOOST, DEFAULT_STABILITY, DEFAULT_VOICE_ID,
    ELEVENLABS_API_BASE, ELEVENLABS_WS_BASE, MAX_OPTIMIZE_STREAMING_LATENCY,
    MAX_SIMILARITY_BOOST, MAX_STABILITY, MIN_SIMILARITY_BOOST, MIN_STABILITY,
};
use crate::synthesizer::base::{SynthResult, SynthesizerConfig, SynthesizerError};

/// Output audio formats supported by the ElevenLabs streaming endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// 16-bit linear PCM at 16kHz
    Pcm16000,
    /// 16-bit linear PCM at 22.05kHz
    Pcm22050,
    /// 16-bit linear PCM at 24kHz
    Pcm24000,
    /// 16-bit linear PCM at 44.1kHz
    Pcm44100,
    /// MP3 at 44.1kHz, 128kbps
    Mp3_44100_128,
    /// 8-bit mu-law at 8kHz (telephony)
    Ulaw8000,
}

impl OutputFormat {
    /// Wire name used in the `output_format` query parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Pcm16000 => "pcm_16000",
            OutputFormat::Pcm22050 => "pcm_22050",
            OutputFormat::Pcm24000 => "pcm_24000",
            OutputFormat::Pcm44100 => "pcm_44100",
            OutputFormat::Mp3_44100_128 => "mp3_44100_128",
            OutputFormat::Ulaw8000 => "ulaw_8000",
        }
    }

    /// MIME type of the produced audio.
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Mp3_44100_128 => "audio/mpeg",
            OutputFormat::Ulaw8000 => "audio/basic",
            _ => "audio/pcm",
        }
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        match self {
            OutputFormat::Pcm16000 => 16000,
            OutputFormat::Pcm22050 => 22050,
            OutputFormat::Pcm24000 => 24000,
            OutputFormat::Pcm44100 | OutputFormat::Mp3_44100_128 => 44100,
            OutputFormat::Ulaw8000 => 8000,
        }
    }

    /// Resolve from the generic encoding/sample-rate pair.
    ///
    /// Accepts both generic encoding names ("linear16", "mp3", "mulaw")
    /// and the vendor's own wire names. Defaults to 16kHz PCM when the
    /// config leaves both fields unset.
    pub fn from_config(
        encoding: Option<&str>,
        sample_rate: Option<u32>,
    ) -> Result<Self, String> {
        let encoding = encoding.map(|e| e.to_lowercase());
        match encoding.as_deref() {
            None | Some("linear16") | Some("pcm") => match sample_rate {
                None | Some(16000) => Ok(OutputFormat::Pcm16000),
                Some(22050) => Ok(OutputFormat::Pcm22050),
                Some(24000) => Ok(OutputFormat::Pcm24000),
                Some(44100) => Ok(OutputFormat::Pcm44100),
                Some(rate) => Err(format!(
                    "unsupported PCM sample rate {rate}; supported: 16000, 22050, 24000, 44100"
                )),
            },
            Some("mp3") | Some("mp3_44100_128") => match sample_rate {
                None | Some(44100) => Ok(OutputFormat::Mp3_44100_128),
                Some(rate) => Err(format!("unsupported MP3 sample rate {rate}; supported: 44100")),
            },
            Some("mulaw") | Some("ulaw") | Some("ulaw_8000") => match sample_rate {
                None | Some(8000) => Ok(OutputFormat::Ulaw8000),
                Some(rate) => Err(format!("unsupported mu-law sample rate {rate}; supported: 8000")),
            },
            Some("pcm_16000") => Ok(OutputFormat::Pcm16000),
            Some("pcm_22050") => Ok(OutputFormat::Pcm22050),
            Some("pcm_24000") => Ok(OutputFormat::Pcm24000),
            Some("pcm_44100") => Ok(OutputFormat::Pcm44100),
            Some(other) => Err(format!(
                "unsupported audio encoding '{other}'; supported: linear16, mp3, mulaw"
            )),
        }
    }
}

/// Validated ElevenLabs synthesizer configuration.
///
/// Wraps the generic config and resolves vendor defaults (voice, model,
/// output format, voice settings) at construction time.
#[derive(Debug, Clone)]
pub struct ElevenLabsConfig {
    /// Generic configuration this was derived from
    pub base: SynthesizerConfig,
    /// Voice identity
    pub voice_id: String,
    /// Synthesis model
    pub model_id: String,
    /// Output audio format
    pub output_format: OutputFormat,
    /// Voice stability (0.0 - 1.0)
    pub stability: f32,
    /// Voice similarity boost (0.0 - 1.0)
    pub similarity_boost: f32,
    /// Latency optimization level (0 - 4), omitted from requests when None
    pub optimize_streaming_latency: Option<u8>,
}

impl ElevenLabsConfig {
    /// Derive a validated vendor config from the generic one.
    pub fn from_base(base: SynthesizerConfig) -> SynthResult<Self> {
        base.validate()?;

        let output_format =
            OutputFormat::from_config(base.audio_encoding.as_deref(), base.sample_rate)
                .map_err(SynthesizerError::ConfigValidation)?;

        let voice_id = base
            .voice_id
            .clone()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_VOICE_ID.to_string());

        let model_id = if base.model.trim().is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            base.model.clone()
        };

        Ok(Self {
            base,
            voice_id,
            model_id,
            output_format,
            stability: DEFAULT_STABILITY,
            similarity_boost: DEFAULT_SIMILARITY_BOOST,
            optimize_streaming_latency: None,
        })
    }

    /// Set voice stability, clamped to the supported range.
    pub fn with_stability(mut self, stability: f32) -> Self {
        self.stability = stability.clamp(MIN_STABILITY, MAX_STABILITY);
        self
    }

    /// Set similarity boost, clamped to the supported range.
    pub fn with_similarity_boost(mut self, similarity_boost: f32) -> Self {
        self.similarity_boost =
            similarity_boost.clamp(MIN_SIMILARITY_BOOST, MAX_SIMILARITY_BOOST);
        self
    }

    /// Set the latency optimization level, capped at the maximum.
    pub fn with_optimize_streaming_latency(mut self, level: u8) -> Self {
        self.optimize_streaming_latency = Some(level.min(MAX_OPTIMIZE_STREAMING_LATENCY));
        self
    }

    /// Base URL for HTTP requests, honoring any endpoint override.
    pub fn http_base(&self) -> &str {
        self.base
            .endpoint_override
            .as_deref()
            .unwrap_or(ELEVENLABS_API_BASE)
    }

    /// Full streaming synthesis URL for the HTTP variant.
    pub fn http_url(&self) -> String {
        let mut url = format!(
            "{}/v1/text-to-speech/{}/stream?output_format={}",
            self.http_base(),
            self.voice_id,
            self.output_format.as_str()
        );
        if let Some(level) = self.optimize_streaming_latency {
            url.push_str(&format!("&optimize_streaming_latency={level}"));
        }
        url
    }

    /// Full `stream-input` URL for the websocket variant.
    pub fn ws_url(&self) -> String {
        let base = self
            .base
            .endpoint_override
            .as_deref()
            .unwrap_or(ELEVENLABS_WS_BASE);
        format!(
            "{}/v1/text-to-speech/{}/stream-input?model_id={}&output_format={}",
            base,
            self.voice_id,
            self.model_id,
            self.output_format.as_str()
        )
    }
}
