//! Wire message types for the ElevenLabs `stream-input` websocket protocol.
//!
//! Outbound message order on a connection: one [`StreamInit`] (BOS), then
//! one [`StreamText`] per utterance with `flush: true`, and finally a
//! [`StreamEnd`] (EOS) when the connection is being retired. Inbound
//! frames are [`StreamFrame`]s carrying base64 audio and an `isFinal`
//! utterance boundary.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Beginning-of-stream message, sent once per connection.
///
/// The leading single-space text is the vendor's connection-priming
/// convention and produces no audio.
#[derive(Debug, Serialize)]
pub struct StreamInit<'a> {
    pub text: &'a str,
    pub voice_settings: VoiceSettings,
    pub xi_api_key: &'a str,
}

impl<'a> StreamInit<'a> {
    pub fn new(api_key: &'a str, voice_settings: VoiceSettings) -> Self {
        Self {
            text: " ",
            voice_settings,
            xi_api_key: api_key,
        }
    }
}

/// Voice tuning parameters carried in the BOS message and HTTP request body.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
}

/// One utterance of text. `flush: true` forces the backend to emit all
/// audio for this text rather than buffering for a continuation.
#[derive(Debug, Serialize)]
pub struct StreamText {
    pub text: String,
    pub flush: bool,
}

impl StreamText {
    /// Build an utterance message. The trailing space marks a word
    /// boundary for the vendor's incremental tokenizer.
    pub fn utterance(text: &str) -> Self {
        Self {
            text: format!("{text} "),
            flush: true,
        }
    }
}

/// End-of-stream message; the backend closes the connection after it.
#[derive(Debug, Serialize)]
pub struct StreamEnd {
    pub text: &'static str,
}

impl Default for StreamEnd {
    fn default() -> Self {
        Self { text: "" }
    }
}

/// An inbound frame from the `stream-input` endpoint.
///
/// Frames may carry audio, an utterance-final flag, both, or neither
/// (alignment metadata is ignored). Error frames carry `error`/`message`.
#[derive(Debug, Deserialize)]
pub struct StreamFrame {
    /// Base64-encoded audio chunk
    #[serde(default)]
    pub audio: Option<String>,

    /// Set on the last frame of an utterance
    #[serde(default, rename = "isFinal")]
    pub is_final: Option<bool>,

    /// Backend error code, when the frame reports a failure
    #[serde(default)]
    pub error: Option<String>,

    /// Human-readable error detail
    #[serde(default)]
    pub message: Option<String>,
}

impl StreamFrame {
    /// Parse an inbound text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Decode the audio payload, if present and non-empty.
    pub fn decode_audio(&self) -> Result<Option<Bytes>, String> {
        match self.audio.as_deref() {
            None | Some("") => Ok(None),
            Some(b64) => BASE64
                .decode(b64)
                .map(|bytes| Some(Bytes::from(bytes)))
                .map_err(|e| format!("invalid base64 audio payload: {e}")),
        }
    }

    /// Backend-reported error, when this frame is one.
    pub fn error_text(&self) -> Option<String> {
        self.error.as_ref().map(|code| {
            match self.message.as_deref() {
                Some(detail) => format!("{code}: {detail}"),
                None => code.clone(),
            }
        })
    }
}
