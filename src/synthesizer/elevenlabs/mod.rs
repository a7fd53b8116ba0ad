//! ElevenLabs speech-synthesis backends.
//!
//! Two transport variants share one wire vocabulary:
//! - [`http::ElevenLabsSynthesizer`] issues one chunked HTTP request per
//!   utterance against the `/v1/text-to-speech/{voice_id}/stream` endpoint.
//! - [`websocket::ElevenLabsWsSynthesizer`] holds a persistent
//!   `stream-input` websocket open across utterances for lower first-chunk
//!   latency.

pub mod config;
pub mod http;
pub mod messages;
pub mod websocket;

pub use config::{ElevenLabsConfig, OutputFormat};
pub use http::ElevenLabsSynthesizer;
pub use websocket::ElevenLabsWsSynthesizer;

/// Canonical backend kind tag
pub const ELEVENLABS_KIND: &str = "elevenlabs";

/// Base URL for the ElevenLabs HTTP API
pub const ELEVENLABS_API_BASE: &str = "https://api.elevenlabs.io";

/// Base URL for the ElevenLabs websocket API
pub const ELEVENLABS_WS_BASE: &str = "wss://api.elevenlabs.io";

/// Streaming synthesis endpoint template, for endpoint discovery
pub const ELEVENLABS_TTS_URL: &str =
    "https://api.elevenlabs.io/v1/text-to-speech/{voice_id}/stream";

/// Default synthesis model
pub const DEFAULT_MODEL: &str = "eleven_turbo_v2";

/// Default voice when none is configured ("Bella")
pub const DEFAULT_VOICE_ID: &str = "EXAVITQu4vr4xnSDxMaL";

/// Maximum text length per synthesis request
pub const MAX_TEXT_LENGTH: usize = 4096;

/// Voice setting bounds and defaults
pub const MIN_STABILITY: f32 = 0.0;
pub const MAX_STABILITY: f32 = 1.0;
pub const DEFAULT_STABILITY: f32 = 0.5;

pub const MIN_SIMILARITY_BOOST: f32 = 0.0;
pub const MAX_SIMILARITY_BOOST: f32 = 1.0;
pub const DEFAULT_SIMILARITY_BOOST: f32 = 0.75;

/// Latency optimization level bounds (0 = off, 4 = maximum)
pub const MAX_OPTIMIZE_STREAMING_LATENCY: u8 = 4;
