//! Base traits and types for speech-synthesis backends.
//!
//! This module defines the foundational abstractions shared by every
//! synthesizer backend: the validated [`SynthesizerConfig`], the error
//! taxonomy, the per-utterance audio stream contract, and the
//! [`BaseSynthesizer`] capability trait the factory dispatches over.
//!
//! # Streaming Contract
//!
//! Each `synthesize` call yields a fresh, one-shot [`SynthesisStream`] of
//! [`SynthesisEvent`]s: zero or more sequenced audio chunks followed by
//! exactly one terminal marker (`UtteranceEnd`, or `Cancelled` when the
//! caller barged in). Chunks within one utterance are delivered in
//! non-decreasing sequence order.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during synthesizer configuration, creation, and
/// streaming synthesis.
#[derive(Debug, Error)]
pub enum SynthesizerError {
    /// Malformed or incomplete configuration; fails fast at construction
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// Caller misuse (e.g. empty synthesis text); never retried
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transport-level failure after local retries were exhausted
    #[error("Backend connection error: {0}")]
    BackendConnection(String),

    /// Backend-reported semantic failure (bad voice id, auth, quota)
    #[error("Backend rejected request: {0}")]
    BackendRejected(String),

    /// The factory cannot resolve the configured backend kind
    #[error("Unsupported synthesizer config: {0}")]
    UnsupportedConfig(String),
}

/// Result type for synthesizer operations.
pub type SynthResult<T> = Result<T, SynthesizerError>;

// =============================================================================
// Retry Policy
// =============================================================================

/// Retry policy for transient transport failures in per-request backends.
///
/// Retry counts and backoff timing are configurable policy rather than
/// fixed constants; the defaults suit conversational turn-taking where a
/// synthesis attempt older than a couple of seconds is useless anyway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    /// Default: 2
    pub max_retries: u32,

    /// Delay before the first retry (milliseconds).
    /// Default: 250ms
    pub initial_backoff_ms: u64,

    /// Upper bound on the backoff delay (milliseconds).
    /// Default: 4000ms
    pub max_backoff_ms: u64,

    /// Multiplier for exponential backoff.
    /// Default: 2.0
    pub backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 250,
            max_backoff_ms: 4000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate the backoff delay for a given attempt number (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64;
        let multiplier = self.backoff_multiplier as f64;

        // Exponential backoff: base * multiplier^(attempt-1)
        let delay = base * multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(delay.min(self.max_backoff_ms as f64) as u64)
    }

    /// Check whether another retry is allowed after `attempts_made` retries.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_retries
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Immutable description of which synthesis backend to use and how.
///
/// Built once per call/session by the caller before any synthesis begins
/// and treated as read-only for the lifetime of the synthesizer it
/// configures; changing any field requires creating a new instance through
/// the factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizerConfig {
    /// Backend kind tag (e.g. "elevenlabs")
    pub provider: String,

    /// API key for authentication
    pub api_key: String,

    /// Voice identity; backend-specific default applies when unset
    #[serde(default)]
    pub voice_id: Option<String>,

    /// Synthesis model; backend-specific default applies when empty
    #[serde(default)]
    pub model: String,

    /// Audio encoding (e.g. "linear16", "mp3", "mulaw")
    #[serde(default)]
    pub audio_encoding: Option<String>,

    /// Output sample rate in Hz
    #[serde(default)]
    pub sample_rate: Option<u32>,

    /// Use a persistent streaming connection across utterances.
    ///
    /// When a backend kind supports both transport modes, the factory
    /// prefers the persistent-streaming variant when this is set.
    #[serde(default)]
    pub streaming: bool,

    /// Connection establishment timeout in seconds
    #[serde(default)]
    pub connection_timeout_secs: Option<u64>,

    /// Idle timeout while waiting for backend frames, in seconds
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    /// Route requests to an alternate endpoint (tests, self-hosted proxies).
    /// HTTP backends expect an http(s) URL, websocket backends a ws(s) URL.
    #[serde(default)]
    pub endpoint_override: Option<String>,

    /// Retry policy for transient transport failures
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            api_key: String::new(),
            voice_id: None,
            model: String::new(),
            audio_encoding: None,
            sample_rate: None,
            streaming: false,
            connection_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
            endpoint_override: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl SynthesizerConfig {
    /// Validate field-level invariants. Pure; performs no I/O.
    ///
    /// Backend kind recognition is the factory's job; vendor configs
    /// additionally validate encoding and sample-rate support for the
    /// selected kind.
    pub fn validate(&self) -> SynthResult<()> {
        if self.provider.trim().is_empty() {
            return Err(SynthesizerError::ConfigValidation(
                "backend kind (provider) must be set".to_string(),
            ));
        }
        if self.api_key.trim().is_empty() {
            return Err(SynthesizerError::ConfigValidation(format!(
                "api_key is required for provider '{}'",
                self.provider
            )));
        }
        if self.sample_rate == Some(0) {
            return Err(SynthesizerError::ConfigValidation(
                "sample_rate must be non-zero when set".to_string(),
            ));
        }
        if let Some(endpoint) = &self.endpoint_override {
            url::Url::parse(endpoint).map_err(|e| {
                SynthesizerError::ConfigValidation(format!(
                    "endpoint_override is not a valid URL: {e}"
                ))
            })?;
        }
        Ok(())
    }
}

// =============================================================================
// Audio Stream Types
// =============================================================================

/// One chunk of encoded audio within an utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Raw encoded audio bytes
    pub data: Bytes,
    /// Position of this chunk within the utterance, starting at 0
    pub sequence: u32,
}

/// An event on a per-utterance synthesis stream.
///
/// A well-formed stream is zero or more `Audio` events followed by exactly
/// one terminal marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    /// A sequenced chunk of encoded audio
    Audio(AudioChunk),
    /// All audio for this utterance has been delivered
    UtteranceEnd,
    /// The utterance was cancelled before completion (caller barge-in)
    Cancelled,
}

/// Bounded channel depth between the producing backend task and the
/// consuming pipeline. Provides backpressure on slow consumers.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// A lazy, finite, one-shot stream of [`SynthesisEvent`]s for a single
/// utterance. Not restartable; each `synthesize` call produces a fresh one.
pub struct SynthesisStream {
    rx: mpsc::Receiver<SynthResult<SynthesisEvent>>,
}

impl SynthesisStream {
    /// Create a stream together with its producing side.
    pub(crate) fn channel(state: StateCell) -> (ChunkSender, Self) {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        (
            ChunkSender {
                tx,
                sequence: 0,
                state,
            },
            Self { rx },
        )
    }

    /// Receive the next event, or `None` once the terminal marker (or a
    /// stream error) has been consumed.
    pub async fn recv(&mut self) -> Option<SynthResult<SynthesisEvent>> {
        self.rx.recv().await
    }

    /// Drain the stream, concatenating all audio.
    ///
    /// Returns the collected audio together with whether the utterance was
    /// cancelled; mid-stream errors propagate.
    pub async fn collect_audio(mut self) -> SynthResult<CollectedUtterance> {
        let mut audio = BytesMut::new();
        let mut chunks = 0u32;
        while let Some(event) = self.recv().await {
            match event? {
                SynthesisEvent::Audio(chunk) => {
                    audio.extend_from_slice(&chunk.data);
                    chunks += 1;
                }
                SynthesisEvent::UtteranceEnd => {
                    return Ok(CollectedUtterance {
                        audio: audio.freeze(),
                        chunks,
                        cancelled: false,
                    });
                }
                SynthesisEvent::Cancelled => {
                    return Ok(CollectedUtterance {
                        audio: audio.freeze(),
                        chunks,
                        cancelled: true,
                    });
                }
            }
        }
        Err(SynthesizerError::BackendConnection(
            "synthesis stream ended without a terminal marker".to_string(),
        ))
    }
}

impl futures::Stream for SynthesisStream {
    type Item = SynthResult<SynthesisEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl fmt::Debug for SynthesisStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthesisStream").finish_non_exhaustive()
    }
}

/// The fully drained audio of one utterance.
#[derive(Debug, Clone)]
pub struct CollectedUtterance {
    /// Concatenated audio bytes
    pub audio: Bytes,
    /// Number of chunks that were delivered
    pub chunks: u32,
    /// Whether the stream ended with a cancellation marker
    pub cancelled: bool,
}

/// Producing side of a [`SynthesisStream`].
///
/// Tracks the chunk sequence counter and guarantees that exactly one
/// terminal marker is emitted, recording the matching utterance state as a
/// side effect.
pub(crate) struct ChunkSender {
    tx: mpsc::Sender<SynthResult<SynthesisEvent>>,
    sequence: u32,
    state: StateCell,
}

impl ChunkSender {
    /// Send one audio chunk. Returns `false` when the consumer has dropped
    /// the stream and production should stop.
    pub async fn audio(&mut self, data: Bytes) -> bool {
        let chunk = AudioChunk {
            data,
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.tx
            .send(Ok(SynthesisEvent::Audio(chunk)))
            .await
            .is_ok()
    }

    // Terminal state is recorded before the marker is sent so that a
    // consumer observing the marker never reads a stale state.

    /// Terminate the stream with an end-of-utterance marker.
    pub async fn finish(self) {
        self.state.set(UtteranceState::Completed);
        let _ = self.tx.send(Ok(SynthesisEvent::UtteranceEnd)).await;
    }

    /// Terminate the stream with a cancellation marker.
    pub async fn cancelled(self) {
        self.state.set(UtteranceState::Cancelled);
        let _ = self.tx.send(Ok(SynthesisEvent::Cancelled)).await;
    }

    /// Terminate the stream with an error.
    pub async fn fail(self, error: SynthesizerError) {
        self.state.set(UtteranceState::Failed);
        let _ = self.tx.send(Err(error)).await;
    }

    /// The consumer dropped the stream mid-utterance; record the instance
    /// as ready for the next one.
    pub fn abandoned(self) {
        debug!("synthesis stream dropped by consumer before completion");
        self.state.set(UtteranceState::Idle);
    }
}

// =============================================================================
// Utterance State
// =============================================================================

/// Lifecycle state of a synthesizer instance with respect to its most
/// recent utterance.
///
/// `Completed`, `Cancelled`, and `Failed` all leave the instance ready for
/// the next `synthesize` call; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UtteranceState {
    /// No utterance in flight
    #[default]
    Idle,
    /// An utterance is currently being synthesized
    Synthesizing,
    /// The last utterance completed normally
    Completed,
    /// The last utterance was cancelled by the caller
    Cancelled,
    /// The last utterance failed with a backend error
    Failed,
    /// The instance has been closed and cannot synthesize again
    Closed,
}

impl fmt::Display for UtteranceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UtteranceState::Idle => write!(f, "Idle"),
            UtteranceState::Synthesizing => write!(f, "Synthesizing"),
            UtteranceState::Completed => write!(f, "Completed"),
            UtteranceState::Cancelled => write!(f, "Cancelled"),
            UtteranceState::Failed => write!(f, "Failed"),
            UtteranceState::Closed => write!(f, "Closed"),
        }
    }
}

/// Shared utterance-state cell, written by the producing task and the
/// owning instance, read by `utterance_state()`.
#[derive(Debug, Clone, Default)]
pub(crate) struct StateCell(Arc<parking_lot::Mutex<UtteranceState>>);

impl StateCell {
    pub fn get(&self) -> UtteranceState {
        *self.0.lock()
    }

    pub fn set(&self, state: UtteranceState) {
        *self.0.lock() = state;
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative cancellation signal shared between `cancel()` and the
/// in-flight producing task.
///
/// `cancel()` only cancels the current token; the producing side observes
/// it at each chunk boundary. This keeps cancellation safe to invoke from
/// any control path concurrently with an in-flight `synthesize`, and makes
/// it an idempotent no-op when nothing is in flight.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancelSignal {
    current: Arc<parking_lot::Mutex<CancellationToken>>,
}

impl CancelSignal {
    /// Install and return a fresh token for a new utterance.
    pub fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock() = token.clone();
        token
    }

    /// Cancel the current utterance, if any.
    pub fn cancel(&self) {
        self.current.lock().cancel();
    }
}

// =============================================================================
// Base Trait
// =============================================================================

/// The uniform operation surface every synthesis backend implements.
///
/// One instance serves one call/session: exactly one [`SynthesizerConfig`]
/// per instance, one utterance in flight at a time, and exclusive ownership
/// of any underlying connection. Instances are created by the factory; a
/// configuration change requires a new instance.
///
/// # Example
///
/// ```rust,ignore
/// use voice_synth::synthesizer::{create_synthesizer, SynthesizerConfig, SynthesisEvent};
///
/// let config = SynthesizerConfig {
///     provider: "elevenlabs".to_string(),
///     api_key: "your-api-key".to_string(),
///     voice_id: Some("EXAVITQu4vr4xnSDxMaL".to_string()),
///     streaming: true,
///     ..Default::default()
/// };
///
/// let mut synth = create_synthesizer(config)?;
/// let mut stream = synth.synthesize("Hello, how can I help today?").await?;
/// while let Some(event) = stream.recv().await {
///     match event? {
///         SynthesisEvent::Audio(chunk) => play(chunk.data),
///         SynthesisEvent::UtteranceEnd | SynthesisEvent::Cancelled => break,
///     }
/// }
/// synth.close().await?;
/// ```
#[async_trait]
pub trait BaseSynthesizer: std::fmt::Debug + Send + Sync {
    /// The canonical backend kind tag this instance was created for.
    fn kind(&self) -> &str;

    /// The configuration this instance was built from.
    fn config(&self) -> &SynthesizerConfig;

    /// Lifecycle state with respect to the most recent utterance.
    fn utterance_state(&self) -> UtteranceState;

    /// Synthesize one utterance, returning a fresh one-shot audio stream.
    ///
    /// Suspends until the backend has accepted the utterance (first-chunk
    /// latency is the backend's round trip), then streams. Empty or
    /// whitespace-only text fails with [`SynthesizerError::InvalidInput`].
    async fn synthesize(&mut self, text: &str) -> SynthResult<SynthesisStream>;

    /// Signal that the in-flight utterance's audio is no longer wanted.
    ///
    /// Best-effort and time-bounded: the stream stops within one backend
    /// round trip and terminates with a cancellation marker. Idempotent;
    /// a no-op when nothing is in flight. Safe to call concurrently with
    /// an in-flight `synthesize` from a different control path.
    fn cancel(&self);

    /// Release any held connection. Idempotent; the instance is terminal
    /// afterwards.
    async fn close(&mut self) -> SynthResult<()>;
}

/// Boxed trait object for synthesizer backends.
pub type BoxedSynthesizer = Box<dyn BaseSynthesizer>;

/// Shared caller-input check: synthesis text must be non-empty.
///
/// Whitespace-only text is rejected too; both wire protocols treat it as a
/// no-op flush, which would stall the stream contract.
pub(crate) fn validate_utterance_text(text: &str) -> SynthResult<()> {
    if text.trim().is_empty() {
        return Err(SynthesizerError::InvalidInput(
            "synthesis text must be non-empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validate_ok() {
        let config = SynthesizerConfig {
            provider: "elevenlabs".to_string(),
            api_key: "test-key".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate_missing_provider() {
        let config = SynthesizerConfig {
            api_key: "test-key".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SynthesizerError::ConfigValidation(_)));
    }

    #[test]
    fn test_config_validate_empty_api_key() {
        let config = SynthesizerConfig {
            provider: "elevenlabs".to_string(),
            api_key: "   ".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SynthesizerError::ConfigValidation(_)));
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn test_config_validate_bad_endpoint_override() {
        let config = SynthesizerConfig {
            provider: "elevenlabs".to_string(),
            api_key: "test-key".to_string(),
            endpoint_override: Some("not a url".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SynthesizerError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_config_validate_zero_sample_rate() {
        let config = SynthesizerConfig {
            provider: "elevenlabs".to_string(),
            api_key: "test-key".to_string(),
            sample_rate: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy_backoff_is_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(250));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(1000));
    }

    #[test]
    fn test_retry_policy_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            ..Default::default()
        };
        assert_eq!(policy.backoff_for(20), Duration::from_millis(4000));
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));

        assert!(!RetryPolicy::disabled().should_retry(0));
    }

    #[test]
    fn test_utterance_state_display() {
        assert_eq!(UtteranceState::Idle.to_string(), "Idle");
        assert_eq!(UtteranceState::Synthesizing.to_string(), "Synthesizing");
        assert_eq!(UtteranceState::Closed.to_string(), "Closed");
    }

    #[test]
    fn test_cancel_signal_is_idempotent_when_idle() {
        let signal = CancelSignal::default();
        // No utterance armed yet; cancelling must not panic or latch state
        signal.cancel();
        signal.cancel();

        // A freshly armed token is unaffected by earlier cancels
        let token = signal.arm();
        assert!(!token.is_cancelled());
        signal.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_validate_utterance_text() {
        assert!(validate_utterance_text("hello").is_ok());
        assert!(matches!(
            validate_utterance_text(""),
            Err(SynthesizerError::InvalidInput(_))
        ));
        assert!(matches!(
            validate_utterance_text("   \n\t"),
            Err(SynthesizerError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_orders_chunks_and_terminates_once() {
        let state = StateCell::default();
        let (mut tx, mut stream) = SynthesisStream::channel(state.clone());

        tokio::spawn(async move {
            assert!(tx.audio(Bytes::from_static(b"aa")).await);
            assert!(tx.audio(Bytes::from_static(b"bb")).await);
            tx.finish().await;
        });

        let mut sequences = Vec::new();
        let mut terminals = 0;
        while let Some(event) = stream.recv().await {
            match event.unwrap() {
                SynthesisEvent::Audio(chunk) => sequences.push(chunk.sequence),
                SynthesisEvent::UtteranceEnd => terminals += 1,
                SynthesisEvent::Cancelled => panic!("unexpected cancellation"),
            }
        }

        assert_eq!(sequences, vec![0, 1]);
        assert_eq!(terminals, 1);
        assert_eq!(state.get(), UtteranceState::Completed);
    }

    #[tokio::test]
    async fn test_collect_audio_concatenates_chunks() {
        let state = StateCell::default();
        let (mut tx, stream) = SynthesisStream::channel(state);

        tokio::spawn(async move {
            tx.audio(Bytes::from_static(b"hel")).await;
            tx.audio(Bytes::from_static(b"lo")).await;
            tx.finish().await;
        });

        let collected = stream.collect_audio().await.unwrap();
        assert_eq!(&collected.audio[..], b"hello");
        assert_eq!(collected.chunks, 2);
        assert!(!collected.cancelled);
    }

    #[tokio::test]
    async fn test_collect_audio_reports_cancellation() {
        let state = StateCell::default();
        let (mut tx, stream) = SynthesisStream::channel(state.clone());

        tokio::spawn(async move {
            tx.audio(Bytes::from_static(b"partial")).await;
            tx.cancelled().await;
        });

        let collected = stream.collect_audio().await.unwrap();
        assert!(collected.cancelled);
        assert_eq!(collected.chunks, 1);
        assert_eq!(state.get(), UtteranceState::Cancelled);
    }

    #[tokio::test]
    async fn test_chunk_sender_reports_dropped_consumer() {
        let state = StateCell::default();
        let (mut tx, stream) = SynthesisStream::channel(state.clone());
        drop(stream);

        assert!(!tx.audio(Bytes::from_static(b"xx")).await);
        tx.abandoned();
        assert_eq!(state.get(), UtteranceState::Idle);
    }
}
