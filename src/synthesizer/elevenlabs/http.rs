//! Per-request HTTP variant of the ElevenLabs synthesizer.
//!
//! Each utterance is an independent chunked `POST` against
//! `/v1/text-to-speech/{voice_id}/stream`; response body chunks are
//! forwarded as audio chunks as they arrive. Having no cross-utterance
//! connection state, this variant gets per-utterance error isolation for
//! free, at the cost of a full connection round trip of first-chunk
//! latency.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::ElevenLabsConfig;
use super::messages::VoiceSettings;
use super::{ELEVENLABS_KIND, MAX_TEXT_LENGTH};
use crate::synthesizer::base::{
    BaseSynthesizer, CancelSignal, StateCell, SynthResult, SynthesisStream, SynthesizerConfig,
    SynthesizerError, UtteranceState, validate_utterance_text,
};

/// Outcome of a single request attempt, before retry policy is applied.
enum Attempt {
    Ok(reqwest::Response),
    Transient(String),
    Fatal(SynthesizerError),
}

/// Builds the streaming synthesis request for one utterance.
struct SynthesisRequestBuilder<'a> {
    config: &'a ElevenLabsConfig,
    text: &'a str,
}

impl<'a> SynthesisRequestBuilder<'a> {
    fn new(config: &'a ElevenLabsConfig, text: &'a str) -> Self {
        Self { config, text }
    }

    fn build_http_request(&self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let body = json!({
            "text": self.text,
            "model_id": self.config.model_id,
            "voice_settings": VoiceSettings {
                stability: self.config.stability,
                similarity_boost: self.config.similarity_boost,
            },
        });

        client
            .post(self.config.http_url())
            .header("xi-api-key", &self.config.base.api_key)
            .header("Accept", self.config.output_format.content_type())
            .json(&body)
    }
}

/// ElevenLabs synthesizer over per-request chunked HTTP.
#[derive(Debug)]
pub struct ElevenLabsSynthesizer {
    config: ElevenLabsConfig,
    client: reqwest::Client,
    cancel: CancelSignal,
    state: StateCell,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl ElevenLabsSynthesizer {
    /// Create a new instance from a validated generic config.
    pub fn new(base: SynthesizerConfig) -> SynthResult<Self> {
        let config = ElevenLabsConfig::from_base(base)?;

        let connect_timeout = config.base.connection_timeout_secs.unwrap_or(10);
        // Connect timeout only; a whole-request timeout would cut off
        // long streaming responses.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .build()
            .map_err(|e| {
                SynthesizerError::BackendConnection(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            config,
            client,
            cancel: CancelSignal::default(),
            state: StateCell::default(),
            task: None,
            closed: false,
        })
    }

    fn ensure_open(&self) -> SynthResult<()> {
        if self.closed {
            return Err(SynthesizerError::InvalidInput(
                "synthesizer has been closed".to_string(),
            ));
        }
        Ok(())
    }

    async fn attempt_request(&self, text: &str) -> Attempt {
        let request = SynthesisRequestBuilder::new(&self.config, text)
            .build_http_request(&self.client);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Transient(format!("request failed: {e}")),
        };

        let status = response.status();
        if status.is_success() {
            return Attempt::Ok(response);
        }

        let detail = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            Attempt::Transient(format!("HTTP {status}: {detail}"))
        } else {
            // 4xx other than rate limiting is a semantic rejection;
            // retrying cannot help
            Attempt::Fatal(SynthesizerError::BackendRejected(format!(
                "HTTP {status}: {detail}"
            )))
        }
    }

    /// Issue the request, retrying transient failures per policy.
    ///
    /// Returns `Ok(None)` when the caller cancelled the utterance while
    /// the retry sequence was still in progress; cancellation must not
    /// wait out a backoff delay or burn another attempt.
    async fn request_with_retry(
        &self,
        text: &str,
        token: &CancellationToken,
    ) -> SynthResult<Option<reqwest::Response>> {
        let retry = &self.config.base.retry;
        let mut retries = 0u32;

        loop {
            if token.is_cancelled() {
                return Ok(None);
            }
            match self.attempt_request(text).await {
                Attempt::Ok(response) => return Ok(Some(response)),
                Attempt::Fatal(err) => return Err(err),
                Attempt::Transient(detail) => {
                    if !retry.should_retry(retries) {
                        return Err(SynthesizerError::BackendConnection(format!(
                            "synthesis request failed after {} attempt(s): {detail}",
                            retries + 1
                        )));
                    }
                    retries += 1;
                    let delay = retry.backoff_for(retries);
                    warn!(
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "transient synthesis failure, retrying: {detail}"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Ok(None),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BaseSynthesizer for ElevenLabsSynthesizer {
    fn kind(&self) -> &str {
        ELEVENLABS_KIND
    }

    fn config(&self) -> &SynthesizerConfig {
        &self.config.base
    }

    fn utterance_state(&self) -> UtteranceState {
        self.state.get()
    }

    async fn synthesize(&mut self, text: &str) -> SynthResult<SynthesisStream> {
        self.ensure_open()?;
        validate_utterance_text(text)?;
        if text.len() > MAX_TEXT_LENGTH {
            return Err(SynthesizerError::InvalidInput(format!(
                "synthesis text exceeds {MAX_TEXT_LENGTH} bytes"
            )));
        }

        // Abandon any previous utterance's producer before starting fresh
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let token = self.cancel.arm();
        self.state.set(UtteranceState::Synthesizing);

        let response = match self.request_with_retry(text, &token).await {
            // Cancellation raced the request setup; nothing was streamed yet
            Ok(Some(response)) if !token.is_cancelled() => response,
            Ok(_) => {
                debug!("utterance cancelled before streaming began");
                let (chunk_tx, stream) = SynthesisStream::channel(self.state.clone());
                chunk_tx.cancelled().await;
                return Ok(stream);
            }
            Err(err) => {
                self.state.set(UtteranceState::Failed);
                return Err(err);
            }
        };

        let (mut chunk_tx, stream) = SynthesisStream::channel(self.state.clone());
        let frame_timeout =
            Duration::from_secs(self.config.base.request_timeout_secs.unwrap_or(30));

        self.task = Some(tokio::spawn(async move {
            let mut body = response.bytes_stream();
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("utterance cancelled mid-stream, dropping response body");
                        chunk_tx.cancelled().await;
                        return;
                    }
                    chunk = timeout(frame_timeout, body.next()) => match chunk {
                        Err(_) => {
                            chunk_tx
                                .fail(SynthesizerError::BackendConnection(
                                    "timed out waiting for audio data".to_string(),
                                ))
                                .await;
                            return;
                        }
                        Ok(Some(Ok(bytes))) => {
                            if bytes.is_empty() {
                                continue;
                            }
                            if !chunk_tx.audio(bytes).await {
                                chunk_tx.abandoned();
                                return;
                            }
                        }
                        Ok(Some(Err(e))) => {
                            chunk_tx
                                .fail(SynthesizerError::BackendConnection(format!(
                                    "response stream failed mid-utterance: {e}"
                                )))
                                .await;
                            return;
                        }
                        Ok(None) => {
                            chunk_tx.finish().await;
                            return;
                        }
                    }
                }
            }
        }));

        Ok(stream)
    }

    fn cancel(&self) {
        debug!("cancellation requested");
        self.cancel.cancel();
    }

    async fn close(&mut self) -> SynthResult<()> {
        if self.closed {
            return Ok(());
        }
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.closed = true;
        self.state.set(UtteranceState::Closed);
        Ok(())
    }
}

impl Drop for ElevenLabsSynthesizer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SynthesizerConfig {
        SynthesizerConfig {
            provider: "elevenlabs".to_string(),
            api_key: "test-key".to_string(),
            voice_id: Some("voice-123".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_request_url_and_headers() {
        let config = ElevenLabsConfig::from_base(test_config()).unwrap();
        let client = reqwest::Client::new();
        let request = SynthesisRequestBuilder::new(&config, "Hello")
            .build_http_request(&client)
            .build()
            .unwrap();

        assert_eq!(request.method().as_str(), "POST");
        assert_eq!(
            request.url().as_str(),
            "https://api.elevenlabs.io/v1/text-to-speech/voice-123/stream?output_format=pcm_16000"
        );
        assert_eq!(request.headers()["xi-api-key"], "test-key");
        assert_eq!(request.headers()["Accept"], "audio/pcm");
    }

    #[test]
    fn test_request_body() {
        let config = ElevenLabsConfig::from_base(test_config()).unwrap();
        let client = reqwest::Client::new();
        let request = SynthesisRequestBuilder::new(&config, "Hello there")
            .build_http_request(&client)
            .build()
            .unwrap();

        let body: serde_json::Value =
            serde_json::from_slice(request.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["text"], "Hello there");
        assert_eq!(body["model_id"], "eleven_turbo_v2");
        assert_eq!(body["voice_settings"]["stability"], 0.5);
        assert_eq!(body["voice_settings"]["similarity_boost"], 0.75);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = SynthesizerConfig {
            api_key: String::new(),
            ..test_config()
        };
        assert!(matches!(
            ElevenLabsSynthesizer::new(config),
            Err(SynthesizerError::ConfigValidation(_))
        ));
    }

    #[tokio::test]
    async fn test_synthesize_rejects_empty_text() {
        let mut synth = ElevenLabsSynthesizer::new(test_config()).unwrap();
        assert!(matches!(
            synth.synthesize("   ").await,
            Err(SynthesizerError::InvalidInput(_))
        ));
        // Input rejection happens before any utterance begins
        assert_eq!(synth.utterance_state(), UtteranceState::Idle);
    }

    #[tokio::test]
    async fn test_synthesize_rejects_oversized_text() {
        let mut synth = ElevenLabsSynthesizer::new(test_config()).unwrap();
        let text = "a".repeat(MAX_TEXT_LENGTH + 1);
        assert!(matches!(
            synth.synthesize(&text).await,
            Err(SynthesizerError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let mut synth = ElevenLabsSynthesizer::new(test_config()).unwrap();
        synth.close().await.unwrap();
        synth.close().await.unwrap();
        assert_eq!(synth.utterance_state(), UtteranceState::Closed);
        assert!(synth.synthesize("hello").await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_without_utterance_is_noop() {
        let synth = ElevenLabsSynthesizer::new(test_config()).unwrap();
        synth.cancel();
        synth.cancel();
        assert_eq!(synth.utterance_state(), UtteranceState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_backoff_is_prompt() {
        use crate::synthesizer::base::RetryPolicy;
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        // Backoff long enough that waiting it out would be observable
        let config = SynthesizerConfig {
            endpoint_override: Some(server.uri()),
            retry: RetryPolicy {
                max_retries: 1,
                initial_backoff_ms: 60_000,
                max_backoff_ms: 60_000,
                backoff_multiplier: 2.0,
            },
            ..test_config()
        };
        let mut synth = ElevenLabsSynthesizer::new(config).unwrap();

        let signal = synth.cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            signal.cancel();
        });

        let started = std::time::Instant::now();
        let stream = synth.synthesize("hello").await.unwrap();
        let collected = stream.collect_audio().await.unwrap();

        assert!(collected.cancelled);
        assert_eq!(collected.chunks, 0);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(synth.utterance_state(), UtteranceState::Cancelled);
    }
}
