//! Persistent-streaming websocket variant of the ElevenLabs synthesizer.
//!
//! One `stream-input` connection is held open across utterances: the
//! beginning-of-stream message is sent once per connection, each
//! `synthesize` call sends one flushed text message, and the connection is
//! parked again once the backend's `isFinal` frame arrives. First-chunk
//! latency for reused connections skips the connection round trip
//! entirely.
//!
//! The protocol has no per-utterance isolation, so a cancelled or failed
//! utterance tears the connection down; the next `synthesize` call
//! reconnects lazily.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::config::ElevenLabsConfig;
use super::messages::{StreamEnd, StreamFrame, StreamInit, StreamText, VoiceSettings};
use super::{ELEVENLABS_KIND, MAX_TEXT_LENGTH};
use crate::synthesizer::base::{
    BaseSynthesizer, CancelSignal, StateCell, SynthResult, SynthesisStream, SynthesizerConfig,
    SynthesizerError, UtteranceState, validate_utterance_text,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Slot holding the parked connection between utterances. Empty while an
/// utterance is in flight (the producing task owns the socket) and after a
/// teardown.
type ConnectionSlot = Arc<tokio::sync::Mutex<Option<WsStream>>>;

fn encode<T: Serialize>(message: &T) -> SynthResult<String> {
    serde_json::to_string(message).map_err(|e| {
        SynthesizerError::BackendConnection(format!("failed to encode websocket message: {e}"))
    })
}

/// ElevenLabs synthesizer over a persistent `stream-input` websocket.
#[derive(Debug)]
pub struct ElevenLabsWsSynthesizer {
    config: ElevenLabsConfig,
    conn: ConnectionSlot,
    cancel: CancelSignal,
    state: StateCell,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl ElevenLabsWsSynthesizer {
    /// Create a new instance from a validated generic config.
    ///
    /// No connection is opened yet; the first `synthesize` call connects.
    pub fn new(base: SynthesizerConfig) -> SynthResult<Self> {
        let config = ElevenLabsConfig::from_base(base)?;
        Ok(Self {
            config,
            conn: Arc::new(tokio::sync::Mutex::new(None)),
            cancel: CancelSignal::default(),
            state: StateCell::default(),
            task: None,
            closed: false,
        })
    }

    /// Whether an idle persistent connection is currently parked.
    ///
    /// `false` both before the first utterance and while one is in flight.
    pub async fn has_parked_connection(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    fn ensure_open(&self) -> SynthResult<()> {
        if self.closed {
            return Err(SynthesizerError::InvalidInput(
                "synthesizer has been closed".to_string(),
            ));
        }
        Ok(())
    }

    fn voice_settings(&self) -> VoiceSettings {
        VoiceSettings {
            stability: self.config.stability,
            similarity_boost: self.config.similarity_boost,
        }
    }

    /// Open a fresh connection and send the beginning-of-stream message.
    async fn open_connection(&self) -> SynthResult<WsStream> {
        let url = self.config.ws_url();
        let connect_timeout =
            Duration::from_secs(self.config.base.connection_timeout_secs.unwrap_or(10));

        debug!(url = %url, "opening websocket synthesis connection");
        let (mut ws, _response) = timeout(connect_timeout, connect_async(&url))
            .await
            .map_err(|_| {
                SynthesizerError::BackendConnection(
                    "timed out establishing websocket connection".to_string(),
                )
            })?
            .map_err(|e| match e {
                WsError::Http(response) => SynthesizerError::BackendRejected(format!(
                    "websocket handshake rejected: HTTP {}",
                    response.status()
                )),
                other => SynthesizerError::BackendConnection(format!(
                    "websocket connection failed: {other}"
                )),
            })?;

        let init = StreamInit::new(&self.config.base.api_key, self.voice_settings());
        let payload = encode(&init)?;
        ws.send(Message::Text(payload.into())).await.map_err(|e| {
            SynthesizerError::BackendConnection(format!(
                "failed to send stream init message: {e}"
            ))
        })?;

        info!(voice_id = %self.config.voice_id, "websocket synthesis connection established");
        Ok(ws)
    }

    /// Send one utterance, reusing the parked connection when possible.
    ///
    /// A stale parked connection gets exactly one reconnect attempt before
    /// the call fails.
    async fn dispatch_utterance(&self, payload: &str) -> SynthResult<WsStream> {
        if let Some(ws) = self.conn.lock().await.take() {
            match Self::try_reuse(ws, payload).await {
                Ok(ws) => {
                    debug!("reusing persistent synthesis connection");
                    return Ok(ws);
                }
                Err(reason) => {
                    warn!("parked connection is stale, reconnecting: {reason}");
                }
            }
        }

        let mut ws = self.open_connection().await?;
        ws.send(Message::Text(payload.to_string().into()))
            .await
            .map_err(|e| {
                SynthesizerError::BackendConnection(format!(
                    "failed to send utterance text: {e}"
                ))
            })?;
        Ok(ws)
    }

    /// Commit an utterance to a parked connection.
    ///
    /// A connection the backend dropped while parked still accepts one
    /// local write, so the read side is probed for a pending close before
    /// the utterance text is sent over it.
    async fn try_reuse(mut ws: WsStream, payload: &str) -> Result<WsStream, String> {
        match timeout(Duration::ZERO, ws.next()).await {
            // Nothing pending; the connection looks live
            Err(_) => {}
            Ok(None) => return Err("connection closed while parked".to_string()),
            Ok(Some(Ok(Message::Close(_)))) => {
                return Err("backend closed the connection while parked".to_string());
            }
            Ok(Some(Err(e))) => return Err(format!("connection error while parked: {e}")),
            // Stray control frame; the connection is still live
            Ok(Some(Ok(_))) => {}
        }

        ws.send(Message::Text(payload.to_string().into()))
            .await
            .map_err(|e| format!("send on parked connection failed: {e}"))?;
        Ok(ws)
    }
}

#[async_trait]
impl BaseSynthesizer for ElevenLabsWsSynthesizer {
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

        if let Some(task) = self.task.take() {
            task.abort();
        }
        let token = self.cancel.arm();
        self.state.set(UtteranceState::Synthesizing);

        let payload = encode(&StreamText::utterance(text))?;
        let mut ws = match self.dispatch_utterance(&payload).await {
            Ok(ws) => ws,
            Err(err) => {
                self.state.set(UtteranceState::Failed);
                return Err(err);
            }
        };

        let (mut chunk_tx, stream) = SynthesisStream::channel(self.state.clone());
        let conn_slot = Arc::clone(&self.conn);
        let frame_timeout =
            Duration::from_secs(self.config.base.request_timeout_secs.unwrap_or(30));

        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        // stream-input has no per-utterance cancel; tear the
                        // connection down so leftover audio from this
                        // utterance cannot bleed into the next one
                        debug!("utterance cancelled, tearing down websocket");
                        let _ = ws.close(None).await;
                        chunk_tx.cancelled().await;
                        return;
                    }
                    frame = timeout(frame_timeout, ws.next()) => match frame {
                        Err(_) => {
                            chunk_tx
                                .fail(SynthesizerError::BackendConnection(
                                    "timed out waiting for audio frame".to_string(),
                                ))
                                .await;
                            return;
                        }
                        Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                            chunk_tx
                                .fail(SynthesizerError::BackendConnection(
                                    "connection closed mid-utterance".to_string(),
                                ))
                                .await;
                            return;
                        }
                        Ok(Some(Err(e))) => {
                            chunk_tx
                                .fail(SynthesizerError::BackendConnection(format!(
                                    "websocket error mid-utterance: {e}"
                                )))
                                .await;
                            return;
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            let frame = match StreamFrame::parse(text.as_str()) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    warn!("skipping unparseable frame: {e}");
                                    continue;
                                }
                            };

                            if let Some(err) = frame.error_text() {
                                chunk_tx
                                    .fail(SynthesizerError::BackendRejected(err))
                                    .await;
                                return;
                            }

                            match frame.decode_audio() {
                                Ok(Some(audio)) => {
                                    if !chunk_tx.audio(audio).await {
                                        chunk_tx.abandoned();
                                        return;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    chunk_tx
                                        .fail(SynthesizerError::BackendConnection(e))
                                        .await;
                                    return;
                                }
                            }

                            if frame.is_final == Some(true) {
                                // Park the connection before signalling the
                                // end, so a consumer starting the next
                                // utterance right away finds it reusable
                                *conn_slot.lock().await = Some(ws);
                                chunk_tx.finish().await;
                                return;
                            }
                        }
                        // Ping/pong and binary frames carry no synthesis data
                        Ok(Some(Ok(_))) => {}
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
        if let Some(mut ws) = self.conn.lock().await.take() {
            // Polite end-of-stream, then close; best-effort on both
            if let Ok(payload) = serde_json::to_string(&StreamEnd::default()) {
                let _ = ws.send(Message::Text(payload.into())).await;
            }
            let _ = ws.close(None).await;
            debug!("persistent synthesis connection closed");
        }
        self.closed = true;
        self.state.set(UtteranceState::Closed);
        Ok(())
    }
}

impl Drop for ElevenLabsWsSynthesizer {
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
            streaming: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_new_does_not_connect() {
        let synth = ElevenLabsWsSynthesizer::new(test_config()).unwrap();
        assert!(!synth.has_parked_connection().await);
        assert_eq!(synth.utterance_state(), UtteranceState::Idle);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = SynthesizerConfig {
            sample_rate: Some(48000),
            ..test_config()
        };
        assert!(matches!(
            ElevenLabsWsSynthesizer::new(config),
            Err(SynthesizerError::ConfigValidation(_))
        ));
    }

    #[tokio::test]
    async fn test_synthesize_rejects_empty_text() {
        let mut synth = ElevenLabsWsSynthesizer::new(test_config()).unwrap();
        assert!(matches!(
            synth.synthesize("").await,
            Err(SynthesizerError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let mut synth = ElevenLabsWsSynthesizer::new(test_config()).unwrap();
        synth.close().await.unwrap();
        synth.close().await.unwrap();
        assert_eq!(synth.utterance_state(), UtteranceState::Closed);
        assert!(matches!(
            synth.synthesize("hello").await,
            Err(SynthesizerError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_marks_utterance_failed() {
        // Nothing listens on this port; the single connect attempt fails
        let config = SynthesizerConfig {
            endpoint_override: Some("ws://127.0.0.1:1".to_string()),
            connection_timeout_secs: Some(1),
            retry: crate::synthesizer::base::RetryPolicy::disabled(),
            ..test_config()
        };
        let mut synth = ElevenLabsWsSynthesizer::new(config).unwrap();
        let err = synth.synthesize("hello").await.unwrap_err();
        assert!(matches!(err, SynthesizerError::BackendConnection(_)));
        assert_eq!(synth.utterance_state(), UtteranceState::Failed);
    }
}
