//! Live conversation WebSocket client
//!
//! Manages the WebSocket connection lifecycle for one conversation.
//!
//! # Connection Flow
//!
//! 1. `open()` - Spawn the connection task and return immediately
//! 2. Connection task - Connect, send `setup`, wait for `setupComplete`, emit `Opened`
//! 3. `send_audio()` - Queue microphone chunks (never blocks)
//! 4. Reader - Forward server content as `ChannelEvent::Message`
//! 5. `close()` - Send a close frame; `Closed` is emitted when the task ends
//!
//! # Retry Strategy
//!
//! Initial connection retries 3 times with exponential backoff (1s, 2s, 4s).
//! Mid-session disconnects do NOT reconnect - the learner reconnects explicitly.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientMessage, ServerMessage, SetupConfig, LIVE_API_URL};
use super::{ChannelEvent, InboundContent};
use crate::error::SessionError;

/// Connection timeout for initial WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for waiting for setupComplete
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum retry attempts for initial connection
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Outbound frames queued before sends start failing
const OUTBOUND_QUEUE: usize = 64;

/// Inbound events buffered for the controller
const EVENT_QUEUE: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything needed to open a live channel
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub api_key: String,
    pub setup: SetupConfig,
}

/// Outbound half of an open channel
pub trait LiveTransport: Send {
    /// Queue one encoded audio chunk. Never blocks.
    fn send_audio(&mut self, payload: String, mime_type: &str) -> Result<(), SessionError>;

    /// Ask the remote side to close. Safe to call more than once.
    fn close(&mut self);
}

/// Opens live channels
///
/// `open` returns immediately; progress arrives as [`ChannelEvent`]s.
pub trait ChannelConnector: Send {
    fn open(
        &mut self,
        request: OpenRequest,
    ) -> Result<(Box<dyn LiveTransport>, mpsc::Receiver<ChannelEvent>), SessionError>;
}

/// Connector for the real WebSocket endpoint
#[derive(Debug, Clone, Default)]
pub struct LiveConnector;

impl ChannelConnector for LiveConnector {
    fn open(
        &mut self,
        request: OpenRequest,
    ) -> Result<(Box<dyn LiveTransport>, mpsc::Receiver<ChannelEvent>), SessionError> {
        let (session, events) = LiveSession::open(request)?;
        Ok((Box::new(session), events))
    }
}

/// Handle to a live channel
///
/// The WebSocket itself is owned by a background task; this handle only
/// queues outbound frames and requests shutdown.
pub struct LiveSession {
    /// Queue drained by the writer; `None` once closed
    outbound_tx: Option<mpsc::Sender<ClientMessage>>,
    /// Stops the connection task
    cancel: CancellationToken,
    /// Count of audio chunks queued (for logging)
    frames_sent: u64,
}

impl LiveSession {
    /// Start connecting in the background
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        request: OpenRequest,
    ) -> Result<(Self, mpsc::Receiver<ChannelEvent>), SessionError> {
        if request.api_key.is_empty() {
            return Err(SessionError::Configuration(
                "API key is required to open a live session".to_string(),
            ));
        }
        if let Some(field) = request.setup.missing_field() {
            return Err(SessionError::Configuration(format!(
                "{} is required to open a live session",
                field
            )));
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SessionError::Channel(format!("no async runtime: {}", e)))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let cancel = CancellationToken::new();

        runtime.spawn(run_connection(
            request,
            outbound_rx,
            events_tx,
            cancel.clone(),
        ));

        Ok((
            Self {
                outbound_tx: Some(outbound_tx),
                cancel,
                frames_sent: 0,
            },
            events_rx,
        ))
    }
}

impl LiveTransport for LiveSession {
    fn send_audio(&mut self, payload: String, mime_type: &str) -> Result<(), SessionError> {
        let tx = self
            .outbound_tx
            .as_ref()
            .ok_or_else(|| SessionError::Transmit("channel closed".to_string()))?;

        tx.try_send(ClientMessage::audio(payload, mime_type))
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    SessionError::Transmit("outbound queue full".to_string())
                }
                TrySendError::Closed(_) => SessionError::Transmit("channel closed".to_string()),
            })?;

        self.frames_sent += 1;
        if self.frames_sent % 50 == 0 {
            log::debug!("LiveSession: queued {} audio chunks", self.frames_sent);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.outbound_tx.take().is_some() {
            log::info!(
                "LiveSession: closing ({} audio chunks sent)",
                self.frames_sent
            );
        }
        self.cancel.cancel();
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        // Ensure the connection task winds down if the handle is dropped without close()
        self.cancel.cancel();
    }
}

/// Connection task: establish, pump frames, then report `Closed` once
async fn run_connection(
    request: OpenRequest,
    mut outbound_rx: mpsc::Receiver<ClientMessage>,
    events_tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
) {
    let reason = tokio::select! {
        biased;

        _ = cancel.cancelled() => Some("closed by client".to_string()),

        result = connect_with_retries(&request) => match result {
            Ok(ws) => pump(ws, &mut outbound_rx, &events_tx, &cancel).await,
            Err(e) => {
                log::warn!("LiveSession: giving up on connection: {}", e);
                let _ = events_tx
                    .send(ChannelEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                Some(e.to_string())
            }
        },
    };

    log::info!("LiveSession: closed ({:?})", reason);
    let _ = events_tx.send(ChannelEvent::Closed { reason }).await;
}

async fn connect_with_retries(request: &OpenRequest) -> Result<WsStream, SessionError> {
    let mut last_error = None;

    for attempt in 0..MAX_RETRIES {
        if attempt > 0 {
            let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
            log::info!(
                "Retrying live connection in {:?} (attempt {}/{})",
                delay,
                attempt + 1,
                MAX_RETRIES
            );
            tokio::time::sleep(delay).await;
        }

        match try_connect(request).await {
            Ok(ws) => return Ok(ws),
            Err(e) => {
                log::warn!("Connection attempt {} failed: {}", attempt + 1, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| SessionError::Channel("Max retries exceeded".to_string())))
}

/// Single connection attempt (no retries): connect and complete setup
async fn try_connect(request: &OpenRequest) -> Result<WsStream, SessionError> {
    let url = format!("{}?key={}", LIVE_API_URL, request.api_key);
    let ws_request = url
        .into_client_request()
        .map_err(|e| SessionError::Channel(e.to_string()))?;

    log::info!("Connecting to live endpoint...");

    let (mut ws, _response) = timeout(
        CONNECTION_TIMEOUT,
        connect_async_with_config(
            ws_request, None, false, // disable_nagle (we want low latency)
        ),
    )
    .await
    .map_err(|_| SessionError::Channel("Connection timeout".to_string()))?
    .map_err(|e| SessionError::Channel(e.to_string()))?;

    let setup = serde_json::to_string(&ClientMessage::Setup(request.setup.clone()))
        .map_err(|e| SessionError::Configuration(e.to_string()))?;
    ws.send(Message::Text(setup))
        .await
        .map_err(|e| SessionError::Channel(e.to_string()))?;

    log::info!("WebSocket connected, waiting for setupComplete...");

    let handshake = async {
        while let Some(msg_result) = ws.next().await {
            match msg_result {
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "Connection closed before setup completed".to_string());
                    return Err(SessionError::Channel(reason));
                }
                Ok(msg) => match decode_server_message(&msg) {
                    Some(Ok(server_msg)) if server_msg.is_setup_complete() => {
                        log::info!("Live session set up");
                        return Ok(());
                    }
                    Some(Ok(server_msg)) => {
                        if let Some(error) = server_msg.error_info() {
                            return Err(SessionError::Channel(error.message.clone()));
                        }
                        log::debug!("Ignoring message while waiting for setupComplete");
                    }
                    Some(Err(e)) => log::warn!("Failed to parse message: {}", e),
                    None => {} // Ignore ping/pong
                },
                Err(e) => return Err(SessionError::Channel(e.to_string())),
            }
        }
        Err(SessionError::Channel("Stream ended".to_string()))
    };

    timeout(SETUP_TIMEOUT, handshake)
        .await
        .map_err(|_| SessionError::Channel("Setup timeout".to_string()))??;

    Ok(ws)
}

/// Shuttle frames until either side closes
///
/// Returns the close reason, if any.
async fn pump(
    ws: WsStream,
    outbound_rx: &mut mpsc::Receiver<ClientMessage>,
    events_tx: &mpsc::Sender<ChannelEvent>,
    cancel: &CancellationToken,
) -> Option<String> {
    let (mut write, mut read) = ws.split();

    if events_tx.send(ChannelEvent::Opened).await.is_err() {
        let _ = write.close().await;
        return Some("session dropped".to_string());
    }

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                if let Err(e) = write.close().await {
                    log::warn!("Error closing WebSocket: {}", e);
                }
                return Some("closed by client".to_string());
            }

            outbound = outbound_rx.recv() => {
                let Some(msg) = outbound else {
                    let _ = write.close().await;
                    return Some("closed by client".to_string());
                };

                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        log::warn!("LiveSession: failed to serialize outbound frame: {}", e);
                        continue;
                    }
                };

                if let Err(e) = write.send(Message::Text(json)).await {
                    log::warn!("LiveSession: send failed: {}", e);
                    let _ = events_tx
                        .send(ChannelEvent::Error {
                            message: format!("send failed: {}", e),
                        })
                        .await;
                    return Some(e.to_string());
                }
            }

            incoming = read.next() => match incoming {
                Some(Ok(Message::Close(frame))) => {
                    log::info!("WebSocket closed by server");
                    return frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                }
                Some(Ok(msg)) => {
                    let event = match decode_server_message(&msg) {
                        Some(Ok(server_msg)) => server_event(server_msg),
                        Some(Err(e)) => {
                            log::warn!("Failed to parse message: {}", e);
                            None
                        }
                        None => None, // Ignore ping/pong
                    };

                    if let Some(event) = event {
                        if events_tx.send(event).await.is_err() {
                            log::debug!("Event receiver dropped");
                            let _ = write.close().await;
                            return Some("session dropped".to_string());
                        }
                    }
                }
                Some(Err(e)) => {
                    log::warn!("WebSocket error: {}", e);
                    let _ = events_tx
                        .send(ChannelEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    return Some(e.to_string());
                }
                None => return Some("stream ended".to_string()),
            },
        }
    }
}

/// JSON payload of a text or binary frame
fn decode_server_message(msg: &Message) -> Option<Result<ServerMessage, serde_json::Error>> {
    match msg {
        Message::Text(text) => Some(serde_json::from_str(text)),
        Message::Binary(bytes) => Some(serde_json::from_slice(bytes)),
        _ => None,
    }
}

/// Map a parsed server message to the event the controller sees
fn server_event(mut msg: ServerMessage) -> Option<ChannelEvent> {
    if let Some(error) = msg.error.take() {
        return Some(ChannelEvent::Error {
            message: error.message,
        });
    }

    if let Some(go_away) = msg.go_away.take() {
        log::warn!(
            "LiveSession: server going away (time left: {:?})",
            go_away.time_left
        );
    }

    msg.into_inbound()
        .filter(|content| *content != InboundContent::default())
        .map(ChannelEvent::Message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(api_key: &str) -> OpenRequest {
        OpenRequest {
            api_key: api_key.to_string(),
            setup: SetupConfig::new("gemini-live", "Puck", "Be a patient tutor."),
        }
    }

    #[test]
    fn test_open_requires_api_key() {
        let result = LiveSession::open(request(""));
        assert!(matches!(result, Err(SessionError::Configuration(_))));
    }

    #[test]
    fn test_open_rejects_blank_model_or_voice() {
        let mut blank_voice = request("key");
        blank_voice.setup = SetupConfig::new("gemini-live", "", "Be a patient tutor.");
        assert!(matches!(
            LiveSession::open(blank_voice),
            Err(SessionError::Configuration(ref m)) if m.contains("voice")
        ));

        let mut blank_model = request("key");
        blank_model.setup = SetupConfig::new("", "Puck", "Be a patient tutor.");
        assert!(matches!(
            LiveSession::open(blank_model),
            Err(SessionError::Configuration(ref m)) if m.contains("model")
        ));
    }

    #[test]
    fn test_open_outside_runtime_fails() {
        let result = LiveSession::open(request("key"));
        assert!(matches!(result, Err(SessionError::Channel(_))));
    }

    #[tokio::test]
    async fn test_close_before_connect_emits_single_closed() {
        let (mut session, mut events) = LiveSession::open(request("key")).unwrap();
        session.close();
        session.close();

        match events.recv().await {
            Some(ChannelEvent::Closed { reason }) => {
                assert_eq!(reason.as_deref(), Some("closed by client"));
            }
            other => panic!("Expected Closed, got {:?}", other),
        }
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_is_transmit_error() {
        let (mut session, _events) = LiveSession::open(request("key")).unwrap();
        session.close();

        let result = session.send_audio("AAAA".to_string(), "audio/pcm;rate=16000");
        assert!(matches!(result, Err(SessionError::Transmit(_))));
    }

    #[test]
    fn test_server_event_mapping() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"serverContent": {"turnComplete": true}}"#).unwrap();
        match server_event(msg) {
            Some(ChannelEvent::Message(content)) => assert!(content.turn_complete),
            other => panic!("Expected Message, got {:?}", other),
        }

        let msg: ServerMessage =
            serde_json::from_str(r#"{"error": {"message": "quota exceeded"}}"#).unwrap();
        assert_eq!(
            server_event(msg),
            Some(ChannelEvent::Error {
                message: "quota exceeded".to_string()
            })
        );

        // Content with nothing the controller cares about is dropped
        let msg: ServerMessage =
            serde_json::from_str(r#"{"serverContent": {"generationComplete": true}}"#).unwrap();
        assert!(server_event(msg).is_none());
    }

    #[test]
    fn test_decode_binary_frame() {
        let msg = Message::Binary(br#"{"setupComplete": {}}"#.to_vec());
        let parsed = decode_server_message(&msg).unwrap().unwrap();
        assert!(parsed.is_setup_complete());

        assert!(decode_server_message(&Message::Ping(vec![])).is_none());
    }

    #[tokio::test]
    #[ignore] // Requires valid GEMINI_API_KEY and network access
    async fn test_live_connection() {
        let api_key = crate::credentials::get_api_key().expect("GEMINI_API_KEY required");
        let (mut session, mut events) = LiveSession::open(request(&api_key)).unwrap();

        let first = events.recv().await;
        assert_eq!(first, Some(ChannelEvent::Opened));

        let silence = crate::audio::pcm::encode_outbound(&[0.0; 1600]);
        let result = session.send_audio(silence, crate::audio::pcm::OUTBOUND_MIME_TYPE);
        assert!(result.is_ok(), "Send failed: {:?}", result.err());

        session.close();
    }
}
