use super::transport::{Transport, TransportEvent, TransportLink};
use crate::config::LiveConfig;
use crate::error::LiveError;
use crate::types::{BidiGenerateContentSetup, ClientMessagePayload, LiveServerMessage};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::sync::Once;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, trace, warn};
use url::Url;

pub const GEMINI_LIVE_WS_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

static CRYPTO_PROVIDER: Once = Once::new();

fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            debug!("[Connection] A rustls crypto provider was already installed.");
        }
    });
}

/// WebSocket connection to the Gemini Live `BidiGenerateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiLiveTransport {
    api_key: String,
    endpoint: String,
    channel_capacity: usize,
}

impl GeminiLiveTransport {
    pub fn new(config: &LiveConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            endpoint: GEMINI_LIVE_WS_URL.to_string(),
            channel_capacity: config.transport_channel_capacity,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn request_url(&self) -> Result<Url, LiveError> {
        Ok(Url::parse_with_params(
            &self.endpoint,
            &[("key", self.api_key.as_str())],
        )?)
    }
}

impl Transport for GeminiLiveTransport {
    fn open(
        &self,
        setup: BidiGenerateContentSetup,
        events: mpsc::Sender<TransportEvent>,
    ) -> BoxFuture<'static, Result<TransportLink, LiveError>> {
        let url = self.request_url();
        let capacity = self.channel_capacity;
        async move {
            let url = url?;
            install_crypto_provider();

            info!("[Connection] Connecting to {}", url.host_str().unwrap_or("?"));
            let (mut ws, response) = connect_async(url.as_str()).await?;
            debug!("[Connection] WebSocket upgraded: HTTP {}", response.status());

            let setup_json = serde_json::to_string(&ClientMessagePayload::Setup(setup))?;
            trace!("[Connection] Sending setup: {}", setup_json);
            ws.send(WsMessage::Text(setup_json.into())).await?;
            info!("[Connection] Setup sent, awaiting setupComplete.");

            let (outgoing_tx, outgoing_rx) = mpsc::channel(capacity);
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            spawn_processing_task(ws, outgoing_rx, shutdown_rx, events);
            Ok(TransportLink::new(outgoing_tx, shutdown_tx))
        }
        .boxed()
    }
}

pub(crate) fn spawn_processing_task(
    ws: WsStream,
    mut outgoing_rx: mpsc::Receiver<ClientMessagePayload>,
    mut shutdown_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<TransportEvent>,
) {
    tokio::spawn(async move {
        let (mut sink, mut stream) = ws.split();
        let mut setup_acknowledged = false;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => {
                    info!("[Connection] Shutdown requested, closing WebSocket.");
                    if let Err(e) = sink.send(WsMessage::Close(None)).await {
                        debug!("[Connection] Close frame not sent: {}", e);
                    }
                    break;
                }
                outgoing = outgoing_rx.recv() => match outgoing {
                    Some(payload) => {
                        let json = match serde_json::to_string(&payload) {
                            Ok(json) => json,
                            Err(e) => {
                                error!("[Connection] Failed to serialize outgoing payload: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                            error!("[Connection] WebSocket send failed: {}", e);
                            let _ = events.send(TransportEvent::Error(e.to_string())).await;
                            break;
                        }
                    }
                    None => {
                        info!("[Connection] Outgoing channel closed, closing WebSocket.");
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                },
                frame = stream.next() => {
                    let parsed = match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            parse_server_json(text.as_str(), &mut setup_acknowledged)
                        }
                        Some(Ok(WsMessage::Binary(data))) => {
                            parse_binary_frame(&data, &mut setup_acknowledged)
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let event = close_event(frame);
                            let _ = events.send(event).await;
                            break;
                        }
                        Some(Ok(_)) => Vec::new(),
                        Some(Err(e)) => {
                            error!("[Connection] WebSocket error: {}", e);
                            let _ = events.send(TransportEvent::Error(e.to_string())).await;
                            break;
                        }
                        None => {
                            info!("[Connection] WebSocket stream ended.");
                            let _ = events.send(TransportEvent::Close).await;
                            break;
                        }
                    };
                    let mut receiver_gone = false;
                    for event in parsed {
                        if events.send(event).await.is_err() {
                            receiver_gone = true;
                            break;
                        }
                    }
                    if receiver_gone {
                        debug!("[Connection] Event receiver dropped, closing WebSocket.");
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
        }
        info!("[Connection] Processing task finished.");
    });
}

/// Turns one JSON frame into session events. `setupComplete` becomes `Open`
/// the first time it is seen; anything else worth acting on is forwarded.
fn parse_server_json(text: &str, setup_acknowledged: &mut bool) -> Vec<TransportEvent> {
    let message: LiveServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("[Connection] Ignoring unparseable server message: {}", e);
            return Vec::new();
        }
    };

    let mut events = Vec::with_capacity(2);
    if message.setup_complete.is_some() {
        if *setup_acknowledged {
            debug!("[Connection] Duplicate setupComplete ignored.");
        } else {
            *setup_acknowledged = true;
            info!("[Connection] setupComplete received.");
            events.push(TransportEvent::Open);
        }
    }
    if message.server_content.is_some()
        || message.go_away.is_some()
        || message.usage_metadata.is_some()
    {
        events.push(TransportEvent::Message(message));
    }
    events
}

/// The API also delivers JSON in binary frames, sometimes after leading
/// whitespace. Anything that does not start with `{` is skipped.
fn parse_binary_frame(data: &[u8], setup_acknowledged: &mut bool) -> Vec<TransportEvent> {
    let body = data.trim_ascii_start();
    if body.first() != Some(&b'{') {
        warn!(
            "[Connection] Unexpected non-JSON binary frame ({} bytes), skipping.",
            data.len()
        );
        return Vec::new();
    }
    match std::str::from_utf8(body) {
        Ok(text) => parse_server_json(text, setup_acknowledged),
        Err(e) => {
            warn!("[Connection] Binary frame is not UTF-8 JSON: {}", e);
            Vec::new()
        }
    }
}

/// Normal and going-away closes end the session cleanly; any other code
/// (for example a rejected API key) is a transport failure.
fn close_event(frame: Option<CloseFrame>) -> TransportEvent {
    match frame {
        None => {
            info!("[Connection] Server closed the connection.");
            TransportEvent::Close
        }
        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
            info!("[Connection] Server closed the connection: {}", frame.reason.as_str());
            TransportEvent::Close
        }
        Some(frame) => {
            warn!(
                "[Connection] Server closed with {}: {}",
                u16::from(frame.code),
                frame.reason.as_str()
            );
            TransportEvent::Error(format!(
                "connection closed with code {}: {}",
                u16::from(frame.code),
                frame.reason.as_str()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::handle::test_utils::init_test_logger;
    use crate::types::Blob;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    /// A connected client/server pair over a local TCP socket.
    async fn loopback() -> (WsStream, WebSocketStream<TcpStream>) {
        init_test_logger();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(tcp).await.unwrap()
        });
        let (client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        (client, server.await.unwrap())
    }

    async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        timeout(WAIT, events.recv())
            .await
            .expect("no transport event in time")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn binary_setup_then_policy_close_reports_open_then_error() {
        let (client, mut server) = loopback().await;
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (_outgoing_tx, outgoing_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        spawn_processing_task(client, outgoing_rx, shutdown_rx, events_tx);

        server
            .send(WsMessage::Binary(b"\r\n {\"setupComplete\":{}}".to_vec().into()))
            .await
            .unwrap();
        server
            .send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "API key not valid".into(),
            })))
            .await
            .unwrap();

        assert_eq!(next_event(&mut events_rx).await, TransportEvent::Open);
        match next_event(&mut events_rx).await {
            TransportEvent::Error(reason) => {
                assert!(reason.contains("1008"), "{}", reason);
                assert!(reason.contains("API key not valid"), "{}", reason);
            }
            other => panic!("Expected an error close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn normal_server_close_is_clean() {
        let (client, mut server) = loopback().await;
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (_outgoing_tx, outgoing_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        spawn_processing_task(client, outgoing_rx, shutdown_rx, events_tx);

        server
            .send(WsMessage::Text(r#"{"setupComplete":{}}"#.into()))
            .await
            .unwrap();
        server
            .send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            })))
            .await
            .unwrap();

        assert_eq!(next_event(&mut events_rx).await, TransportEvent::Open);
        assert_eq!(next_event(&mut events_rx).await, TransportEvent::Close);
    }

    #[tokio::test]
    async fn link_forwards_audio_and_close_sends_a_close_frame() {
        let (client, mut server) = loopback().await;
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        spawn_processing_task(client, outgoing_rx, shutdown_rx, events_tx);
        let mut link = TransportLink::new(outgoing_tx, shutdown_tx);

        link.send_realtime_input(Blob {
            mime_type: "audio/pcm;rate=16000".to_string(),
            data: "AAA=".to_string(),
        })
        .unwrap();
        match timeout(WAIT, server.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                let json: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(
                    json["realtimeInput"]["audio"]["mimeType"],
                    "audio/pcm;rate=16000"
                );
            }
            other => panic!("Expected realtime input, got {:?}", other),
        }

        link.close();
        match timeout(WAIT, server.next()).await {
            Ok(Some(Ok(WsMessage::Close(_)))) => {}
            other => panic!("Expected a close frame, got {:?}", other),
        }
    }

    #[test]
    fn binary_json_tolerates_leading_whitespace() {
        let mut acknowledged = false;
        let events = parse_binary_frame(b" \t\r\n{\"setupComplete\":{}}", &mut acknowledged);
        assert_eq!(events, vec![TransportEvent::Open]);
        assert!(acknowledged);
    }

    #[test]
    fn non_json_binary_is_skipped() {
        let mut acknowledged = false;
        assert!(parse_binary_frame(&[0x00, 0x01, 0x02], &mut acknowledged).is_empty());
        assert!(parse_binary_frame(b"   ", &mut acknowledged).is_empty());
        assert!(parse_binary_frame(b"{\xff}", &mut acknowledged).is_empty());
        assert!(!acknowledged);
    }

    #[test]
    fn request_url_carries_key_as_query() {
        let transport = GeminiLiveTransport::new(&LiveConfig::new("abc&123"));
        let url = transport.request_url().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("generativelanguage.googleapis.com"));
        let key = url.query_pairs().find(|(k, _)| k == "key").map(|(_, v)| v.into_owned());
        assert_eq!(key.as_deref(), Some("abc&123"));
    }

    #[test]
    fn setup_complete_opens_once() {
        let mut acknowledged = false;
        let first = parse_server_json(r#"{"setupComplete":{}}"#, &mut acknowledged);
        let second = parse_server_json(r#"{"setupComplete":{}}"#, &mut acknowledged);
        assert_eq!(first, vec![TransportEvent::Open]);
        assert!(second.is_empty());
    }

    #[test]
    fn server_content_is_forwarded() {
        let mut acknowledged = true;
        let events = parse_server_json(
            r#"{"serverContent":{"interrupted":true}}"#,
            &mut acknowledged,
        );
        match events.as_slice() {
            [TransportEvent::Message(message)] => {
                assert!(message.server_content.as_ref().is_some_and(|c| c.interrupted));
            }
            other => panic!("Unexpected events: {:?}", other),
        }
    }

    #[test]
    fn garbage_is_dropped() {
        let mut acknowledged = false;
        assert!(parse_server_json("not json", &mut acknowledged).is_empty());
        assert!(!acknowledged);
    }

    #[test]
    fn close_codes_are_classified() {
        assert_eq!(close_event(None), TransportEvent::Close);
        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        assert_eq!(close_event(Some(normal)), TransportEvent::Close);
        let policy = CloseFrame {
            code: CloseCode::Policy,
            reason: "API key not valid".into(),
        };
        match close_event(Some(policy)) {
            TransportEvent::Error(reason) => {
                assert!(reason.contains("1008"));
                assert!(reason.contains("API key not valid"));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }
}
