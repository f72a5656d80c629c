use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;

use super::{CloseInfo, Connection, Connector, Inbound, Outbound, TransportError, WireFrame};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens WebSocket connections with `tokio-tungstenite`.
///
/// Each connection gets a pump task that:
/// - forwards text/binary frames to the owner in arrival order
/// - answers pings and sends its own keepalive ping every `ping_interval`
/// - reports exactly one [`Inbound::Closed`] when the socket ends
#[derive(Debug, Clone)]
pub struct WsConnector {
    token: Option<String>,
    handshake_timeout: Duration,
    ping_interval: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(None)
    }
}

impl WsConnector {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token,
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection, TransportError>> {
        let url = url.to_string();
        let token = self.token.clone();
        let handshake_timeout = self.handshake_timeout;
        let ping_interval = self.ping_interval;

        Box::pin(async move {
            let mut request =
                url.as_str()
                    .into_client_request()
                    .map_err(|source| TransportError::InvalidUrl {
                        url: url.clone(),
                        source,
                    })?;
            if let Some(ref tok) = token {
                let value = HeaderValue::from_str(&format!("Bearer {}", tok))
                    .map_err(|_| TransportError::InvalidToken)?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }

            let (ws_stream, _) =
                tokio::time::timeout(handshake_timeout, tokio_tungstenite::connect_async(request))
                    .await
                    .map_err(|_| TransportError::HandshakeTimeout(url.clone()))?
                    .map_err(|source| TransportError::Connect {
                        url: url.clone(),
                        source,
                    })?;
            tracing::debug!(%url, "websocket handshake complete");

            Ok(spawn_pump(url, ws_stream, ping_interval))
        })
    }
}

fn spawn_pump(url: String, ws_stream: WsStream, ping_interval: Duration) -> Connection {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let close = run_pump(ws_stream, outbound_rx, &inbound_tx, ping_interval).await;
        tracing::debug!(%url, %close, "websocket closed");
        let _ = inbound_tx.send(Inbound::Closed(close));
    });
    Connection {
        outbound: outbound_tx,
        inbound: inbound_rx,
    }
}

async fn run_pump(
    ws_stream: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    inbound_tx: &mpsc::UnboundedSender<Inbound>,
    ping_interval: Duration,
) -> CloseInfo {
    let (mut sink, mut stream) = ws_stream.split();
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await; // Skip the first immediate tick.

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = inbound_tx.send(Inbound::Frame(WireFrame::Text(text.as_str().to_owned())));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let _ = inbound_tx.send(Inbound::Frame(WireFrame::Binary(data)));
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            return CloseInfo::abnormal(e.to_string());
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) => CloseInfo {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.as_str().to_owned(),
                            },
                            None => CloseInfo::abnormal("closed without status"),
                        };
                    }
                    Some(Err(e)) => return CloseInfo::abnormal(e.to_string()),
                    None => return CloseInfo::abnormal("stream ended"),
                }
            }
            cmd = outbound_rx.recv() => {
                match cmd {
                    Some(Outbound::Frame(frame)) => {
                        let message = match frame {
                            WireFrame::Text(text) => Message::text(text),
                            WireFrame::Binary(data) => Message::binary(data),
                        };
                        if let Err(e) = sink.send(message).await {
                            return CloseInfo::abnormal(e.to_string());
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        return CloseInfo { code: Some(code), reason };
                    }
                    None => {
                        // Owner dropped the handle.
                        let _ = sink.send(Message::Close(None)).await;
                        return CloseInfo::normal("handle dropped");
                    }
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    return CloseInfo::abnormal(e.to_string());
                }
            }
        }
    }
}
