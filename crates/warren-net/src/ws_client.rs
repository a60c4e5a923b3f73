//! Websocket transport for one connection attempt.
//!
//! [`WsConnection::spawn`] runs the connect handshake and the read/write
//! loops on a background task and reports everything that happens as a
//! [`TransportEvent`] tagged with the attempt's generation. The sync core
//! decides what those events mean; this module only moves text frames.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, client_async};
use url::Url;

/// Upper bound on the TCP connect plus websocket handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that happened on a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The handshake completed.
    Opened {
        /// Attempt generation.
        generation: u64,
    },
    /// A text frame arrived.
    Message {
        /// Attempt generation.
        generation: u64,
        /// Frame payload.
        text: String,
    },
    /// The attempt failed or the connection ended. Always the last event.
    Closed {
        /// Attempt generation.
        generation: u64,
        /// Human-readable cause, when known.
        reason: Option<String>,
    },
}

impl TransportEvent {
    /// Generation the event belongs to.
    pub fn generation(&self) -> u64 {
        match self {
            TransportEvent::Opened { generation }
            | TransportEvent::Message { generation, .. }
            | TransportEvent::Closed { generation, .. } => *generation,
        }
    }
}

/// Errors produced by the websocket transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint is not a usable `ws://` URL.
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint {
        /// The endpoint as configured.
        endpoint: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The connection task has already exited.
    #[error("connection closed")]
    Closed,
    /// Connect or handshake did not finish in time.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Websocket protocol failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Parse and check a websocket endpoint.
pub fn parse_endpoint(endpoint: &str) -> Result<Url, TransportError> {
    let invalid = |reason: String| TransportError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let url = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
    if url.scheme() != "ws" {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

/// Handle to a connection task.
///
/// Dropping the handle does not stop the task; call [`WsConnection::close`].
pub struct WsConnection {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    shutdown_tx: watch::Sender<bool>,
}

impl WsConnection {
    /// Start connecting to `url` in the background.
    ///
    /// Exactly one [`TransportEvent::Closed`] is eventually delivered on
    /// `events` for this generation, whether or not the handshake succeeded.
    pub fn spawn(url: Url, generation: u64, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            let reason = match connect(&url).await {
                Ok(stream) => {
                    let _ = events.send(TransportEvent::Opened { generation });
                    run(stream, generation, &events, outbound_rx, shutdown_rx).await
                }
                Err(e) => Some(e.to_string()),
            };
            let _ = events.send(TransportEvent::Closed { generation, reason });
        });

        Self {
            generation,
            outbound,
            shutdown_tx,
        }
    }

    /// Generation this connection was spawned with.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a text frame for sending.
    pub fn send(&self, text: String) -> Result<(), TransportError> {
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    /// Ask the task to close the socket and exit.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn connect(url: &Url) -> Result<WebSocketStream<TcpStream>, TransportError> {
    let attempt = async {
        let addrs = url.socket_addrs(|| Some(80))?;
        let addr = addrs.first().copied().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "endpoint did not resolve")
        })?;
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        let (stream, _response) = client_async(url.as_str(), tcp).await?;
        Ok::<_, TransportError>(stream)
    };

    tokio::time::timeout(CONNECT_TIMEOUT, attempt)
        .await
        .map_err(|_| TransportError::Timeout(CONNECT_TIMEOUT))?
}

/// Pump frames until either side ends the connection. Returns the close reason.
async fn run(
    stream: WebSocketStream<TcpStream>,
    generation: u64,
    events: &mpsc::UnboundedSender<TransportEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Option<String> {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(TransportEvent::Message { generation, text }).is_err() {
                            return Some("event receiver dropped".to_string());
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = sink.send(Message::Pong(payload)).await {
                            return Some(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return frame.map(|f| f.reason.to_string()).or(Some("closed by peer".to_string()));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        tracing::debug!(len = bytes.len(), "Ignoring binary frame");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Some(e.to_string()),
                    None => return Some("stream ended".to_string()),
                }
            }
            text = outbound_rx.recv() => {
                let Some(text) = text else {
                    let _ = sink.close().await;
                    return Some("handle dropped".to_string());
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    return Some(e.to_string());
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = sink.close().await;
                    return None;
                }
            }
        }
    }
}
