//! Physical connection seam between a [`Socket`](crate::socket::Socket) and
//! the network.

use crate::error::{Error, Result};
use crate::socket::{Socket, TransportEvent};
use futures::{SinkExt, StreamExt};
use nostr::RelayUrl;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Creates connections. `connect` must not block; the outcome of the
/// handshake is reported later through the [`TransportSink`].
pub trait Transport: Send + Sync {
    fn connect(&self, url: &str, sink: TransportSink) -> Result<Arc<dyn Connection>>;
}

pub trait Connection: Send + Sync {
    fn send(&self, text: String);
    fn close(&self);
}

/// Callback side of a connection. Every sink is bound to one connection
/// attempt of one socket; events from superseded attempts are discarded.
#[derive(Clone)]
pub struct TransportSink {
    socket: Weak<Socket>,
    generation: u64,
}

impl TransportSink {
    pub(crate) fn new(socket: Weak<Socket>, generation: u64) -> Self {
        Self { socket, generation }
    }

    pub fn opened(&self) {
        self.dispatch(TransportEvent::Open);
    }

    pub fn message(&self, text: String) {
        self.dispatch(TransportEvent::Message(text));
    }

    pub fn error(&self, reason: impl Into<String>) {
        self.dispatch(TransportEvent::Error(reason.into()));
    }

    pub fn closed(&self) {
        self.dispatch(TransportEvent::Close);
    }

    fn dispatch(&self, event: TransportEvent) {
        if let Some(socket) = self.socket.upgrade() {
            socket.handle_transport(self.generation, event);
        }
    }
}

/// WebSocket transport backed by tokio-tungstenite. Each connection runs on
/// its own task of the current tokio runtime.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, url: &str, sink: TransportSink) -> Result<Arc<dyn Connection>> {
        let relay_url = RelayUrl::parse(url).map_err(|e| Error::invalid_relay_url(url, e))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::transport(format!("no tokio runtime: {e}")))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();

        runtime.spawn(run_connection(
            relay_url.to_string(),
            self.connect_timeout,
            sink,
            outbound_rx,
            cancellation_token.clone(),
        ));

        Ok(Arc::new(WebSocketConnection {
            outbound_tx,
            cancellation_token,
        }))
    }
}

struct WebSocketConnection {
    outbound_tx: mpsc::UnboundedSender<String>,
    cancellation_token: CancellationToken,
}

impl Connection for WebSocketConnection {
    fn send(&self, text: String) {
        if self.outbound_tx.send(text).is_err() {
            debug!("Dropping frame for a finished connection");
        }
    }

    fn close(&self) {
        self.cancellation_token.cancel();
    }
}

async fn run_connection(
    url: String,
    connect_timeout: Duration,
    sink: TransportSink,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    cancellation_token: CancellationToken,
) {
    let handshake = tokio::select! {
        _ = cancellation_token.cancelled() => return,
        result = tokio::time::timeout(connect_timeout, connect_async(url.as_str())) => result,
    };

    let stream = match handshake {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            warn!("[{}] Failed to connect: {}", url, e);
            sink.error(e.to_string());
            sink.closed();
            return;
        }
        Err(_) => {
            warn!("[{}] Connection attempt timed out", url);
            sink.error("connection timed out");
            sink.closed();
            return;
        }
    };

    debug!("[{}] Connected", url);
    sink.opened();

    let (mut writer, mut reader) = stream.split();

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                let _ = writer.send(Message::Close(None)).await;
                break;
            }
            outbound = outbound_rx.recv() => {
                let Some(text) = outbound else {
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = writer.send(Message::Text(text.into())).await {
                    warn!("[{}] Failed to send frame: {}", url, e);
                    sink.error(e.to_string());
                    break;
                }
            }
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => sink.message(text.as_str().to_owned()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("[{}] Connection error: {}", url, e);
                    sink.error(e.to_string());
                    break;
                }
            }
        }
    }

    debug!("[{}] Disconnected", url);
    sink.closed();
}
