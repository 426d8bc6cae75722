//! Transport seam between the connector and the network.
//!
//! A [`Transport`] opens one [`Link`] per connection attempt. A link is a
//! pair of channels: frames to send, and [`LinkEvent`]s coming back. Dropping
//! the link closes the underlying socket.
//!
//! [`WebSocketTransport`] is the production implementation; tests plug in
//! scripted transports built on [`Link::pair`].

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::protocol::Payload;

/// Socket-level failure. Always absorbed by the connector's retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Connection error: {0}")]
    Io(String),
}

/// Something that happened on an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Message(Payload),
    /// The link is gone. `cause` is set when it died with an error.
    Closed { cause: Option<TransportError> },
}

/// Connector-side end of one open connection.
#[derive(Debug)]
pub struct Link {
    outgoing: mpsc::Sender<Payload>,
    incoming: mpsc::Receiver<LinkEvent>,
}

/// Transport-side end of a [`Link`].
#[derive(Debug)]
pub struct LinkPeer {
    /// Frames the connector wants written.
    pub outgoing: mpsc::Receiver<Payload>,
    /// Frames and close notifications for the connector.
    pub incoming: mpsc::Sender<LinkEvent>,
}

impl Link {
    /// Create a connected link/peer pair with the given buffer capacity.
    pub fn pair(capacity: usize) -> (Link, LinkPeer) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        (
            Link {
                outgoing: out_tx,
                incoming: in_rx,
            },
            LinkPeer {
                outgoing: out_rx,
                incoming: in_tx,
            },
        )
    }

    /// Queue a frame for writing. Fails once the transport side is gone.
    pub async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        self.outgoing
            .send(payload)
            .await
            .map_err(|_| TransportError::Io("link closed".into()))
    }

    /// Next event. A vanished transport side reads as a clean close.
    pub async fn recv(&mut self) -> LinkEvent {
        self.incoming
            .recv()
            .await
            .unwrap_or(LinkEvent::Closed { cause: None })
    }
}

/// Opens links to a collaboration endpoint.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Link, TransportError>>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    channel_capacity: usize,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            channel_capacity: 256,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
        let url = url.to_string();
        let capacity = self.channel_capacity;
        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            log::debug!("WebSocket handshake complete: {url}");

            let (link, peer) = Link::pair(capacity);
            tokio::spawn(pump(ws_stream, peer));
            Ok(link)
        }
        .boxed()
    }
}

fn to_message(payload: Payload) -> Message {
    match payload {
        Payload::Text(text) => Message::Text(text.into()),
        Payload::Binary(bytes) => Message::Binary(bytes.into()),
    }
}

/// Shuttle frames between a WebSocket and a [`LinkPeer`] until either side
/// goes away.
pub async fn pump<S>(ws_stream: WebSocketStream<S>, mut peer: LinkPeer)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut writer, mut reader) = ws_stream.split();

    let cause = loop {
        tokio::select! {
            outgoing = peer.outgoing.recv() => match outgoing {
                Some(payload) => {
                    if let Err(e) = writer.send(to_message(payload)).await {
                        break Some(TransportError::Io(e.to_string()));
                    }
                }
                None => {
                    // Link dropped by its owner.
                    let _ = writer.send(Message::Close(None)).await;
                    return;
                }
            },
            frame = reader.next() => {
                let payload = match frame {
                    Some(Ok(Message::Text(text))) => Payload::Text(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(bytes))) => Payload::Binary(bytes.to_vec()),
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Some(TransportError::Io(e.to_string())),
                };
                if peer.incoming.send(LinkEvent::Message(payload)).await.is_err() {
                    let _ = writer.send(Message::Close(None)).await;
                    return;
                }
            }
        }
    };

    log::debug!("WebSocket closed (error: {cause:?})");
    let _ = peer.incoming.send(LinkEvent::Closed { cause }).await;
}
