// Duplex channel transport: one WebSocket connection per room mount.
//
// The transport knows nothing about chat semantics. It turns a socket into a
// pair of mpsc endpoints: raw outbound text and inbound `ChannelEvent`s.

use anyhow::Context;
use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

/// Capacity of each direction of a channel link.
pub const LINK_CAPACITY: usize = 128;

/// Events a channel link delivers to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The connection is established and frames may be written.
    Opened,
    /// A text frame from the server (raw JSON).
    Frame(String),
    /// The connection is gone. No further events follow.
    Closed { reason: Option<String> },
}

/// The owner's end of an open channel.
#[derive(Debug)]
pub struct ChannelLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<ChannelEvent>,
}

/// Creates channel links. Implemented over WebSockets in production and over
/// in-memory pipes in tests.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, room_id: &str) -> anyhow::Result<ChannelLink>;
}

// ---------------------------------------------------------------------------
// WebSocket connector
// ---------------------------------------------------------------------------

pub struct TungsteniteConnector {
    url: String,
    token: Option<String>,
}

impl TungsteniteConnector {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }

    /// The channel URL with the room appended as an encoded query pair.
    fn endpoint(&self, room_id: &str) -> anyhow::Result<Url> {
        let mut url =
            Url::parse(&self.url).with_context(|| format!("invalid channel URL {}", self.url))?;
        url.query_pairs_mut().append_pair("room", room_id);
        Ok(url)
    }

    /// Handshake request for `room_id`. The session token travels in the
    /// `Authorization` header, never in the URL.
    fn request(&self, room_id: &str) -> anyhow::Result<Request> {
        let mut request = self
            .endpoint(room_id)?
            .as_str()
            .into_client_request()
            .context("failed to build channel handshake request")?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("session token is not a valid header value")?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

#[async_trait]
impl ChannelConnector for TungsteniteConnector {
    async fn connect(&self, room_id: &str) -> anyhow::Result<ChannelLink> {
        let request = self.request(room_id)?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        info!("Channel connected for room {room_id}");

        let (mut write, read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<ChannelEvent>(LINK_CAPACITY);

        // `Opened` is queued before any frame so the owner always sees it first.
        in_tx.send(ChannelEvent::Opened).await?;

        let label = room_id.to_string();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!("Channel write failed for room {label}: {e}");
                    return;
                }
            }
            // Owner dropped its sender: close politely.
            let _ = write.send(Message::Close(None)).await;
            debug!("Channel writer for room {label} finished");
        });

        let label = room_id.to_string();
        tokio::spawn(async move {
            let reason = forward_frames(read, &in_tx, &label).await;
            let _ = in_tx.send(ChannelEvent::Closed { reason }).await;
        });

        Ok(ChannelLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Forward text payloads from any WebSocket message stream into `tx` as
/// [`ChannelEvent::Frame`]. Returns why the stream stopped: `None` for a
/// clean close or end of stream, `Some(..)` for an error or a dropped
/// receiver.
///
/// Pure logic over a [`Stream`], so it is tested without sockets.
pub async fn forward_frames<St>(
    mut stream: St,
    tx: &mpsc::Sender<ChannelEvent>,
    room: &str,
) -> Option<String>
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if tx.send(ChannelEvent::Frame(text.to_string())).await.is_err() {
                    return Some("receiver dropped".to_string());
                }
            }
            Ok(Message::Close(_)) => {
                info!("Server closed channel for room {room}");
                return None;
            }
            Err(e) => {
                warn!("Channel error for room {room}: {e}");
                return Some(e.to_string());
            }
            _ => {
                // Binary, Ping, Pong and raw frames carry nothing for us.
            }
        }
    }
    None
}
