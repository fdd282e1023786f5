//! WebSocket signaling channel to the relay.

use crate::error::{ClientError, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use huddle_common::protocol::{ClientMessage, ServerMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One live relay connection. Dropping it closes the socket.
pub struct SignalingChannel {
    sink: SplitSink<Socket, Message>,
    stream: SplitStream<Socket>,
}

impl SignalingChannel {
    pub async fn connect(url: &Url) -> Result<Self> {
        let (ws, _) = connect_async(url.as_str()).await?;
        let (sink, stream) = ws.split();
        tracing::debug!(url = %url, "Signaling channel connected");
        Ok(Self { sink, stream })
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.sink.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Next relay message. `None` once the relay closed the channel.
    ///
    /// Cancel-safe: a frame is never half-consumed.
    pub async fn next(&mut self) -> Option<Result<ServerMessage>> {
        while let Some(frame) = self.stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => return Some(Err(e.into())),
            };
            match frame {
                Message::Text(text) => {
                    return Some(serde_json::from_str(text.as_str()).map_err(ClientError::from));
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
        None
    }

    pub async fn close(mut self) {
        let _ = self.sink.close().await;
    }
}
