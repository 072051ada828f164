//! WebSocket execution channel.
//!
//! ```text
//! WsChannel::send ──encode──▶ SplitSink ──────▶ gateway
//!                                                  │
//! WsChannel::recv ◀── mpsc ◀── reader task ◀── SplitStream
//! ```
//!
//! A reader task owns the stream half, decodes each text frame and forwards
//! it to an unbounded queue, so messages arriving between two `recv` calls
//! are buffered rather than lost. Frames that fail to decode are logged and
//! dropped. When the socket closes, the task exits and `recv` returns `None`.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use kernelgate_types::{ProtocolMessage, codec};

use crate::error::GatewayError;
use crate::gateway::MessageChannel;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Channel to one kernel over the gateway's WebSocket.
pub struct WsChannel {
    sink: Mutex<SplitSink<WsStream, Message>>,
    inbound: mpsc::UnboundedReceiver<ProtocolMessage>,
    reader: JoinHandle<()>,
    closed: bool,
}

impl WsChannel {
    /// Connect to `url`, presenting `token` as `Authorization: token <t>`.
    pub async fn connect(url: &str, token: Option<&str>) -> Result<Self, GatewayError> {
        let mut request = url.into_client_request()?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("token {token}"))
                .map_err(|e| GatewayError::InvalidRequest(format!("auth token: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
        debug!(url, "channel connected");

        let (sink, mut source) = stream.split();
        let (tx, inbound) = mpsc::unbounded_channel();

        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let decoded = match frame {
                    Ok(Message::Text(text)) => codec::decode(text.as_str()),
                    Ok(Message::Binary(bytes)) => codec::decode_bytes(&bytes),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "channel read failed");
                        break;
                    }
                };
                match decoded {
                    Ok(msg) => {
                        trace!(msg_type = %msg.msg_type(), "channel.recv");
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed frame"),
                }
            }
            debug!("channel reader finished");
        });

        Ok(Self {
            sink: Mutex::new(sink),
            inbound,
            reader,
            closed: false,
        })
    }
}

#[async_trait]
impl MessageChannel for WsChannel {
    async fn send(&self, msg: ProtocolMessage) -> Result<(), GatewayError> {
        if self.closed {
            return Err(GatewayError::ChannelClosed);
        }
        let frame = codec::encode(&msg)?;
        trace!(msg_type = %msg.msg_type(), msg_id = %msg.msg_id(), "channel.send");
        self.sink.lock().await.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<ProtocolMessage> {
        if self.closed {
            return None;
        }
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
        drop(sink);
        self.reader.abort();
        self.inbound.close();
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
