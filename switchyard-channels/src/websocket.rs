//! WebSocket transport on top of `tokio-tungstenite`.

use crate::error::{ChannelError, Result};
use crate::transport::{CLOSE_ABNORMAL, Connector, Endpoint, Frame, Link, LinkEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::debug;

/// Close code for a close frame that carried no status
const CLOSE_NO_STATUS: u16 = 1005;

/// Opens [`WsLink`]s with `connect_async`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Link>> {
        let url = endpoint.url();
        debug!(url = %url, "Opening WebSocket");

        let (stream, response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::connect(format!("{endpoint}: {e}")))?;

        debug!(status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(WsLink::new(stream)))
    }
}

/// A [`Link`] over a WebSocket stream, client or server side.
pub struct WsLink<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsLink<S> {
    /// Wrap an established WebSocket stream
    pub const fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }

    /// Consume the link and return the underlying stream
    pub fn into_inner(self) -> WebSocketStream<S> {
        self.stream
    }
}

#[async_trait]
impl<S> Link for WsLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Binary(bytes) => WsMessage::Binary(bytes.into()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| ChannelError::send(e.to_string()))
    }

    async fn recv(&mut self) -> LinkEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return LinkEvent::Frame(Frame::Text(text.to_string()));
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    return LinkEvent::Frame(Frame::Binary(data.to_vec()));
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Err(e) = self.stream.send(WsMessage::Pong(data)).await {
                        return LinkEvent::Closed {
                            code: CLOSE_ABNORMAL,
                            reason: e.to_string(),
                        };
                    }
                }
                Some(Ok(WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                Some(Ok(WsMessage::Close(frame))) => {
                    return match frame {
                        Some(frame) => LinkEvent::Closed {
                            code: u16::from(frame.code),
                            reason: frame.reason.to_string(),
                        },
                        None => LinkEvent::Closed {
                            code: CLOSE_NO_STATUS,
                            reason: String::new(),
                        },
                    };
                }
                Some(Err(e)) => {
                    return LinkEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: e.to_string(),
                    };
                }
                None => {
                    return LinkEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: "connection reset".to_owned(),
                    };
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(ChannelError::send(e.to_string())),
        }
    }
}
