use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, info, warn};

use super::supervisor::StatsRegistry;
use crate::core::{ConnectConfig, Error, Result};

type FrameSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = std::result::Result<WsMessage, WsError>> + Send>>;

/// Ordered, message-oriented duplex transport.
///
/// Writes are serialized by the sink lock, so concurrent callers never
/// interleave frames. Only binary messages carry dialogue frames; control
/// messages are answered by the WebSocket layer and skipped here.
pub struct TransportChannel {
    sink: Mutex<FrameSink>,
    stream: Mutex<FrameStream>,
    stats: Arc<StatsRegistry>,
    peer: String,
}

impl TransportChannel {
    /// Opens a WebSocket to the configured endpoint
    pub async fn connect(config: &ConnectConfig, stats: Arc<StatsRegistry>) -> Result<Self> {
        let mut request = config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| Error::config(format!("invalid endpoint {}: {}", config.endpoint, e)))?;

        for (name, value) in &config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::config(format!("invalid header name {}: {}", name, e)))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| Error::config(format!("invalid value for header {}: {}", name, e)))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (ws, response) = tokio::time::timeout(config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| Error::timeout(format!("connecting to {}", config.endpoint)))?
            .map_err(|e| Error::transport(format!("failed to connect to {}: {}", config.endpoint, e)))?;

        info!(endpoint = %config.endpoint, status = %response.status(), "transport opened");
        Ok(Self::from_websocket(ws, config.endpoint.clone(), stats))
    }

    /// Wraps an already-established WebSocket
    pub fn from_websocket<S>(ws: WebSocketStream<S>, peer: impl Into<String>, stats: Arc<StatsRegistry>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        TransportChannel {
            sink: Mutex::new(Box::pin(sink)),
            stream: Mutex::new(Box::pin(stream)),
            stats,
            peer: peer.into(),
        }
    }

    /// Writes one encoded frame as a binary message
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.send_with(|| (frame, ())).await
    }

    /// Builds a frame while holding the write lock, then writes it.
    ///
    /// Whatever `build` stamps (sequence numbers) reaches the wire in the
    /// order `build` ran. `build` does not run if the caller gives up while
    /// waiting for the lock.
    pub async fn send_with<T>(&self, build: impl FnOnce() -> (Bytes, T)) -> Result<T> {
        let mut sink = self.sink.lock().await;
        let (frame, stamped) = build();
        let len = frame.len();
        sink.send(WsMessage::Binary(frame)).await?;
        self.stats.record_sent(len);
        Ok(stamped)
    }

    /// Waits for the next binary message
    pub async fn receive(&self) -> Result<Bytes> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    self.stats.record_received_bytes(data.len());
                    return Ok(data);
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_owned()),
                        None => (None, String::new()),
                    };
                    info!(peer = %self.peer, ?code, %reason, "peer closed the transport");
                    return Err(Error::ConnectionClosed { code, reason });
                }
                Some(Ok(WsMessage::Text(text))) => {
                    warn!(peer = %self.peer, len = text.len(), "ignoring text message");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(Error::ConnectionClosed {
                        code: None,
                        reason: "stream ended".to_string(),
                    })
                }
            }
        }
    }

    /// Starts the close handshake; already-closed transports are not an error
    pub async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        match sink.close().await {
            Ok(()) => {
                debug!(peer = %self.peer, "transport closed");
                Ok(())
            }
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}
