use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::RunnerError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Owns the read half of the connection exclusively. Only the receive loop
/// ever touches this — no mutex, since nothing else needs concurrent access
/// to it.
pub struct TransportReader {
    stream: SplitStream<WsStream>,
}

/// Owns the write half. Every outbound path (`send_request`,
/// `send_notification`, `write_back`, the heartbeat) reaches this through a
/// mutex, but that mutex is never held across a read — splitting the socket
/// is exactly what keeps a parked `recv()` from blocking every write.
pub struct TransportWriter {
    sink: SplitSink<WsStream, Message>,
}

/// Opens the WebSocket handshake against `url`, attaching
/// `Authorization: Bearer <token>` before the upgrade request is sent, then
/// splits the resulting stream into independent read/write halves.
pub async fn connect(url: &str, auth_token: &str) -> Result<(TransportReader, TransportWriter), RunnerError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| RunnerError::Transport(format!("invalid control plane URL {url}: {e}")))?;

    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {auth_token}")
            .parse()
            .map_err(|e| RunnerError::Transport(format!("invalid auth token header: {e}")))?,
    );

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| RunnerError::Transport(format!("handshake failed for {url}: {e}")))?;

    let (sink, read) = stream.split();
    Ok((TransportReader { stream: read }, TransportWriter { sink }))
}

impl TransportReader {
    /// Yields the next text frame, skipping ping/pong/close frames that the
    /// underlying client already answers transparently.
    pub async fn recv(&mut self) -> Result<Option<String>, RunnerError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    if let Ok(text) = String::from_utf8(bytes) {
                        return Ok(Some(text));
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(RunnerError::Transport(e.to_string())),
            }
        }
    }
}

impl TransportWriter {
    /// Sends one text frame. Serialized across callers by the mutex one
    /// layer up, in the engine.
    pub async fn send(&mut self, text: String) -> Result<(), RunnerError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| RunnerError::Transport(e.to_string()))
    }

    /// Idempotent close — a second call on an already-closed sink is a
    /// harmless no-op from the caller's perspective.
    pub async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}
