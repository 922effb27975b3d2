use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// A minimal stand-in for the Control Plane's WebSocket endpoint, used the
/// way `tests/mocks/mock_cp.py` is used on the other side: accept one
/// connection, answer `runner/register`, then let the test script the rest
/// of the exchange.
pub struct MockControlPlane {
    pub addr: std::net::SocketAddr,
    listener: TcpListener,
}

impl MockControlPlane {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { addr, listener }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    pub async fn accept(&self) -> MockSession {
        let (stream, _) = self.listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        MockSession { ws }
    }
}

pub struct MockSession {
    ws: WebSocketStream<TcpStream>,
}

impl MockSession {
    pub async fn recv_json(&mut self) -> Value {
        match self.ws.next().await {
            Some(Ok(Message::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .unwrap();
    }

    /// Reads the registration request and replies according to `accept`.
    pub async fn handle_registration(&mut self, accept: bool) -> Value {
        let req = self.recv_json().await;
        let id = req["id"].clone();
        if accept {
            self.send_json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"status": "ok"},
            }))
            .await;
        } else {
            self.send_json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32000, "message": "invalid token"},
            }))
            .await;
        }
        req
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
