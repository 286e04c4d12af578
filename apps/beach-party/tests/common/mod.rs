use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beach_party::{
    apps,
    auth::{JwtTokenVerifier, PrincipalId},
    config::ServerConfig,
    telemetry::detached_metrics_handle,
    AppState,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub const SECRET: &str = "integration-secret";
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_handshake_timeout(Duration::from_secs(5)).await
    }

    pub async fn start_with_handshake_timeout(handshake_timeout: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ServerConfig {
            listen_addr: addr,
            token_secret: SECRET.to_string(),
            handshake_timeout,
            first_session_id: 1001,
            shutdown_grace: Duration::ZERO,
        };
        let state = Arc::new(AppState::new(
            &config,
            apps::default_registry(),
            detached_metrics_handle(),
        ));

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            beach_party::serve(listener, state, shutdown).await.unwrap();
        });

        Self {
            addr,
            shutdown: Some(tx),
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn connect(&self) -> WsClient {
        let (stream, _) = connect_async(self.ws_url()).await.unwrap();
        WsClient { stream }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub fn token(user: &str) -> String {
    JwtTokenVerifier::new(SECRET.as_bytes())
        .issue(&PrincipalId::new(user))
        .unwrap()
}

pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

/// What a client observed next on its socket.
#[derive(Debug, PartialEq)]
pub enum Received {
    Event(Value),
    Closed,
}

impl WsClient {
    pub async fn send(&mut self, message: Value) {
        self.stream
            .send(Message::Text(message.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn handshake(&mut self, payload: Value) {
        self.send(json!({ "source": "device", "event": "handshake", "payload": payload }))
            .await;
    }

    pub async fn next(&mut self) -> Received {
        loop {
            let frame = timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for a frame");
            match frame {
                Some(Ok(Message::Text(text))) => {
                    return Received::Event(serde_json::from_str(text.as_str()).unwrap())
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return Received::Closed,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Next message, asserted to be the named system event; returns its payload.
    pub async fn expect(&mut self, event: &str) -> Value {
        match self.next().await {
            Received::Event(message) => {
                assert_eq!(message["source"], "system", "unexpected message {message}");
                assert_eq!(message["event"], event, "unexpected message {message}");
                message.get("payload").cloned().unwrap_or(Value::Null)
            }
            Received::Closed => panic!("socket closed while waiting for {event}"),
        }
    }

    pub async fn expect_closed(&mut self) {
        assert_eq!(self.next().await, Received::Closed);
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

pub async fn console(server: &TestServer, user: &str) -> (WsClient, u64) {
    let mut client = server.connect().await;
    client
        .handshake(json!({ "deviceType": "admin_console", "accessToken": token(user) }))
        .await;
    let payload = client.expect("access_granted").await;
    let session = payload["sessionId"].as_u64().expect("session id");
    (client, session)
}
