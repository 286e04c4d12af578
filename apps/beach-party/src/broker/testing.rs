//! In-process harness for driving a [`Broker`] without sockets.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::Broker;
use crate::app::{AppRegistry, Application, SessionScope};
use crate::apps::BroadcastApp;
use crate::auth::{JwtTokenVerifier, PrincipalId};
use crate::protocol::{DeviceRole, Envelope, Outbound, SessionId};
use crate::registry::ConnectionId;

pub const SECRET: &[u8] = b"test-secret";
pub const FIRST_SESSION: u64 = 1001;

/// One hook invocation as seen by [`RecordingApp`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Launched(SessionId, Value),
    Closed(SessionId),
    Terminated(SessionId),
    Event(SessionId, String, String, DeviceRole),
    Connected(SessionId, DeviceRole, Option<String>),
    Disconnected(SessionId, DeviceRole, Option<String>),
}

#[derive(Default)]
pub struct RecordingApp {
    calls: Mutex<Vec<Call>>,
    fail: bool,
}

impl RecordingApp {
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn record(&self, call: Call) -> anyhow::Result<()> {
        self.calls.lock().push(call);
        if self.fail {
            anyhow::bail!("hook failed on purpose");
        }
        Ok(())
    }
}

impl Application for RecordingApp {
    fn app_launched(&self, scope: &SessionScope, args: &Value) -> anyhow::Result<()> {
        self.record(Call::Launched(scope.session_id(), args.clone()))
    }

    fn app_closed(&self, scope: &SessionScope) -> anyhow::Result<()> {
        self.record(Call::Closed(scope.session_id()))
    }

    fn session_terminated(&self, scope: &SessionScope) -> anyhow::Result<()> {
        self.record(Call::Terminated(scope.session_id()))
    }

    fn handle_event(
        &self,
        scope: &SessionScope,
        message: &Envelope,
        device_name: &str,
        role: DeviceRole,
    ) -> anyhow::Result<()> {
        // Echo back to the console so tests can observe the scope working.
        scope.send_to_console(Envelope::new(
            message.source.clone(),
            "echo",
            message.payload.clone(),
        ));
        self.record(Call::Event(
            scope.session_id(),
            message.event.clone(),
            device_name.to_string(),
            role,
        ))
    }

    fn device_connected(
        &self,
        scope: &SessionScope,
        role: DeviceRole,
        name: Option<&str>,
    ) -> anyhow::Result<()> {
        self.record(Call::Connected(scope.session_id(), role, name.map(str::to_string)))
    }

    fn device_disconnected(
        &self,
        scope: &SessionScope,
        role: DeviceRole,
        name: Option<&str>,
    ) -> anyhow::Result<()> {
        self.record(Call::Disconnected(scope.session_id(), role, name.map(str::to_string)))
    }
}

pub struct Harness {
    pub broker: Broker,
    pub quiz: Arc<RecordingApp>,
    pub draw: Arc<RecordingApp>,
    verifier: JwtTokenVerifier,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_quiz(RecordingApp::default())
    }

    pub fn with_quiz(quiz: RecordingApp) -> Self {
        let quiz = Arc::new(quiz);
        let draw = Arc::new(RecordingApp::default());
        let apps = AppRegistry::builder()
            .register_shared("quiz", quiz.clone())
            .register_shared("draw", draw.clone())
            .register(BroadcastApp::NAME, BroadcastApp)
            .build();
        let verifier = JwtTokenVerifier::new(SECRET);
        let broker = Broker::new(apps, Arc::new(verifier.clone()), FIRST_SESSION);
        Self {
            broker,
            quiz,
            draw,
            verifier,
        }
    }

    pub fn token(&self, user: &str) -> String {
        self.verifier
            .issue(&PrincipalId::new(user))
            .expect("token should sign")
    }

    pub fn connect(&self) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.broker.open_connection(tx);
        Client {
            id,
            rx,
            broker: self.broker.clone(),
        }
    }

    /// A console bound to a fresh session, with its `access_granted` consumed.
    pub async fn console(&self, user: &str) -> (Client, SessionId) {
        let mut client = self.connect();
        client
            .handshake(json!({ "deviceType": "admin_console", "accessToken": self.token(user) }))
            .await;
        let granted = client.expect_event("access_granted");
        let session = granted.payload.as_ref().and_then(|p| SessionId::from_value(&p["sessionId"]));
        (client, session.expect("console should receive a session id"))
    }

    pub async fn display(&self, session: SessionId) -> Client {
        let mut client = self.connect();
        client
            .handshake(json!({ "deviceType": "projector", "sessionId": session }))
            .await;
        client.expect_event("access_granted");
        client
    }

    pub async fn handheld(&self, session: SessionId, model: &str) -> (Client, String) {
        let mut client = self.connect();
        client
            .handshake(json!({ "deviceType": "mobile", "sessionId": session, "deviceModel": model }))
            .await;
        let granted = client.expect_event("access_granted");
        let name = granted.payload.as_ref().and_then(|p| p["yourName"].as_str()).map(str::to_string);
        (client, name.expect("handheld should be named"))
    }
}

pub struct Client {
    pub id: ConnectionId,
    rx: mpsc::UnboundedReceiver<Outbound>,
    broker: Broker,
}

impl Client {
    pub async fn send(&self, envelope: Value) {
        self.broker.handle_text(self.id, &envelope.to_string()).await;
    }

    pub async fn send_raw(&self, text: &str) {
        self.broker.handle_text(self.id, text).await;
    }

    pub async fn handshake(&self, payload: Value) {
        self.send(json!({ "source": "device", "event": "handshake", "payload": payload }))
            .await;
    }

    pub async fn launch(&self, name: &str, args: Option<Value>) {
        let mut payload = json!({ "name": name });
        if let Some(args) = args {
            payload["args"] = args;
        }
        self.send(json!({ "source": "device", "event": "app_launched", "payload": payload }))
            .await;
    }

    pub async fn close_app(&self) {
        self.send(json!({ "source": "device", "event": "current_app_closed" }))
            .await;
    }

    pub fn disconnect(&self) {
        self.broker.handle_disconnect(self.id);
    }

    /// Every frame queued so far, without waiting.
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Pops the next frame and asserts it is the named system event.
    pub fn expect_event(&mut self, event: &str) -> Envelope {
        match self.rx.try_recv() {
            Ok(Outbound::Message(envelope)) => {
                assert_eq!(envelope.event, event, "unexpected message {envelope:?}");
                envelope
            }
            other => panic!("expected {event}, got {other:?}"),
        }
    }

    pub fn expect_denied(&mut self, reason: &str) {
        let envelope = self.expect_event("access_denied");
        assert_eq!(envelope.payload, Some(json!({ "reason": reason })));
    }

    pub fn expect_close(&mut self) {
        assert_eq!(self.rx.try_recv().ok(), Some(Outbound::Close));
    }

    pub fn expect_silence(&mut self) {
        let frames = self.drain();
        assert!(frames.is_empty(), "unexpected frames {frames:?}");
    }
}
