//! The session broker: handshake, event routing, application arbitration and
//! disconnect handling over the shared [`BrokerState`].
//!
//! Every state change happens inside one `parking_lot` critical section. The
//! lock is never held across an `.await` or while an application hook runs;
//! hooks are called after the change that triggered them is committed.
//!
//! Hooks for one session are additionally serialized on that session's lane,
//! held from the ownership check through the hook call, so a hook never
//! reaches an application after the close or teardown that retired it.

mod disconnect;
mod handshake;
mod lifecycle;
mod router;

use std::sync::Arc;

use metrics::gauge;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app::{AppRegistry, Application, SessionScope};
use crate::auth::TokenVerifier;
use crate::protocol::{self, ControlEvent, DenyReason, Envelope, Outbound, SessionId};
use crate::registry::{BrokerState, ConnectionId, SessionView};

/// Recipient selector for application-originated messages.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Console,
    Display,
    Handheld(&'a str),
    Handhelds,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    apps: AppRegistry,
    verifier: Arc<dyn TokenVerifier>,
}

impl Broker {
    pub fn new(apps: AppRegistry, verifier: Arc<dyn TokenVerifier>, first_session_id: u64) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::new(first_session_id)),
                apps,
                verifier,
            }),
        }
    }

    pub fn apps(&self) -> &AppRegistry {
        &self.inner.apps
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock()
    }

    /// Handle on the mutex that orders hook calls for one session. Take it
    /// before the state lock, and re-read ownership once it is held.
    fn lane(&self, session_id: SessionId) -> Arc<Mutex<()>> {
        self.lock().lane(session_id)
    }

    fn scope(&self, session_id: SessionId) -> SessionScope {
        SessionScope::new(self.clone(), session_id)
    }

    /// Tracks a freshly opened socket. Frames for it are pushed onto `tx`.
    pub fn open_connection(&self, tx: mpsc::UnboundedSender<Outbound>) -> ConnectionId {
        let id = Uuid::new_v4();
        let mut state = self.lock();
        state.open(id, tx);
        gauge!("beach_party_connections_open", state.connection_count() as f64);
        id
    }

    pub fn is_authorized(&self, id: ConnectionId) -> bool {
        self.lock().binding(id).is_some()
    }

    pub fn session_view(&self, session_id: SessionId) -> Option<SessionView> {
        self.lock().view(session_id)
    }

    /// Entry point for every text frame received on a socket.
    pub async fn handle_text(&self, id: ConnectionId, text: &str) {
        let Some(envelope) = Envelope::parse(text) else {
            debug!(connection_id = %id, "dropping malformed message");
            return;
        };

        if envelope.is_from_device() {
            match ControlEvent::parse(&envelope.event) {
                Some(ControlEvent::Handshake) => {
                    self.handshake(id, envelope.payload).await;
                    return;
                }
                Some(ControlEvent::AppLaunched) => {
                    self.launch(id, envelope.payload);
                    return;
                }
                Some(ControlEvent::CurrentAppClosed) => {
                    self.close_app(id);
                    return;
                }
                None => {}
            }
        }

        self.route(id, envelope);
    }

    /// Sends `access_denied` to a connection without touching any state.
    fn deny(&self, id: ConnectionId, reason: DenyReason) {
        debug!(connection_id = %id, reason = reason.as_str(), "access denied");
        self.lock().send(id, protocol::access_denied(reason));
    }

    pub(crate) fn deliver(&self, session_id: SessionId, target: Target<'_>, message: Envelope) -> usize {
        let mut state = self.lock();
        let recipients: Vec<ConnectionId> = match target {
            Target::Console => state.membership(session_id).console.into_iter().collect(),
            Target::Display => state.membership(session_id).display.into_iter().collect(),
            Target::Handheld(name) => state.find_handheld(session_id, name).into_iter().collect(),
            Target::Handhelds => state.membership(session_id).handhelds.clone(),
        };
        recipients
            .into_iter()
            .filter(|id| state.send(*id, message.clone()))
            .count()
    }

    /// Runs an application hook, containing its failure.
    fn invoke<F>(&self, app_name: &str, hook: &'static str, session_id: SessionId, call: F)
    where
        F: FnOnce(&dyn Application, &SessionScope) -> anyhow::Result<()>,
    {
        let Some(app) = self.inner.apps.get(app_name) else {
            warn!(app = app_name, hook, "owner application is not registered");
            return;
        };
        let scope = self.scope(session_id);
        if let Err(err) = call(app.as_ref(), &scope) {
            warn!(
                app = app_name,
                hook,
                session_id = %session_id,
                error = %err,
                "application hook failed"
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod testing;
