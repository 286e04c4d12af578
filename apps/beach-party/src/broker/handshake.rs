use metrics::{counter, gauge};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::Broker;
use crate::protocol::{
    self, DenyReason, DeviceRole, HandshakeRequest, SessionId, CONSOLE_NAME, DISPLAY_NAME,
};
use crate::registry::{BrokerState, ConnectionId};

/// A connection that has just been bound to a session.
#[derive(Debug, Clone)]
pub(super) struct Admission {
    pub connection_id: ConnectionId,
    pub session_id: SessionId,
    pub role: DeviceRole,
    pub name: Option<String>,
}

impl Broker {
    pub(super) async fn handshake(&self, id: ConnectionId, payload: Option<Value>) {
        let request = HandshakeRequest::from_payload(payload);

        if self.is_authorized(id) {
            self.deny(id, DenyReason::AlreadyAuthorized);
            return;
        }

        let Some(role) = request.role() else {
            // The connection stays open and unbound; it may retry.
            record_handshake(None, Err(DenyReason::UnknownDeviceType));
            self.deny(id, DenyReason::UnknownDeviceType);
            return;
        };

        let outcome = match role {
            DeviceRole::Console => self.admit_console(id, &request).await,
            DeviceRole::Display => self.admit_display(id, &request),
            DeviceRole::Handheld => self.admit_handheld(id, &request),
        };
        record_handshake(Some(role), outcome.as_ref().map(|_| ()).map_err(|r| *r));

        match outcome {
            Ok(admission) => {
                info!(
                    connection_id = %id,
                    session_id = %admission.session_id,
                    role = %admission.role,
                    name = admission.name.as_deref(),
                    "device admitted"
                );
                self.device_connected(admission);
            }
            Err(reason) => {
                info!(
                    connection_id = %id,
                    role = %role,
                    reason = reason.as_str(),
                    "handshake rejected"
                );
                let state = self.lock();
                state.send(id, protocol::access_denied(reason));
                state.close(id);
            }
        }
    }

    async fn admit_console(
        &self,
        id: ConnectionId,
        request: &HandshakeRequest,
    ) -> Result<Admission, DenyReason> {
        let token = request
            .access_token()
            .ok_or(DenyReason::MissingAccessToken)?;

        // Verification may be slow; the lock is only taken to commit.
        let principal = self.inner.verifier.verify(token).await.map_err(|err| {
            warn!(connection_id = %id, error = %err, "console token rejected");
            DenyReason::InvalidToken
        })?;

        let mut state = self.lock();
        if state.binding(id).is_some() {
            return Err(DenyReason::AlreadyAuthorized);
        }
        if state.session_of(&principal).is_some() {
            return Err(DenyReason::SessionLimitReached);
        }

        let session_id = state
            .mint_session_id()
            .ok_or(DenyReason::SessionLimitReached)?;
        if !state.bind(
            id,
            DeviceRole::Console,
            session_id,
            CONSOLE_NAME.to_string(),
            Some(principal.clone()),
        ) {
            return Err(DenyReason::Unauthorized);
        }
        state.claim_session(principal, session_id);
        gauge!("beach_party_sessions_active", state.live_sessions() as f64);

        state.send(
            id,
            protocol::access_granted(Some(json!({ "sessionId": session_id }))),
        );

        Ok(Admission {
            connection_id: id,
            session_id,
            role: DeviceRole::Console,
            name: None,
        })
    }

    fn admit_display(
        &self,
        id: ConnectionId,
        request: &HandshakeRequest,
    ) -> Result<Admission, DenyReason> {
        let mut state = self.lock();
        let session_id = live_session(&mut state, request)?;
        if state.membership(session_id).display.is_some() {
            return Err(DenyReason::DisplayAlreadyConnected);
        }
        if !state.bind(
            id,
            DeviceRole::Display,
            session_id,
            DISPLAY_NAME.to_string(),
            None,
        ) {
            return Err(DenyReason::AlreadyAuthorized);
        }

        let payload = state
            .owner(session_id)
            .map(|app| json!({ "activeApp": app }));
        state.send(id, protocol::access_granted(payload));

        Ok(Admission {
            connection_id: id,
            session_id,
            role: DeviceRole::Display,
            name: None,
        })
    }

    fn admit_handheld(
        &self,
        id: ConnectionId,
        request: &HandshakeRequest,
    ) -> Result<Admission, DenyReason> {
        let mut state = self.lock();
        let session_id = live_session(&mut state, request)?;
        let name = state.next_handheld_name(session_id, request.device_model());
        if !state.bind(id, DeviceRole::Handheld, session_id, name.clone(), None) {
            return Err(DenyReason::AlreadyAuthorized);
        }

        let mut payload = Map::new();
        payload.insert("yourName".into(), Value::from(name.as_str()));
        if let Some(app) = state.owner(session_id) {
            payload.insert("activeApp".into(), Value::from(app));
        }
        state.send(id, protocol::access_granted(Some(Value::Object(payload))));

        Ok(Admission {
            connection_id: id,
            session_id,
            role: DeviceRole::Handheld,
            name: Some(name),
        })
    }
}

/// The session a display or handheld asks to join, provided its console is
/// still connected.
fn live_session(
    state: &mut BrokerState,
    request: &HandshakeRequest,
) -> Result<SessionId, DenyReason> {
    let session_id = request.session_id.ok_or(DenyReason::InvalidSession)?;
    if !state.is_live(session_id) {
        return Err(DenyReason::InvalidSession);
    }
    Ok(session_id)
}

fn record_handshake(role: Option<DeviceRole>, outcome: Result<(), DenyReason>) {
    let role = role.map(DeviceRole::as_str).unwrap_or("unknown");
    let outcome = match outcome {
        Ok(()) => "granted",
        Err(reason) => reason.metric_label(),
    };
    counter!(
        "beach_party_handshakes_total",
        1,
        "role" => role,
        "outcome" => outcome
    );
}
