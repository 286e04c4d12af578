use metrics::counter;
use serde_json::Value;
use tracing::{debug, info};

use super::handshake::Admission;
use super::Broker;
use crate::protocol::{self, DenyReason, DeviceRole, LaunchRequest, SessionId};
use crate::registry::ConnectionId;

impl Broker {
    /// Session of a bound console, or the denial to send back.
    fn console_session(&self, id: ConnectionId, wrong_role: DenyReason) -> Option<SessionId> {
        let state = self.lock();
        let Some(binding) = state.binding(id) else {
            state.send(id, protocol::access_denied(DenyReason::Unauthorized));
            return None;
        };
        if binding.role != DeviceRole::Console {
            state.send(id, protocol::access_denied(wrong_role));
            return None;
        }
        Some(binding.session_id)
    }

    /// `device/app_launched`: the console reserves the session for one
    /// registered application.
    pub(super) fn launch(&self, id: ConnectionId, payload: Option<Value>) {
        let request = LaunchRequest::from_payload(payload);
        let args = request.args();
        let Some(session_id) = self.console_session(id, DenyReason::LaunchRequiresConsole) else {
            return;
        };

        let lane = self.lane(session_id);
        let _turn = lane.lock();
        let name = {
            let mut state = self.lock();
            if state.binding(id).is_none() {
                return;
            }
            if state.owner(session_id).is_some() {
                state.send(id, protocol::access_denied(DenyReason::SessionReserved));
                return;
            }
            let Some(name) = request.name.filter(|name| self.inner.apps.contains(name)) else {
                debug!(session_id = %session_id, "ignoring launch of unregistered application");
                return;
            };
            state.try_set_owner(session_id, &name);
            name
        };

        info!(session_id = %session_id, app = %name, "application launched");
        counter!("beach_party_app_launches_total", 1, "app" => name.clone());

        self.invoke(&name, "app_launched", session_id, |app, scope| {
            app.app_launched(scope, &args)
        });
        self.broadcast_devices(session_id, protocol::app_launched(&name, &args));
    }

    /// `device/current_app_closed`: the console releases the session.
    pub(super) fn close_app(&self, id: ConnectionId) {
        let Some(session_id) = self.console_session(id, DenyReason::CloseRequiresConsole) else {
            return;
        };

        let lane = self.lane(session_id);
        let _turn = lane.lock();
        let name = {
            let mut state = self.lock();
            if state.binding(id).is_none() {
                return;
            }
            let Some(name) = state.take_owner(session_id) else {
                return;
            };
            name
        };

        info!(session_id = %session_id, app = %name, "application closed");

        self.invoke(&name, "app_closed", session_id, |app, scope| {
            app.app_closed(scope)
        });
        self.broadcast_devices(session_id, protocol::current_app_closed());
    }

    /// Tells the console and the owning application that a display or
    /// handheld joined. The console's own admission announces nothing.
    pub(super) fn device_connected(&self, admission: Admission) {
        if admission.role == DeviceRole::Console {
            return;
        }
        let Admission {
            connection_id,
            session_id,
            role,
            name,
        } = admission;

        let lane = self.lane(session_id);
        let _turn = lane.lock();
        let owner = {
            let mut state = self.lock();
            let Some(console) = state.membership(session_id).console else {
                return;
            };
            state.send(console, protocol::device_connected(role, name.as_deref()));
            state.owner(session_id).map(str::to_string)
        };
        debug!(
            connection_id = %connection_id,
            session_id = %session_id,
            app = owner.as_deref(),
            "device connected"
        );

        if let Some(app_name) = owner {
            self.invoke(&app_name, "device_connected", session_id, |app, scope| {
                app.device_connected(scope, role, name.as_deref())
            });
        }
    }

    /// Sends a system notification to the display and every handheld.
    fn broadcast_devices(&self, session_id: SessionId, message: protocol::Envelope) {
        let mut state = self.lock();
        let devices = state.membership(session_id).devices();
        for device in devices {
            state.send(device, message.clone());
        }
    }
}
