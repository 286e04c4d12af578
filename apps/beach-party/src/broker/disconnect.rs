use metrics::{counter, gauge};
use tracing::{debug, info};

use super::Broker;
use crate::protocol::{self, DeviceRole, SessionId, CONSOLE_LOST_REASON};
use crate::registry::{Binding, ConnectionId};

impl Broker {
    /// Forgets a connection whose socket has closed. Safe to call more than
    /// once; only the first call has any effect.
    pub fn handle_disconnect(&self, id: ConnectionId) {
        let binding = {
            let mut state = self.lock();
            let removed = state.remove(id);
            gauge!("beach_party_connections_open", state.connection_count() as f64);
            match removed {
                Some(Some(binding)) => binding,
                Some(None) => {
                    debug!(connection_id = %id, "unauthenticated connection closed");
                    return;
                }
                None => return,
            }
        };

        info!(
            connection_id = %id,
            session_id = %binding.session_id,
            role = %binding.role,
            name = %binding.display_name,
            "device disconnected"
        );

        match binding.role {
            DeviceRole::Console => self.terminate_session(binding),
            DeviceRole::Display | DeviceRole::Handheld => self.device_left(binding),
        }
    }

    /// Tears a session down after its console went away.
    fn terminate_session(&self, console: Binding) {
        let session_id = console.session_id;
        // Waits out any hook already running for this session; later ones
        // find neither a console nor an owner and stand down.
        let lane = self.lane(session_id);
        let _turn = lane.lock();
        let owner = {
            let mut state = self.lock();
            if let Some(principal) = &console.principal {
                state.release_session(principal);
            }
            gauge!("beach_party_sessions_active", state.live_sessions() as f64);
            state.retire_lane(session_id);
            state.take_owner(session_id)
        };
        counter!("beach_party_sessions_terminated_total", 1);

        if let Some(app_name) = owner {
            self.invoke(&app_name, "session_terminated", session_id, |app, scope| {
                app.session_terminated(scope)
            });
        }

        self.evict_devices(session_id);
    }

    /// Notifies and closes every device still bound to `session_id`. They are
    /// unbound here so their own socket closing later announces nothing.
    fn evict_devices(&self, session_id: SessionId) {
        let mut state = self.lock();
        let devices = state.membership(session_id).devices();
        let notice = protocol::session_terminated(CONSOLE_LOST_REASON);
        for device in &devices {
            state.send(*device, notice.clone());
            state.close(*device);
            state.unbind(*device);
        }
        debug!(session_id = %session_id, evicted = devices.len(), "session terminated");
    }

    fn device_left(&self, binding: Binding) {
        let session_id = binding.session_id;
        let name = binding.public_name().map(str::to_string);
        let lane = self.lane(session_id);
        let _turn = lane.lock();
        let owner = {
            let mut state = self.lock();
            let Some(console) = state.membership(session_id).console else {
                return;
            };
            state.send(console, protocol::device_disconnected(binding.role, name.as_deref()));
            state.owner(session_id).map(str::to_string)
        };

        if let Some(app_name) = owner {
            self.invoke(&app_name, "device_disconnected", session_id, |app, scope| {
                app.device_disconnected(scope, binding.role, name.as_deref())
            });
        }
    }
}
