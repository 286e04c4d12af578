use tracing::{debug, trace};

use super::Broker;
use crate::protocol::{self, DenyReason, Envelope};
use crate::registry::ConnectionId;

impl Broker {
    /// Forwards an application-scoped event to the session's active
    /// application. The broker never looks inside `event` or `payload`.
    pub(super) fn route(&self, id: ConnectionId, envelope: Envelope) {
        let session_id = {
            let state = self.lock();
            let Some(binding) = state.binding(id) else {
                state.send(id, protocol::access_denied(DenyReason::Unauthorized));
                return;
            };

            // Devices cannot speak for applications, and unknown control
            // events are not forwarded anywhere.
            if envelope.is_from_device() {
                debug!(connection_id = %id, event = %envelope.event, "dropping unknown control event");
                return;
            }
            binding.session_id
        };

        let lane = self.lane(session_id);
        let _turn = lane.lock();
        let (role, device_name, app_name) = {
            let state = self.lock();
            // Evicted while waiting for the lane.
            let Some(binding) = state.binding(id) else {
                return;
            };
            match state.owner(session_id) {
                Some(owner) if owner == envelope.source => (
                    binding.role,
                    binding.display_name.clone(),
                    owner.to_string(),
                ),
                _ => {
                    state.send(id, protocol::access_denied(DenyReason::AppNotLaunched));
                    return;
                }
            }
        };

        trace!(
            session_id = %session_id,
            app = %app_name,
            event = %envelope.event,
            "routing event to application"
        );
        self.invoke(&app_name, "handle_event", session_id, |app, scope| {
            app.handle_event(scope, &envelope, &device_name, role)
        });
    }
}
