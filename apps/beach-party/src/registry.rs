//! Connection registry and the per-session membership directory derived from it.
//!
//! Membership is never stored on its own: it is rebuilt from the bound
//! connections on demand and memoized per session. Every method that binds,
//! unbinds or removes a connection drops the memoized entry for the affected
//! session before returning, so a caller holding the broker lock can never
//! observe a stale view.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::PrincipalId;
use crate::protocol::{DeviceRole, Envelope, Outbound, SessionId};

pub type ConnectionId = Uuid;

/// Role and session attached to a connection by a successful handshake.
#[derive(Debug, Clone)]
pub struct Binding {
    pub role: DeviceRole,
    pub session_id: SessionId,
    pub display_name: String,
    pub principal: Option<PrincipalId>,
    seq: u64,
}

impl Binding {
    /// Name exposed to the console and to application hooks. Only handhelds
    /// are addressed by name; the console and display are unique per session.
    pub fn public_name(&self) -> Option<&str> {
        match self.role {
            DeviceRole::Handheld => Some(self.display_name.as_str()),
            DeviceRole::Console | DeviceRole::Display => None,
        }
    }
}

struct Connection {
    tx: mpsc::UnboundedSender<Outbound>,
    binding: Option<Binding>,
}

/// Memoized view of one session: console, display and handhelds in join order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    pub console: Option<ConnectionId>,
    pub display: Option<ConnectionId>,
    pub handhelds: Vec<ConnectionId>,
}

impl Membership {
    /// Display first, then handhelds; the console is never included.
    pub fn devices(&self) -> Vec<ConnectionId> {
        self.display
            .iter()
            .chain(self.handhelds.iter())
            .copied()
            .collect()
    }
}

/// Read-only membership snapshot handed to applications and the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: SessionId,
    pub console: bool,
    pub display: bool,
    pub handhelds: Vec<String>,
    pub active_app: Option<String>,
}

/// Everything the broker mutates, guarded by a single lock in [`crate::broker::Broker`].
pub struct BrokerState {
    connections: HashMap<ConnectionId, Connection>,
    directory: HashMap<SessionId, Membership>,
    owners: HashMap<SessionId, String>,
    sessions_by_principal: HashMap<PrincipalId, SessionId>,
    lanes: HashMap<SessionId, Arc<Mutex<()>>>,
    next_session_id: Option<u64>,
    next_seq: u64,
}

impl BrokerState {
    pub fn new(first_session_id: u64) -> Self {
        Self {
            connections: HashMap::new(),
            directory: HashMap::new(),
            owners: HashMap::new(),
            sessions_by_principal: HashMap::new(),
            lanes: HashMap::new(),
            next_session_id: Some(first_session_id),
            next_seq: 0,
        }
    }

    pub fn open(&mut self, id: ConnectionId, tx: mpsc::UnboundedSender<Outbound>) {
        self.connections.insert(id, Connection { tx, binding: None });
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn binding(&self, id: ConnectionId) -> Option<&Binding> {
        self.connections.get(&id).and_then(|conn| conn.binding.as_ref())
    }

    /// Attaches a role to an open, unbound connection. Returns `false` when the
    /// connection is gone or already bound.
    pub fn bind(
        &mut self,
        id: ConnectionId,
        role: DeviceRole,
        session_id: SessionId,
        display_name: String,
        principal: Option<PrincipalId>,
    ) -> bool {
        let seq = self.next_seq;
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };
        if conn.binding.is_some() {
            return false;
        }
        conn.binding = Some(Binding {
            role,
            session_id,
            display_name,
            principal,
            seq,
        });
        self.next_seq += 1;
        self.directory.remove(&session_id);
        true
    }

    /// Detaches a connection from its session while leaving the socket tracked.
    pub fn unbind(&mut self, id: ConnectionId) -> Option<Binding> {
        let binding = self.connections.get_mut(&id)?.binding.take()?;
        self.directory.remove(&binding.session_id);
        Some(binding)
    }

    /// Forgets a connection entirely, returning its binding if it had one.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Option<Binding>> {
        let conn = self.connections.remove(&id)?;
        if let Some(binding) = &conn.binding {
            self.directory.remove(&binding.session_id);
        }
        Some(conn.binding)
    }

    pub fn membership(&mut self, session_id: SessionId) -> &Membership {
        if !self.directory.contains_key(&session_id) {
            let membership = self.scan(session_id);
            self.directory.insert(session_id, membership);
        }
        &self.directory[&session_id]
    }

    fn scan(&self, session_id: SessionId) -> Membership {
        let mut membership = Membership::default();
        let mut handhelds = Vec::new();
        for (id, conn) in &self.connections {
            let Some(binding) = &conn.binding else {
                continue;
            };
            if binding.session_id != session_id {
                continue;
            }
            match binding.role {
                DeviceRole::Console => membership.console = Some(*id),
                DeviceRole::Display => membership.display = Some(*id),
                DeviceRole::Handheld => handhelds.push((binding.seq, *id)),
            }
        }
        handhelds.sort_unstable_by_key(|(seq, _)| *seq);
        membership.handhelds = handhelds.into_iter().map(|(_, id)| id).collect();
        membership
    }

    pub fn is_live(&mut self, session_id: SessionId) -> bool {
        self.membership(session_id).console.is_some()
    }

    pub fn handheld_names(&mut self, session_id: SessionId) -> Vec<String> {
        let handhelds = self.membership(session_id).handhelds.clone();
        handhelds
            .into_iter()
            .filter_map(|id| self.binding(id).map(|b| b.display_name.clone()))
            .collect()
    }

    pub fn find_handheld(&mut self, session_id: SessionId, name: &str) -> Option<ConnectionId> {
        let handhelds = self.membership(session_id).handhelds.clone();
        handhelds
            .into_iter()
            .find(|id| self.binding(*id).is_some_and(|b| b.display_name == name))
    }

    /// `"<model> (<n>)"` where `n` starts one past the current handheld count
    /// and skips ordinals whose name is still in use.
    pub fn next_handheld_name(&mut self, session_id: SessionId, model: &str) -> String {
        let taken = self.handheld_names(session_id);
        let mut ordinal = taken.len() + 1;
        loop {
            let candidate = format!("{model} ({ordinal})");
            if !taken.contains(&candidate) {
                return candidate;
            }
            ordinal += 1;
        }
    }

    pub fn view(&mut self, session_id: SessionId) -> Option<SessionView> {
        let membership = self.membership(session_id).clone();
        membership.console?;
        Some(SessionView {
            session_id,
            console: true,
            display: membership.display.is_some(),
            handhelds: self.handheld_names(session_id),
            active_app: self.owner(session_id).map(str::to_string),
        })
    }

    /// Fire-and-forget delivery; returns whether the frame was queued.
    pub fn send(&self, id: ConnectionId, envelope: Envelope) -> bool {
        self.push(id, Outbound::Message(envelope))
    }

    pub fn close(&self, id: ConnectionId) -> bool {
        self.push(id, Outbound::Close)
    }

    fn push(&self, id: ConnectionId, frame: Outbound) -> bool {
        self.connections
            .get(&id)
            .is_some_and(|conn| conn.tx.send(frame).is_ok())
    }

    /// `None` once the id space is exhausted.
    pub fn mint_session_id(&mut self) -> Option<SessionId> {
        let id = self.next_session_id?;
        self.next_session_id = id.checked_add(1);
        Some(SessionId::new(id))
    }

    pub fn session_of(&self, principal: &PrincipalId) -> Option<SessionId> {
        self.sessions_by_principal.get(principal).copied()
    }

    pub fn claim_session(&mut self, principal: PrincipalId, session_id: SessionId) {
        self.sessions_by_principal.insert(principal, session_id);
    }

    pub fn release_session(&mut self, principal: &PrincipalId) -> Option<SessionId> {
        self.sessions_by_principal.remove(principal)
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions_by_principal.len()
    }

    pub fn owner(&self, session_id: SessionId) -> Option<&str> {
        self.owners.get(&session_id).map(String::as_str)
    }

    /// Records `app` as the session's owner unless one is already set.
    pub fn try_set_owner(&mut self, session_id: SessionId, app: &str) -> bool {
        if self.owners.contains_key(&session_id) {
            return false;
        }
        self.owners.insert(session_id, app.to_string());
        true
    }

    pub fn take_owner(&mut self, session_id: SessionId) -> Option<String> {
        self.owners.remove(&session_id)
    }

    /// Per-session mutex that application hooks for `session_id` run under.
    /// Lock order is lane first, then this state; never the reverse. A dead
    /// session gets a throwaway lane rather than a new entry.
    pub fn lane(&mut self, session_id: SessionId) -> Arc<Mutex<()>> {
        if let Some(lane) = self.lanes.get(&session_id) {
            return lane.clone();
        }
        let lane = Arc::new(Mutex::new(()));
        if self.is_live(session_id) {
            self.lanes.insert(session_id, lane.clone());
        }
        lane
    }

    pub fn retire_lane(&mut self, session_id: SessionId) {
        self.lanes.remove(&session_id);
    }

    #[cfg(test)]
    pub(crate) fn fresh_membership(&self, session_id: SessionId) -> Membership {
        self.scan(session_id)
    }
}
