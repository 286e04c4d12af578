use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::broker::{Broker, Target};
use crate::protocol::{DeviceRole, Envelope, SessionId};
use crate::registry::SessionView;

/// Lifecycle contract every registered application implements.
///
/// Hooks are invoked on the task that handled the triggering network event,
/// after the broker has committed the state change and released its lock, so
/// they may freely call back into the [`SessionScope`]. A hook error is logged
/// and never rolls back the change that caused it.
pub trait Application: Send + Sync {
    fn app_launched(&self, _scope: &SessionScope, _args: &Value) -> Result<()> {
        Ok(())
    }

    fn app_closed(&self, _scope: &SessionScope) -> Result<()> {
        Ok(())
    }

    fn session_terminated(&self, _scope: &SessionScope) -> Result<()> {
        Ok(())
    }

    fn handle_event(
        &self,
        scope: &SessionScope,
        message: &Envelope,
        device_name: &str,
        role: DeviceRole,
    ) -> Result<()>;

    fn device_connected(
        &self,
        _scope: &SessionScope,
        _role: DeviceRole,
        _name: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }

    fn device_disconnected(
        &self,
        _scope: &SessionScope,
        _role: DeviceRole,
        _name: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Name-keyed table of applications, frozen once built.
#[derive(Clone, Default)]
pub struct AppRegistry {
    apps: Arc<HashMap<String, Arc<dyn Application>>>,
}

impl AppRegistry {
    pub fn builder() -> AppRegistryBuilder {
        AppRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Application>> {
        self.apps.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.apps.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.apps.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Default)]
pub struct AppRegistryBuilder {
    apps: HashMap<String, Arc<dyn Application>>,
}

impl AppRegistryBuilder {
    /// Registers `app` under `name`; a later registration replaces an earlier one.
    pub fn register(mut self, name: impl Into<String>, app: impl Application + 'static) -> Self {
        self.apps.insert(name.into(), Arc::new(app));
        self
    }

    pub fn register_shared(mut self, name: impl Into<String>, app: Arc<dyn Application>) -> Self {
        self.apps.insert(name.into(), app);
        self
    }

    pub fn build(self) -> AppRegistry {
        AppRegistry {
            apps: Arc::new(self.apps),
        }
    }
}

/// What an application sees of one session: delivery to its devices and a
/// read-only membership query.
#[derive(Clone)]
pub struct SessionScope {
    broker: Broker,
    session_id: SessionId,
}

impl SessionScope {
    pub(crate) fn new(broker: Broker, session_id: SessionId) -> Self {
        Self { broker, session_id }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn send_to_handheld(&self, name: &str, message: Envelope) -> bool {
        self.broker
            .deliver(self.session_id, Target::Handheld(name), message)
            > 0
    }

    pub fn send_to_handhelds(&self, message: Envelope) -> usize {
        self.broker
            .deliver(self.session_id, Target::Handhelds, message)
    }

    pub fn send_to_display(&self, message: Envelope) -> bool {
        self.broker.deliver(self.session_id, Target::Display, message) > 0
    }

    pub fn send_to_console(&self, message: Envelope) -> bool {
        self.broker.deliver(self.session_id, Target::Console, message) > 0
    }

    /// `None` once the session has been terminated.
    pub fn membership(&self) -> Option<SessionView> {
        self.broker.session_view(self.session_id)
    }
}
