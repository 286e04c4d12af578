//! Applications that ship with the broker.

mod broadcast;

pub use broadcast::BroadcastApp;

use crate::app::AppRegistry;

/// Registry holding every built-in application under its wire name.
pub fn default_registry() -> AppRegistry {
    AppRegistry::builder()
        .register(BroadcastApp::NAME, BroadcastApp)
        .build()
}
