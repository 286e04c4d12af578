use anyhow::Result;
use tracing::trace;

use crate::app::{Application, SessionScope};
use crate::protocol::{DeviceRole, Envelope};

/// Relays every event it receives, unchanged, to the display and to every
/// handheld in the session. Useful for smoke-testing clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct BroadcastApp;

impl BroadcastApp {
    pub const NAME: &'static str = "broadcast";
}

impl Application for BroadcastApp {
    fn handle_event(
        &self,
        scope: &SessionScope,
        message: &Envelope,
        device_name: &str,
        role: DeviceRole,
    ) -> Result<()> {
        let handhelds = scope.send_to_handhelds(message.clone());
        let to_display = scope.send_to_display(message.clone());
        trace!(
            session_id = %scope.session_id(),
            from = device_name,
            role = %role,
            handhelds,
            display = to_display,
            "relayed event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::broker::testing::Harness;
    use crate::protocol::Outbound;

    #[tokio::test]
    async fn relays_to_display_and_handhelds() {
        let harness = Harness::new();
        let (mut console, session) = harness.console("alice").await;
        let mut display = harness.display(session).await;
        let (mut first, _) = harness.handheld(session, "Pixel").await;
        let (mut second, _) = harness.handheld(session, "Pixel").await;

        console.launch("broadcast", None).await;
        console.drain();
        display.drain();
        first.drain();
        second.drain();

        let message = json!({ "source": "broadcast", "event": "hello", "payload": { "n": 1 } });
        first.send(message.clone()).await;

        let expected: crate::protocol::Envelope = serde_json::from_value(message).unwrap();
        for device in [&mut display, &mut first, &mut second] {
            assert_eq!(device.drain(), vec![Outbound::Message(expected.clone())]);
        }
        console.expect_silence();
    }
}
