use tokio::sync::broadcast;

use crate::models::events::EmitEvent;

/// Lib -> adapter events. Cheap to clone: every background task holds one.
#[derive(Debug, Clone)]
pub struct EventBridge {
    sender: broadcast::Sender<EmitEvent>,
}

impl EventBridge {
    pub fn new() -> (Self, broadcast::Receiver<EmitEvent>) {
        let (sender, receiver) = broadcast::channel(100);
        (Self { sender }, receiver)
    }

    pub fn emit(&self, event: EmitEvent) {
        // Nobody listening is fine, the adapter may not have subscribed yet.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EmitEvent> {
        self.sender.subscribe()
    }
}
