// Domain events for external subscribers (audit, notifications)

use tokio::sync::broadcast;
use uuid::Uuid;

/// Fired by the reconciler when an escrow reaches a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowEvent {
    Completed(Uuid),
    Failed(Uuid),
}

/// Broadcast bus for escrow lifecycle events. Publishing never blocks;
/// events are dropped when no subscriber is listening.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EscrowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: EscrowEvent) {
        // A send error only means there are currently no subscribers
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EscrowEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
