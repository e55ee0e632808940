//! Runtime events — decoded notifications surfaced to the application.
//!
//! The bus is owned by the runtime instance; there is no process-global
//! emitter. Subscribing hands back a receiver whose drop is the unsubscribe.

use bytes::Bytes;
use tokio::sync::broadcast;

use lantern_link::OtaStatus;

#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Connected,
    Disconnected,
    /// The byte-code loaded on the network changed.
    TnglUpdate { fingerprint: u32 },
    /// A batch of decoded controller event-state changes.
    EventStateUpdates(Bytes),
    PeerConnected { address: u32 },
    PeerDisconnected { address: u32 },
    /// The shared timeline was manipulated remotely.
    TimelineUpdate { clock_timestamp: i64 },
    OtaProgress { written: usize, total: usize },
    OtaStatus(OtaStatus),
}

/// Broadcast fan-out for runtime events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    /// Emitting with no subscribers is not an error.
    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_emitted_after_subscribing() {
        let bus = EventBus::default();
        bus.emit(RuntimeEvent::Connected); // before subscribe, dropped
        let mut rx = bus.subscribe();
        bus.emit(RuntimeEvent::Disconnected);
        assert!(matches!(rx.recv().await, Ok(RuntimeEvent::Disconnected)));
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_block_emission() {
        let bus = EventBus::default();
        let rx = bus.subscribe();
        drop(rx);
        bus.emit(RuntimeEvent::Connected);
        let mut rx2 = bus.subscribe();
        bus.emit(RuntimeEvent::Connected);
        assert!(matches!(rx2.recv().await, Ok(RuntimeEvent::Connected)));
    }
}
