use crate::models::{EventRecord, StreamEnvelope};
use tokio::sync::broadcast;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Fan-out of journal appends to live observers. Per-subscriber queuing is
/// bounded by the channel capacity; a subscriber that falls behind loses the
/// oldest entries and is told how many it missed.
#[derive(Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<EventRecord>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver to every current subscriber. No subscribers is not an error.
    pub fn publish(&self, event: EventRecord) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Next frame for one subscriber: an event envelope, a lag notice after the
/// subscriber fell behind, or None once the plane shuts down.
pub async fn next_frame(
    receiver: &mut broadcast::Receiver<EventRecord>,
) -> Option<StreamEnvelope> {
    match receiver.recv().await {
        Ok(event) => Some(StreamEnvelope::Events { event }),
        Err(broadcast::error::RecvError::Lagged(missed)) => Some(StreamEnvelope::System {
            message: "lagged".to_string(),
            missed: Some(missed),
        }),
        Err(broadcast::error::RecvError::Closed) => None,
    }
}
