use std::time::Duration;

use log::debug;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// How long a subscriber may sit idle before it gets a keep-alive marker.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

const CHANNEL_CAPACITY: usize = 64;

/// A named push event with its JSON payload. Names in use: `status`,
/// `scenes`, `settings`, `fixture-plan`.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub data: Value,
}

/// What a subscriber loop yields: either an event or a keep-alive tick
/// after 15 s of silence.
#[derive(Debug, Clone)]
pub enum EventMessage {
    Event(Event),
    KeepAlive,
}

/// Fan-out hub for server-pushed events.
///
/// Bounded broadcast channel: a slow subscriber loses the oldest queued
/// events instead of stalling producers. Broadcasting with no subscribers
/// is a silent drop.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<Event>,
}

impl Default for EventHub {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl EventHub {
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn broadcast(&self, name: &str, data: Value) {
        let event = Event {
            name: name.to_string(),
            data,
        };
        if self.sender.send(event).is_err() {
            // No subscribers yet; nothing to deliver.
            debug!("dropping {name} event, no subscribers");
        }
    }
}

pub struct EventSubscriber {
    receiver: broadcast::Receiver<Event>,
}

impl EventSubscriber {
    /// Next event, or a keep-alive after [`KEEP_ALIVE_INTERVAL`] of
    /// silence. `None` once the hub is gone.
    pub async fn next_message(&mut self) -> Option<EventMessage> {
        self.next_message_within(KEEP_ALIVE_INTERVAL).await
    }

    pub async fn next_message_within(&mut self, idle: Duration) -> Option<EventMessage> {
        loop {
            match timeout(idle, self.receiver.recv()).await {
                Ok(Ok(event)) => return Some(EventMessage::Event(event)),
                // Overflowed: we dropped the oldest events, keep reading.
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!("event subscriber lagged, skipped {skipped} events");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Err(_elapsed) => return Some(EventMessage::KeepAlive),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn events_fan_out_to_all_subscribers() {
        let hub = EventHub::default();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        hub.broadcast("status", json!({"active_scene_id": "wash"}));

        for subscriber in [&mut first, &mut second] {
            match subscriber.next_message_within(Duration::from_millis(200)).await {
                Some(EventMessage::Event(event)) => {
                    assert_eq!(event.name, "status");
                    assert_eq!(event.data["active_scene_id"], "wash");
                }
                other => panic!("expected event, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_silent() {
        let hub = EventHub::default();
        hub.broadcast("scenes", json!([]));
        // Subscribing afterwards does not replay the dropped event.
        let mut subscriber = hub.subscribe();
        match subscriber.next_message_within(Duration::from_millis(50)).await {
            Some(EventMessage::KeepAlive) => {}
            other => panic!("expected keep-alive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_subscriber_gets_keep_alive() {
        let hub = EventHub::default();
        let mut subscriber = hub.subscribe();
        match subscriber.next_message_within(Duration::from_millis(20)).await {
            Some(EventMessage::KeepAlive) => {}
            other => panic!("expected keep-alive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_hub_ends_the_stream() {
        let hub = EventHub::default();
        let mut subscriber = hub.subscribe();
        drop(hub);
        assert!(subscriber
            .next_message_within(Duration::from_millis(50))
            .await
            .is_none());
    }
}
