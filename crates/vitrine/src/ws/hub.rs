//! Per-session status fan-out.

use dashmap::DashMap;
use log::debug;
use tokio::sync::broadcast;

use super::types::StatusEvent;

/// Default number of buffered events per session.
pub const DEFAULT_CAPACITY: usize = 64;

/// Publish/subscribe channel keyed by session id.
///
/// Publishing never waits: a subscriber that falls behind loses the oldest
/// events and sees a lag error on its receiver.
#[derive(Debug)]
pub struct StatusBroadcaster {
    channels: DashMap<String, broadcast::Sender<StatusEvent>>,
    capacity: usize,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<StatusEvent> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Deliver an event to current subscribers. Returns how many received it.
    pub fn publish(&self, session_id: &str, event: StatusEvent) -> usize {
        match self.channels.get(session_id) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop the channel of a finished session. Receivers see the stream end.
    pub fn close(&self, session_id: &str) {
        if self.channels.remove(session_id).is_some() {
            debug!("Closed status channel for session {}", session_id);
        }
    }

    /// Drop one session's channel if nobody listens to it any more.
    pub fn release(&self, session_id: &str) -> bool {
        self.channels
            .remove_if(session_id, |_, sender| sender.receiver_count() == 0)
            .is_some()
    }

    /// Drop channels nobody listens to.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.channels.len()
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels
            .get(session_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, status: &str) -> StatusEvent {
        StatusEvent::container_status(id, status, status, None, None)
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let hub = StatusBroadcaster::default();
        assert_eq!(hub.publish("s1", event("s1", "creating")), 0);
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_fanout_is_per_session() {
        let hub = StatusBroadcaster::default();
        let mut a1 = hub.subscribe("a");
        let mut a2 = hub.subscribe("a");
        let mut b = hub.subscribe("b");

        assert_eq!(hub.publish("a", event("a", "running")), 2);
        assert_eq!(a1.recv().await.unwrap().session_id(), "a");
        assert_eq!(a2.recv().await.unwrap().session_id(), "a");
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_receiver_lags_instead_of_blocking() {
        let hub = StatusBroadcaster::new(2);
        let mut rx = hub.subscribe("s1");
        for i in 0..5 {
            hub.publish("s1", event("s1", &format!("step{i}")));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_and_prune() {
        let hub = StatusBroadcaster::default();
        let mut rx = hub.subscribe("s1");
        {
            let _gone = hub.subscribe("s2");
        }
        assert_eq!(hub.prune(), 1);
        assert_eq!(hub.subscriber_count("s1"), 1);

        hub.close("s1");
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_release_keeps_listened_channels() {
        let hub = StatusBroadcaster::default();
        let rx = hub.subscribe("s1");
        assert!(!hub.release("s1"));
        assert_eq!(hub.channel_count(), 1);

        drop(rx);
        assert!(hub.release("s1"));
        assert_eq!(hub.channel_count(), 0);
        assert!(!hub.release("missing"));
    }
}
