// =============================================================================
// Event Bus — minimal in-process topic dispatch
// =============================================================================
//
// Topics in use: `trade.open`, `trade.closed`. Subscribers are plain
// callbacks; a subscriber must never propagate failure into the publisher,
// so callbacks are infallible by construction (sinks handle their own
// errors internally).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

pub const TOPIC_TRADE_OPEN: &str = "trade.open";
pub const TOPIC_TRADE_CLOSED: &str = "trade.closed";

type Callback = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

/// In-process dispatcher. Production deployments could swap this for a real
/// broker; the engine only relies on the subscribe/publish contract.
#[derive(Default)]
pub struct EventBus {
    subs: RwLock<HashMap<String, Vec<Callback>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: &str, callback: F)
    where
        F: Fn(&str, &serde_json::Value) + Send + Sync + 'static,
    {
        self.subs
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    pub fn publish(&self, topic: &str, payload: &serde_json::Value) {
        let callbacks: Vec<Callback> = self
            .subs
            .read()
            .get(topic)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        debug!(topic, subscribers = callbacks.len(), "event published");
        for cb in callbacks {
            cb(topic, payload);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics: Vec<String> = self.subs.read().keys().cloned().collect();
        f.debug_struct("EventBus").field("topics", &topics).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribers_receive_matching_topic_only() {
        let bus = EventBus::new();
        let open_count = Arc::new(AtomicUsize::new(0));
        let closed_count = Arc::new(AtomicUsize::new(0));

        let oc = open_count.clone();
        bus.subscribe(TOPIC_TRADE_OPEN, move |_, _| {
            oc.fetch_add(1, Ordering::SeqCst);
        });
        let cc = closed_count.clone();
        bus.subscribe(TOPIC_TRADE_CLOSED, move |_, _| {
            cc.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(TOPIC_TRADE_OPEN, &serde_json::json!({"trade_id": "t1"}));
        bus.publish(TOPIC_TRADE_OPEN, &serde_json::json!({"trade_id": "t2"}));
        bus.publish(TOPIC_TRADE_CLOSED, &serde_json::json!({"trade_id": "t1"}));

        assert_eq!(open_count.load(Ordering::SeqCst), 2);
        assert_eq!(closed_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish("nobody.listening", &serde_json::json!({}));
    }

    #[test]
    fn multiple_subscribers_on_one_topic() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = count.clone();
            bus.subscribe(TOPIC_TRADE_OPEN, move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.publish(TOPIC_TRADE_OPEN, &serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn payload_reaches_subscriber() {
        let bus = EventBus::new();
        let seen = Arc::new(RwLock::new(String::new()));
        let s = seen.clone();
        bus.subscribe(TOPIC_TRADE_CLOSED, move |_, payload| {
            *s.write() = payload["symbol"].as_str().unwrap_or("").to_string();
        });
        bus.publish(TOPIC_TRADE_CLOSED, &serde_json::json!({"symbol": "BTCUSDT"}));
        assert_eq!(*seen.read(), "BTCUSDT");
    }
}
