// Typed publish/subscribe bus all components communicate through.
// Delivery is synchronous and in subscription order; a panicking subscriber
// is caught and logged without blocking the rest.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Closed set of events exchanged between components
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PriceUpdated {
        asset_id: String,
        price: f64,
        previous_price: Option<f64>,
    },
    PriceStale {
        asset_id: String,
        attempts: u32,
    },
    PositionCreated {
        asset_id: String,
        symbol: String,
        entry_price: Option<f64>,
        size: f64,
    },
    PositionUpdated {
        asset_id: String,
        symbol: String,
        current_price: f64,
        multiple: f64,
        percent_change: f64,
        highest_multiple: f64,
    },
    PositionPaused {
        asset_id: String,
        reason: String,
    },
    PositionResumed {
        asset_id: String,
    },
    PositionClosed {
        asset_id: String,
        reason: String,
    },
    TakeProfitTriggered {
        asset_id: String,
        stage: String,
        multiple: f64,
        percentage: f64,
    },
    MonitorStarted {
        asset_id: String,
        interval_secs: u64,
    },
    MonitorStopped {
        asset_id: String,
        reason: String,
    },
    /// Per-tick lookup summary, observability only
    BatchSummary {
        success: usize,
        failed: usize,
        elapsed_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PriceUpdated,
    PriceStale,
    PositionCreated,
    PositionUpdated,
    PositionPaused,
    PositionResumed,
    PositionClosed,
    TakeProfitTriggered,
    MonitorStarted,
    MonitorStopped,
    BatchSummary,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PriceUpdated { .. } => EventKind::PriceUpdated,
            Event::PriceStale { .. } => EventKind::PriceStale,
            Event::PositionCreated { .. } => EventKind::PositionCreated,
            Event::PositionUpdated { .. } => EventKind::PositionUpdated,
            Event::PositionPaused { .. } => EventKind::PositionPaused,
            Event::PositionResumed { .. } => EventKind::PositionResumed,
            Event::PositionClosed { .. } => EventKind::PositionClosed,
            Event::TakeProfitTriggered { .. } => EventKind::TakeProfitTriggered,
            Event::MonitorStarted { .. } => EventKind::MonitorStarted,
            Event::MonitorStopped { .. } => EventKind::MonitorStopped,
            Event::BatchSummary { .. } => EventKind::BatchSummary,
        }
    }
}

/// An event together with its publication timestamp
#[derive(Debug, Clone)]
pub struct Envelope {
    pub event: Event,
    pub timestamp: DateTime<Utc>,
}

pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Token returned by `subscribe`; removes exactly that handler
#[derive(Debug)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscribers.lock().unwrap();
        subs.entry(kind).or_default().push((id, handler));
        Subscription { kind, id }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        let mut subs = self.subscribers.lock().unwrap();
        if let Some(handlers) = subs.get_mut(&subscription.kind) {
            handlers.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Deliver `event` to every current subscriber of its kind, in
    /// subscription order. Handlers registered after this call never see it.
    pub fn publish(&self, event: Event) {
        let envelope = Envelope {
            timestamp: Utc::now(),
            event,
        };

        // Snapshot outside the lock so handlers can subscribe/unsubscribe
        let handlers: Vec<(u64, Handler)> = {
            let subs = self.subscribers.lock().unwrap();
            subs.get(&envelope.event.kind())
                .map(|h| h.to_vec())
                .unwrap_or_default()
        };

        for (id, handler) in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&envelope)));
            if result.is_err() {
                tracing::error!(
                    kind = ?envelope.event.kind(),
                    subscriber = id,
                    "event subscriber panicked, continuing delivery"
                );
            }
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let subs = self.subscribers.lock().unwrap();
        subs.get(&kind).map(|h| h.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn price_event(price: f64) -> Event {
        Event::PriceUpdated {
            asset_id: "mint-1".to_string(),
            price,
            previous_price: None,
        }
    }

    #[test]
    fn test_publish_reaches_subscriber() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        bus.subscribe(
            EventKind::PriceUpdated,
            Arc::new(move |env| {
                seen_clone.lock().unwrap().push(env.event.clone());
            }),
        );

        bus.publish(price_event(1.5));

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0], price_event(1.5));
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order_clone = order.clone();
            bus.subscribe(
                EventKind::PriceUpdated,
                Arc::new(move |_| order_clone.lock().unwrap().push(tag)),
            );
        }

        bus.publish(price_event(1.0));

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unsubscribe_removes_exactly_one_handler() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = count.clone();
        let sub1 = bus.subscribe(
            EventKind::PriceUpdated,
            Arc::new(move |_| {
                c1.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let c2 = count.clone();
        let _sub2 = bus.subscribe(
            EventKind::PriceUpdated,
            Arc::new(move |_| {
                c2.fetch_add(10, Ordering::SeqCst);
            }),
        );

        bus.unsubscribe(&sub1);
        bus.publish(price_event(1.0));

        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(bus.subscriber_count(EventKind::PriceUpdated), 1);
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            EventKind::PriceUpdated,
            Arc::new(|_| panic!("subscriber blew up")),
        );
        let c = count.clone();
        bus.subscribe(
            EventKind::PriceUpdated,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(price_event(1.0));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_replay_for_late_subscribers() {
        let bus = EventBus::new();
        bus.publish(price_event(1.0));

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(
            EventKind::PriceUpdated,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(count.load(Ordering::SeqCst), 0);

        bus.publish(price_event(2.0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kinds_are_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        bus.subscribe(
            EventKind::PositionClosed,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(price_event(1.0));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
