//! Event bus — in-process publish/subscribe between agents
//!
//! `publish` invokes every handler registered for the event's kind, then every
//! wildcard handler, in registration order and on the caller's stack. Handler
//! failures are logged and swallowed. Work that has to wait on I/O is handed to
//! [`EventBus::spawn`] and runs detached from the publish call.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::clock::{SharedClock, system_clock};
use crate::event::{Event, EventPayload, Topic};

/// A subscriber callback
pub type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

struct Entry {
    id: u64,
    handler: Handler,
}

struct BusInner {
    subscribers: Mutex<HashMap<Topic, Vec<Entry>>>,
    next_id: AtomicU64,
    clock: SharedClock,
    tasks: TaskTracker,
}

impl BusInner {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<Topic, Vec<Entry>>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| {
            warn!("Event bus subscriber lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn remove(&self, topic: Topic, id: u64) -> bool {
        let mut subscribers = self.subscribers();
        let Some(entries) = subscribers.get_mut(&topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            subscribers.remove(&topic);
        }
        removed
    }
}

/// Cloneable handle to a shared event bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus that stamps events with the system clock
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create a bus that stamps events with the given clock
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                clock,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    /// Register a handler for a topic. Handlers on the same topic run in the
    /// order they were registered.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, handler: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers()
            .entry(topic)
            .or_default()
            .push(Entry {
                id,
                handler: Arc::new(handler),
            });
        debug!("Subscribed handler #{} to {}", id, topic);
        Subscription {
            bus: Arc::downgrade(&self.inner),
            topic,
            id,
        }
    }

    /// Build an event and dispatch it to the current subscribers.
    ///
    /// The set of handlers is fixed when dispatch starts: handlers added or
    /// removed while it runs only affect later publishes.
    pub fn publish(
        &self,
        payload: EventPayload,
        source: &str,
        correlation_id: Option<String>,
    ) -> Arc<Event> {
        let event = Arc::new(Event {
            payload,
            source: source.to_string(),
            timestamp: self.inner.clock.utc(),
            correlation_id,
        });
        let kind = event.kind();

        let handlers: Vec<(u64, Handler)> = {
            let subscribers = self.inner.subscribers();
            [Topic::Kind(kind), Topic::All]
                .iter()
                .filter_map(|topic| subscribers.get(topic))
                .flatten()
                .map(|entry| (entry.id, entry.handler.clone()))
                .collect()
        };

        debug!(
            "Dispatching {} from {} to {} handlers",
            kind,
            event.source,
            handlers.len()
        );

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Handler #{} failed on {}: {:#}", id, kind, e),
                Err(_) => error!("Handler #{} panicked on {}", id, kind),
            }
        }

        event
    }

    /// Run a handler's continuation in the background. The publisher does
    /// not wait for it and never sees its error.
    pub fn spawn<F>(&self, label: &str, work: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No async runtime available, dropping continuation '{}'", label);
            return;
        }
        let label = label.to_string();
        self.inner.tasks.spawn(async move {
            if let Err(e) = work.await {
                warn!("Continuation '{}' failed: {:#}", label, e);
            }
        });
    }

    /// Wait until every continuation spawned so far (and any they spawn in
    /// turn) has finished.
    pub async fn flush(&self) {
        let tasks = &self.inner.tasks;
        tasks.close();
        tasks.wait().await;
        tasks.reopen();
    }

    /// Number of continuations still running
    pub fn in_flight(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Number of handlers currently registered for exactly this topic
    pub fn subscriber_count(&self, topic: impl Into<Topic>) -> usize {
        self.inner
            .subscribers()
            .get(&topic.into())
            .map_or(0, Vec::len)
    }
}

/// Handle returned by [`EventBus::subscribe`]
///
/// Dropping it leaves the handler registered; call [`Subscription::unsubscribe`].
#[derive(Debug)]
#[must_use = "dropping a Subscription does not unsubscribe"]
pub struct Subscription {
    bus: Weak<BusInner>,
    topic: Topic,
    id: u64,
}

impl Subscription {
    /// Remove the handler from the bus. Calling this more than once, or after
    /// the bus is gone, does nothing.
    pub fn unsubscribe(&self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        if bus.remove(self.topic, self.id) {
            debug!("Unsubscribed handler #{} from {}", self.id, self.topic);
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, IssueCreated, IssueDeleted};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn created(id: &str) -> EventPayload {
        EventPayload::IssueCreated(IssueCreated {
            id: id.to_string(),
            title: "Crash on login".to_string(),
            description: String::new(),
            priority: None,
        })
    }

    fn deleted(id: &str) -> EventPayload {
        EventPayload::IssueDeleted(IssueDeleted { id: id.to_string() })
    }

    fn recorder(bus: &EventBus, topic: Topic, label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Subscription {
        let log = log.clone();
        bus.subscribe(topic, move |event: &Event| {
            log.lock().unwrap().push(format!("{}:{}", label, event.kind()));
            Ok(())
        })
    }

    #[test]
    fn test_kind_handlers_run_before_wildcard_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _w1 = recorder(&bus, Topic::All, "w1", &log);
        let _a = recorder(&bus, EventKind::IssueCreated.into(), "a", &log);
        let _b = recorder(&bus, EventKind::IssueCreated.into(), "b", &log);
        let _w2 = recorder(&bus, Topic::All, "w2", &log);
        let _other = recorder(&bus, EventKind::IssueDeleted.into(), "other", &log);

        bus.publish(created("ISS-1"), "test", None);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "a:issue:created",
                "b:issue:created",
                "w1:issue:created",
                "w2:issue:created",
            ]
        );
    }

    #[test]
    fn test_each_handler_called_exactly_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _s = bus.subscribe(EventKind::IssueDeleted, move |_: &Event| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(deleted("ISS-1"), "test", None);
        bus.publish(created("ISS-2"), "test", None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_publish_builds_event() {
        let bus = EventBus::new();
        let event = bus.publish(created("ISS-9"), "api", Some("corr-1".to_string()));
        assert_eq!(event.kind(), EventKind::IssueCreated);
        assert_eq!(event.source, "api");
        assert_eq!(event.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn test_unsubscribe_stops_delivery_and_is_idempotent() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = bus.subscribe(EventKind::IssueCreated, move |_: &Event| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(created("ISS-1"), "test", None);
        sub.unsubscribe();
        sub.unsubscribe();
        bus.publish(created("ISS-2"), "test", None);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(EventKind::IssueCreated), 0);
    }

    #[test]
    fn test_unsubscribe_inside_handler_keeps_current_pass() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        // The first handler removes the second one while dispatch is running.
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let v = victim.clone();
        let _killer = bus.subscribe(EventKind::IssueCreated, move |_: &Event| {
            if let Some(sub) = v.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
            Ok(())
        });
        let sub = recorder(&bus, EventKind::IssueCreated.into(), "victim", &log);
        *victim.lock().unwrap() = Some(sub);

        bus.publish(created("ISS-1"), "test", None);
        bus.publish(created("ISS-2"), "test", None);

        assert_eq!(*log.lock().unwrap(), vec!["victim:issue:created"]);
    }

    #[test]
    fn test_subscribe_inside_handler_applies_to_next_publish() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let added = Arc::new(AtomicUsize::new(0));

        let inner_bus = bus.clone();
        let inner_log = log.clone();
        let a = added.clone();
        let _outer = bus.subscribe(EventKind::IssueCreated, move |_: &Event| {
            if a.fetch_add(1, Ordering::SeqCst) == 0 {
                // Dropping the handle leaves the late handler registered.
                let _late = recorder(&inner_bus, EventKind::IssueCreated.into(), "late", &inner_log);
            }
            Ok(())
        });

        bus.publish(created("ISS-1"), "test", None);
        assert!(log.lock().unwrap().is_empty());

        bus.publish(created("ISS-2"), "test", None);
        assert_eq!(*log.lock().unwrap(), vec!["late:issue:created"]);
    }

    #[test]
    fn test_failing_and_panicking_handlers_do_not_reach_publisher() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicUsize::new(0));

        let _fails = bus.subscribe(EventKind::IssueCreated, |_: &Event| {
            anyhow::bail!("store unavailable")
        });
        let _panics = bus.subscribe(EventKind::IssueCreated, |_: &Event| -> anyhow::Result<()> {
            panic!("handler bug")
        });
        let r = reached.clone();
        let _after = bus.subscribe(Topic::All, move |_: &Event| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(created("ISS-1"), "test", None);
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_publish_from_handler() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner = bus.clone();
        let _relay = bus.subscribe(EventKind::IssueCreated, move |event: &Event| {
            if let EventPayload::IssueCreated(issue) = &event.payload {
                inner.publish(deleted(&issue.id), "relay", event.correlation_id.clone());
            }
            Ok(())
        });
        let _w = recorder(&bus, Topic::All, "w", &log);

        bus.publish(created("ISS-1"), "test", None);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["w:issue:deleted", "w:issue:created"]
        );
    }

    #[test]
    fn test_dropped_subscription_stays_registered() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        drop(bus.subscribe(EventKind::IssueCreated, move |_: &Event| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        bus.publish(created("ISS-1"), "test", None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(EventKind::IssueCreated), 1);
    }

    #[test]
    fn test_unsubscribe_after_bus_dropped_is_harmless() {
        let bus = EventBus::new();
        let sub = bus.subscribe(Topic::All, |_: &Event| Ok(()));
        drop(bus);
        sub.unsubscribe();
        assert_eq!(sub.topic(), Topic::All);
    }

    #[tokio::test]
    async fn test_publish_does_not_wait_for_continuations() {
        let bus = EventBus::new();
        let done = Arc::new(AtomicUsize::new(0));

        let spawner = bus.clone();
        let d = done.clone();
        let _s = bus.subscribe(EventKind::IssueCreated, move |_: &Event| {
            let d = d.clone();
            spawner.spawn("slow write", async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                d.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            });
            Ok(())
        });

        bus.publish(created("ISS-1"), "test", None);
        assert_eq!(done.load(Ordering::SeqCst), 0);

        bus.flush().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(bus.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failed_continuation_is_swallowed() {
        let bus = EventBus::new();
        bus.spawn("doomed", async { Err::<(), _>(anyhow::anyhow!("disk full")) });
        bus.flush().await;

        // The bus keeps accepting work after a flush.
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        bus.spawn("after", async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        });
        bus.flush().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawn_without_runtime_is_dropped() {
        let bus = EventBus::new();
        bus.spawn("orphan", async { Ok::<_, anyhow::Error>(()) });
        assert_eq!(bus.in_flight(), 0);
    }
}
