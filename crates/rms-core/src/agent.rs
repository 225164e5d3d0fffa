//! Agent runtime contract
//!
//! Every agent is built with a name and a bus handle, registers its
//! subscriptions in `initialize`, and gives them all back in `destroy`.
//! [`AgentContext`] is the only state agents share in shape: the name, the
//! bus, and the list of live subscriptions.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bus::{EventBus, Subscription};
use crate::event::{Event, EventPayload, Topic};

/// The agent variants that make up the coordination layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    Orchestrator,
    Classifier,
    WorkflowEnforcer,
    Notification,
    PatternMiner,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Orchestrator => write!(f, "orchestrator"),
            Self::Classifier => write!(f, "classifier"),
            Self::WorkflowEnforcer => write!(f, "workflow-enforcer"),
            Self::Notification => write!(f, "notification"),
            Self::PatternMiner => write!(f, "pattern-miner"),
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> AgentKind;

    /// Register every subscription (and start any timers). Must not assume
    /// any other agent has been initialized.
    async fn initialize(&self) -> anyhow::Result<()>;

    /// Release subscriptions and cancel timers. Safe to call repeatedly and
    /// before `initialize` has run.
    fn destroy(&self);
}

/// Name, bus handle and subscription list owned by one agent
pub struct AgentContext {
    name: String,
    bus: EventBus,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl AgentContext {
    pub fn new(name: impl Into<String>, bus: EventBus) -> Self {
        Self {
            name: name.into(),
            bus,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|poisoned| {
            warn!("[{}] subscription list lock was poisoned, recovering", self.name);
            poisoned.into_inner()
        })
    }

    /// Subscribe on the shared bus and remember the handle for `release`
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, handler: F)
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let subscription = self.bus.subscribe(topic, handler);
        self.subscriptions().push(subscription);
    }

    /// Publish with this agent as the source
    pub fn publish(&self, payload: EventPayload, correlation_id: Option<String>) -> Arc<Event> {
        self.bus.publish(payload, &self.name, correlation_id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions().len()
    }

    /// Unsubscribe everything. The list is drained, so a second call has
    /// nothing left to release.
    pub fn release(&self) {
        let drained: Vec<Subscription> = self.subscriptions().drain(..).collect();
        if drained.is_empty() {
            return;
        }
        debug!("[{}] releasing {} subscriptions", self.name, drained.len());
        for subscription in drained {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, IssueDeleted};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn deleted() -> EventPayload {
        EventPayload::IssueDeleted(IssueDeleted { id: "ISS-1".into() })
    }

    #[test]
    fn test_context_publishes_with_its_name() {
        let bus = EventBus::new();
        let ctx = AgentContext::new("probe", bus);
        let event = ctx.publish(deleted(), Some("corr".into()));
        assert_eq!(event.source, "probe");
        assert_eq!(event.correlation_id.as_deref(), Some("corr"));
    }

    #[test]
    fn test_release_unsubscribes_everything_once() {
        let bus = EventBus::new();
        let ctx = AgentContext::new("probe", bus.clone());
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        ctx.subscribe(EventKind::IssueDeleted, move |_: &Event| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let h = hits.clone();
        ctx.subscribe(Topic::All, move |_: &Event| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(ctx.subscription_count(), 2);

        bus.publish(deleted(), "test", None);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        ctx.release();
        ctx.release();
        assert_eq!(ctx.subscription_count(), 0);
        assert_eq!(bus.subscriber_count(Topic::All), 0);

        bus.publish(deleted(), "test", None);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_release_leaves_other_subscribers_alone() {
        let bus = EventBus::new();
        let ctx = AgentContext::new("probe", bus.clone());
        ctx.subscribe(EventKind::IssueDeleted, |_: &Event| Ok(()));
        let _outsider = bus.subscribe(EventKind::IssueDeleted, |_: &Event| Ok(()));

        ctx.release();
        assert_eq!(bus.subscriber_count(EventKind::IssueDeleted), 1);
    }

    #[test]
    fn test_agent_kind_display() {
        assert_eq!(AgentKind::WorkflowEnforcer.to_string(), "workflow-enforcer");
        assert_eq!(AgentKind::PatternMiner.to_string(), "pattern-miner");
    }
}
