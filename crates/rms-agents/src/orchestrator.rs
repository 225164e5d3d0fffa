//! Orchestrator agent
//!
//! Observes every event on the bus, escalates SLA breaches as critical tasks,
//! and is the entry point for externally initiated work. It is the only agent
//! that starts new correlation chains instead of propagating existing ones.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rms_core::{
    Agent, AgentContext, AgentKind, AgentTask, Event, EventBus, EventKind, EventPayload, Priority,
    Topic,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Externally initiated work to fan out over the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Default)]
struct Counters {
    observed: AtomicUsize,
    escalations: AtomicUsize,
}

pub struct Orchestrator {
    ctx: AgentContext,
    counters: Arc<Counters>,
}

impl Orchestrator {
    pub fn new(bus: EventBus) -> Self {
        Self {
            ctx: AgentContext::new(AgentKind::Orchestrator.to_string(), bus),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Publish `request` as a coordination task under a fresh correlation id,
    /// which is returned
    pub fn coordinate_task(&self, request: TaskRequest) -> String {
        let task_id = format!("task-{}", uuid::Uuid::new_v4());
        debug!(
            "[{}] coordinating {} as {}",
            self.ctx.name(),
            request.task_type,
            task_id
        );
        self.ctx.publish(
            EventPayload::AgentTask(AgentTask::Coordinate {
                task_type: request.task_type,
                payload: request.payload,
                coordinator: self.ctx.name().to_string(),
            }),
            Some(task_id.clone()),
        );
        task_id
    }

    /// Events seen through the wildcard subscription
    pub fn observed_count(&self) -> usize {
        self.counters.observed.load(Ordering::Relaxed)
    }

    pub fn escalation_count(&self) -> usize {
        self.counters.escalations.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Agent for Orchestrator {
    fn name(&self) -> &str {
        self.ctx.name()
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Orchestrator
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        if self.ctx.subscription_count() > 0 {
            warn!("[{}] already initialized", self.ctx.name());
            return Ok(());
        }
        info!("[{}] Initializing", self.ctx.name());

        let counters = self.counters.clone();
        self.ctx.subscribe(Topic::All, move |event: &Event| {
            counters.observed.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Observed {} from {} (correlation: {})",
                event.kind(),
                event.source,
                event.correlation_id.as_deref().unwrap_or("-")
            );
            Ok(())
        });

        let counters = self.counters.clone();
        let bus = self.ctx.bus().clone();
        let name = self.ctx.name().to_string();
        self.ctx.subscribe(EventKind::SlaBreach, move |event: &Event| {
            let EventPayload::SlaBreach(breach) = &event.payload else {
                return Ok(());
            };
            info!(
                "[{}] escalating SLA breach of {} in {}",
                name, breach.issue_id, breach.stage
            );
            counters.escalations.fetch_add(1, Ordering::Relaxed);
            bus.publish(
                EventPayload::AgentTask(AgentTask::Escalate {
                    priority: Priority::Critical,
                    issue: breach.clone(),
                }),
                &name,
                event.correlation_id.clone(),
            );
            Ok(())
        });
        Ok(())
    }

    fn destroy(&self) {
        self.ctx.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{capture, issue_created};
    use rms_core::SlaBreach;
    use serde_json::json;

    fn breach() -> SlaBreach {
        SlaBreach {
            issue_id: "ISS-1".into(),
            stage: "new".into(),
            elapsed_ms: 90_000_000,
        }
    }

    #[tokio::test]
    async fn test_breach_is_escalated_with_correlation() {
        let bus = EventBus::new();
        let orchestrator = Orchestrator::new(bus.clone());
        orchestrator.initialize().await.unwrap();
        let seen = capture(&bus, EventKind::AgentTask.into());

        bus.publish(
            EventPayload::SlaBreach(breach()),
            "workflow-enforcer",
            Some("corr-1".into()),
        );

        let task = seen.last_of(EventKind::AgentTask).unwrap();
        assert_eq!(task.source, "orchestrator");
        assert_eq!(task.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(
            task.payload,
            EventPayload::AgentTask(AgentTask::Escalate {
                priority: Priority::Critical,
                issue: breach(),
            })
        );
        assert_eq!(orchestrator.escalation_count(), 1);
        orchestrator.destroy();
    }

    #[tokio::test]
    async fn test_observes_every_event() {
        let bus = EventBus::new();
        let orchestrator = Orchestrator::new(bus.clone());
        orchestrator.initialize().await.unwrap();

        bus.publish(issue_created("ISS-1", "Login", ""), "api", None);
        bus.publish(EventPayload::SlaBreach(breach()), "workflow-enforcer", None);

        // The breach, plus the escalation it caused.
        assert_eq!(orchestrator.observed_count(), 3);
        orchestrator.destroy();
    }

    #[tokio::test]
    async fn test_coordinate_task_starts_new_chain() {
        let bus = EventBus::new();
        let orchestrator = Orchestrator::new(bus.clone());
        orchestrator.initialize().await.unwrap();
        let seen = capture(&bus, EventKind::AgentTask.into());

        let first = orchestrator.coordinate_task(TaskRequest {
            task_type: "reindex".into(),
            payload: json!({"project": "web"}),
        });
        let second = orchestrator.coordinate_task(TaskRequest {
            task_type: "reindex".into(),
            payload: Value::Null,
        });

        assert!(first.starts_with("task-"));
        assert_ne!(first, second);

        let events = seen.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].correlation_id.as_deref(), Some(first.as_str()));
        assert_eq!(
            events[0].payload,
            EventPayload::AgentTask(AgentTask::Coordinate {
                task_type: "reindex".into(),
                payload: json!({"project": "web"}),
                coordinator: "orchestrator".into(),
            })
        );
        // Coordination tasks are not escalations.
        assert_eq!(orchestrator.escalation_count(), 0);
        orchestrator.destroy();
    }

    #[test]
    fn test_task_request_payload_defaults_to_null() {
        let request: TaskRequest = serde_json::from_str(r#"{"task_type":"sync"}"#).unwrap();
        assert_eq!(request.payload, Value::Null);
    }

    #[tokio::test]
    async fn test_destroy_stops_escalation() {
        let bus = EventBus::new();
        let orchestrator = Orchestrator::new(bus.clone());
        orchestrator.initialize().await.unwrap();
        orchestrator.destroy();

        bus.publish(EventPayload::SlaBreach(breach()), "workflow-enforcer", None);
        assert_eq!(orchestrator.escalation_count(), 0);
        assert_eq!(orchestrator.observed_count(), 0);
    }
}
