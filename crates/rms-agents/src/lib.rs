//! rms-agents - The agents of the RMS coordination layer
//!
//! Five agents share one [`rms_core::EventBus`]:
//! - [`Orchestrator`] observes everything and escalates SLA breaches
//! - [`Classifier`] categorises new issues by keyword
//! - [`WorkflowEnforcer`] tracks stage residency and raises SLA alerts
//! - [`NotificationAgent`] turns alerts into user-facing notifications
//! - [`PatternMiner`] mines frequency patterns from the event history
//!
//! [`AgentSet`] wires them together.

pub mod classifier;
pub mod config;
pub mod learner;
pub mod manager;
pub mod notifications;
pub mod orchestrator;
pub mod workflow;

pub use classifier::Classifier;
pub use config::{
    AgentsConfig, Classification, ClassifierConfig, ConfigError, KeywordRule, LearnerConfig,
    NotificationConfig, StageSla, WorkflowConfig,
};
pub use learner::{Pattern, PatternKind, PatternMiner};
pub use manager::AgentSet;
pub use notifications::NotificationAgent;
pub use orchestrator::{Orchestrator, TaskRequest};
pub use workflow::{IssueState, SlaLevel, WorkflowEnforcer};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use rms_core::{Event, EventBus, EventKind, EventPayload, IssueCreated, Topic, WorkflowTransition};

    /// Everything published on a topic, in dispatch order
    #[derive(Clone, Default)]
    pub struct Captured {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl Captured {
        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        pub fn count(&self, kind: EventKind) -> usize {
            self.events().iter().filter(|e| e.kind() == kind).count()
        }

        pub fn last_of(&self, kind: EventKind) -> Option<Event> {
            self.events().into_iter().rev().find(|e| e.kind() == kind)
        }
    }

    pub fn capture(bus: &EventBus, topic: Topic) -> Captured {
        let captured = Captured::default();
        let sink = captured.events.clone();
        // Kept registered for the lifetime of the bus.
        let _ = bus.subscribe(topic, move |event: &Event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        captured
    }

    pub fn issue_created(id: &str, title: &str, description: &str) -> EventPayload {
        EventPayload::IssueCreated(IssueCreated {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            priority: None,
        })
    }

    pub fn transition(issue_id: &str, to_stage: &str) -> EventPayload {
        EventPayload::WorkflowTransition(WorkflowTransition {
            issue_id: issue_id.to_string(),
            from_stage: None,
            to_stage: to_stage.to_string(),
        })
    }
}
