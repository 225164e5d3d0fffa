//! Agent set — builds all five agents against one bus and drives their lifecycle

use std::sync::Arc;

use anyhow::{Context, Result};
use rms_core::{Agent, EventBus, IssueStore, SharedClock};
use tracing::info;

use crate::classifier::Classifier;
use crate::config::AgentsConfig;
use crate::learner::PatternMiner;
use crate::notifications::NotificationAgent;
use crate::orchestrator::Orchestrator;
use crate::workflow::WorkflowEnforcer;

/// The coordination layer: one instance of every agent sharing a bus
pub struct AgentSet {
    bus: EventBus,
    orchestrator: Arc<Orchestrator>,
    classifier: Arc<Classifier>,
    workflow: Arc<WorkflowEnforcer>,
    notifications: Arc<NotificationAgent>,
    learner: Arc<PatternMiner>,
}

impl AgentSet {
    /// Construct every agent without subscribing anything yet
    pub fn new(
        bus: EventBus,
        config: AgentsConfig,
        clock: SharedClock,
        store: Option<Arc<dyn IssueStore>>,
    ) -> Self {
        let mut classifier = Classifier::new(bus.clone(), config.classifier);
        if let Some(store) = store {
            classifier = classifier.with_store(store);
        }

        Self {
            orchestrator: Arc::new(Orchestrator::new(bus.clone())),
            classifier: Arc::new(classifier),
            workflow: Arc::new(WorkflowEnforcer::new(
                bus.clone(),
                config.workflow,
                clock.clone(),
            )),
            notifications: Arc::new(NotificationAgent::new(
                bus.clone(),
                config.notifications,
                clock,
            )),
            learner: Arc::new(PatternMiner::new(bus.clone(), config.learner)),
            bus,
        }
    }

    /// Validate `config`, construct every agent and initialize them
    pub async fn start(
        bus: EventBus,
        config: AgentsConfig,
        clock: SharedClock,
        store: Option<Arc<dyn IssueStore>>,
    ) -> Result<Self> {
        config.validate().context("Invalid agent configuration")?;
        let set = Self::new(bus, config, clock, store);
        set.initialize().await?;
        Ok(set)
    }

    /// Initialize all agents concurrently. No agent depends on another having
    /// initialized first.
    pub async fn initialize(&self) -> Result<()> {
        tokio::try_join!(
            init(self.orchestrator.as_ref()),
            init(self.classifier.as_ref()),
            init(self.workflow.as_ref()),
            init(self.notifications.as_ref()),
            init(self.learner.as_ref()),
        )?;
        info!("AgentSet: {} agents initialized", self.agents().len());
        Ok(())
    }

    pub fn agents(&self) -> Vec<Arc<dyn Agent>> {
        vec![
            self.orchestrator.clone(),
            self.classifier.clone(),
            self.workflow.clone(),
            self.notifications.clone(),
            self.learner.clone(),
        ]
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn workflow(&self) -> &WorkflowEnforcer {
        &self.workflow
    }

    pub fn notifications(&self) -> &NotificationAgent {
        &self.notifications
    }

    pub fn learner(&self) -> &PatternMiner {
        &self.learner
    }

    /// Destroy every agent. Safe to call more than once.
    pub fn shutdown(&self) {
        for agent in self.agents() {
            agent.destroy();
        }
        info!("AgentSet: all agents destroyed");
    }
}

async fn init(agent: &dyn Agent) -> Result<()> {
    agent
        .initialize()
        .await
        .with_context(|| format!("Failed to initialize agent '{}'", agent.name()))
}
