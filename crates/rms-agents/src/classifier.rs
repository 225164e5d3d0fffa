//! Keyword classifier
//!
//! Assigns a category and priority to every new issue from an ordered list of
//! keyword rules and announces the result as `issue:updated`. When a store is
//! attached the classification is also written back, off the dispatch path.

use std::sync::Arc;

use async_trait::async_trait;
use rms_core::{
    Agent, AgentContext, AgentError, AgentKind, Event, EventBus, EventKind, EventPayload,
    IssueCreated, IssuePatch, IssueStore, IssueUpdated, StoreError,
};
use tracing::{debug, info, warn};

use crate::config::{Classification, ClassifierConfig, KeywordRule};

/// Rules with keywords normalised to lowercase
struct RuleSet {
    rules: Vec<KeywordRule>,
    fallback: Option<Classification>,
}

impl RuleSet {
    fn new(config: ClassifierConfig) -> Self {
        let rules = config
            .rules
            .into_iter()
            .map(|rule| KeywordRule {
                keywords: rule
                    .keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect(),
                ..rule
            })
            .collect();
        Self {
            rules,
            fallback: config.fallback,
        }
    }

    fn classify(&self, title: &str, description: &str) -> Option<Classification> {
        let text = format!("{} {}", title, description).to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.keywords.iter().any(|k| text.contains(k.as_str())))
            .map(|rule| Classification {
                category: rule.category.clone(),
                priority: rule.priority,
            })
            .or_else(|| self.fallback.clone())
    }
}

pub struct Classifier {
    ctx: AgentContext,
    rules: Arc<RuleSet>,
    store: Option<Arc<dyn IssueStore>>,
}

impl Classifier {
    pub fn new(bus: EventBus, config: ClassifierConfig) -> Self {
        Self {
            ctx: AgentContext::new(AgentKind::Classifier.to_string(), bus),
            rules: Arc::new(RuleSet::new(config)),
            store: None,
        }
    }

    /// Persist every classification through `store`
    pub fn with_store(mut self, store: Arc<dyn IssueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Classify text without publishing anything
    pub fn classify(&self, title: &str, description: &str) -> Option<Classification> {
        self.rules.classify(title, description)
    }
}

async fn persist(
    store: &dyn IssueStore,
    id: &str,
    classification: &Classification,
) -> Result<u64, StoreError> {
    let current = store
        .find_by_id(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    let patch = IssuePatch {
        category: Some(classification.category.clone()),
        priority: Some(classification.priority),
        ..Default::default()
    };
    let updated = store.update(id, patch, current.version).await?;
    Ok(updated.version)
}

fn on_issue_created(
    rules: &RuleSet,
    store: Option<&Arc<dyn IssueStore>>,
    bus: &EventBus,
    name: &str,
    event: &Event,
    issue: &IssueCreated,
) {
    let Some(classification) = rules.classify(&issue.title, &issue.description) else {
        debug!("[{}] no rule matched {}", name, issue.id);
        return;
    };
    debug!(
        "[{}] {} -> {}/{}",
        name, issue.id, classification.category, classification.priority
    );

    bus.publish(
        EventPayload::IssueUpdated(IssueUpdated {
            id: issue.id.clone(),
            category: classification.category.clone(),
            priority: classification.priority,
        }),
        name,
        event.correlation_id.clone(),
    );

    let Some(store) = store.cloned() else {
        return;
    };
    let task_bus = bus.clone();
    let name = name.to_string();
    let id = issue.id.clone();
    let correlation_id = event.correlation_id.clone();
    bus.spawn(&format!("persist classification of {}", id), async move {
        match persist(store.as_ref(), &id, &classification).await {
            Ok(version) => {
                debug!("[{}] stored classification of {} (v{})", name, id, version);
            }
            Err(e) => {
                warn!("[{}] failed to store classification of {}: {}", name, id, e);
                task_bus.publish(
                    EventPayload::AgentError(AgentError {
                        agent: name.clone(),
                        context: format!("persisting classification of {}", id),
                        error: e.to_string(),
                    }),
                    &name,
                    correlation_id,
                );
            }
        }
        Ok(())
    });
}

#[async_trait]
impl Agent for Classifier {
    fn name(&self) -> &str {
        self.ctx.name()
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Classifier
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        if self.ctx.subscription_count() > 0 {
            warn!("[{}] already initialized", self.ctx.name());
            return Ok(());
        }
        info!(
            "[{}] Initializing with {} rules (store: {})",
            self.ctx.name(),
            self.rules.rules.len(),
            if self.store.is_some() { "attached" } else { "none" }
        );

        let rules = self.rules.clone();
        let store = self.store.clone();
        let bus = self.ctx.bus().clone();
        let name = self.ctx.name().to_string();
        self.ctx.subscribe(EventKind::IssueCreated, move |event: &Event| {
            if let EventPayload::IssueCreated(issue) = &event.payload {
                on_issue_created(&rules, store.as_ref(), &bus, &name, event, issue);
            }
            Ok(())
        });
        Ok(())
    }

    fn destroy(&self) {
        self.ctx.release();
    }
}
