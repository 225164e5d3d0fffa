//! Notification agent
//!
//! Turns SLA alerts, new issues and agent failures into user-facing
//! notifications. Each one lands at the front of a bounded history and is
//! republished as `agent:result`, which is what the UI transport consumes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rms_core::{
    Agent, AgentContext, AgentKind, AgentResult, Event, EventKind, EventPayload, Notification,
    SharedClock, Severity,
};
use tracing::{debug, info, warn};

use crate::config::NotificationConfig;

/// Bounded, newest-first notification history
struct NotificationLog {
    config: NotificationConfig,
    clock: SharedClock,
    entries: Mutex<VecDeque<Notification>>,
}

impl NotificationLog {
    fn entries(&self) -> MutexGuard<'_, VecDeque<Notification>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("Notification log lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Build the notification for an event, or `None` for kinds that are not
    /// user-facing
    fn compose(&self, event: &Event) -> Option<Notification> {
        let (severity, title, message) = match &event.payload {
            EventPayload::SlaWarning(w) => (
                Severity::Warning,
                "SLA Warning",
                format!(
                    "Issue {} approaching limit in {} ({:.0}%)",
                    w.issue_id,
                    w.stage,
                    w.percent * 100.0
                ),
            ),
            EventPayload::SlaBreach(b) => (
                Severity::Error,
                "SLA Breach",
                format!("Issue {} breached SLA in {}", b.issue_id, b.stage),
            ),
            EventPayload::IssueCreated(issue) => (
                Severity::Info,
                "New Issue",
                format!("Issue {}: {}", issue.id, truncate(&issue.title, 200)),
            ),
            EventPayload::AgentError(failure) => (
                Severity::Error,
                "Agent Error",
                format!(
                    "{} failed: {}\n{}",
                    failure.agent,
                    truncate(&failure.context, 100),
                    truncate(&failure.error, 300)
                ),
            ),
            _ => return None,
        };

        Some(Notification {
            id: format!("notif-{}", uuid::Uuid::new_v4()),
            severity,
            title: title.to_string(),
            message,
            timestamp: self.clock.utc(),
        })
    }

    fn push(&self, notification: Notification) {
        let mut entries = self.entries();
        entries.push_front(notification);
        while entries.len() > self.config.capacity {
            entries.pop_back();
        }
    }
}

pub struct NotificationAgent {
    ctx: AgentContext,
    log: Arc<NotificationLog>,
}

impl NotificationAgent {
    pub fn new(bus: rms_core::EventBus, config: NotificationConfig, clock: SharedClock) -> Self {
        Self {
            ctx: AgentContext::new(AgentKind::Notification.to_string(), bus),
            log: Arc::new(NotificationLog {
                config,
                clock,
                entries: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Newest `limit` notifications, newest first
    pub fn notifications(&self, limit: usize) -> Vec<Notification> {
        self.log.entries().iter().take(limit).cloned().collect()
    }

    /// Newest notifications up to the configured default limit
    pub fn recent(&self) -> Vec<Notification> {
        self.notifications(self.log.config.default_limit)
    }

    pub fn len(&self) -> usize {
        self.log.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.entries().is_empty()
    }
}

#[async_trait]
impl Agent for NotificationAgent {
    fn name(&self) -> &str {
        self.ctx.name()
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Notification
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        if self.ctx.subscription_count() > 0 {
            warn!("[{}] already initialized", self.ctx.name());
            return Ok(());
        }
        info!(
            "[{}] Initializing (capacity: {})",
            self.ctx.name(),
            self.log.config.capacity
        );

        for kind in [
            EventKind::SlaWarning,
            EventKind::SlaBreach,
            EventKind::IssueCreated,
            EventKind::AgentError,
        ] {
            let log = self.log.clone();
            let bus = self.ctx.bus().clone();
            let name = self.ctx.name().to_string();
            self.ctx.subscribe(kind, move |event: &Event| {
                let Some(notification) = log.compose(event) else {
                    return Ok(());
                };
                debug!(
                    "[{}] {} notification: {}",
                    name, notification.severity, notification.title
                );
                log.push(notification.clone());

                bus.publish(
                    EventPayload::AgentResult(AgentResult {
                        agent: name.clone(),
                        action: "notification".to_string(),
                        notification,
                    }),
                    &name,
                    event.correlation_id.clone(),
                );
                Ok(())
            });
        }
        Ok(())
    }

    fn destroy(&self) {
        self.ctx.release();
    }
}

/// Truncate a string to at most `max_len` bytes on a char boundary
fn truncate(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        s
    } else {
        let mut end = max_len;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
