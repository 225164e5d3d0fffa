//! Workflow enforcer — per-issue stage tracking and SLA deadline scanning
//!
//! The enforcer keeps its own mirror of which stage each issue is in and when
//! it got there. A ticker, independent of any event, scans the mirror and
//! publishes `workflow:sla_warning` or `workflow:sla_breach` for every issue
//! past a threshold of its stage's SLA.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rms_core::{
    Agent, AgentContext, AgentKind, Event, EventBus, EventKind, EventPayload, Priority,
    SharedClock, SlaBreach, SlaWarning,
};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkflowConfig;

/// How far past its SLA an issue is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlaLevel {
    Warning,
    Breach,
}

/// The enforcer's view of one issue
#[derive(Debug, Clone, PartialEq)]
pub struct IssueState {
    pub issue_id: String,
    pub stage: String,
    pub stage_entered_at: DateTime<Utc>,
    pub priority: Priority,
    /// Highest level already reported for the current stage
    pub alerted: Option<SlaLevel>,
}

/// Priority updates held for issues not yet tracked
const MAX_PENDING_UPDATES: usize = 64;

#[derive(Default)]
struct Mirror {
    issues: BTreeMap<String, IssueState>,
    /// An `issue:updated` can be dispatched before the `issue:created` that
    /// caused it reaches us. Oldest first.
    pending: VecDeque<(String, Priority)>,
}

impl Mirror {
    fn hold(&mut self, issue_id: &str, priority: Priority) {
        self.pending.retain(|(id, _)| id != issue_id);
        self.pending.push_back((issue_id.to_string(), priority));
        while self.pending.len() > MAX_PENDING_UPDATES {
            self.pending.pop_front();
        }
    }

    fn take_pending(&mut self, issue_id: &str) -> Option<Priority> {
        let index = self.pending.iter().position(|(id, _)| id == issue_id)?;
        self.pending.remove(index).map(|(_, priority)| priority)
    }
}

/// Stage mirror plus the SLA rules applied to it
struct StageTracker {
    config: WorkflowConfig,
    clock: SharedClock,
    mirror: Mutex<Mirror>,
}

impl StageTracker {
    fn mirror(&self) -> MutexGuard<'_, Mirror> {
        self.mirror.lock().unwrap_or_else(|poisoned| {
            warn!("Workflow issue map lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn apply(&self, event: &Event) {
        let now = self.clock.utc();
        let mut mirror = self.mirror();
        match &event.payload {
            EventPayload::IssueCreated(issue) => {
                let priority = mirror
                    .take_pending(&issue.id)
                    .or(issue.priority)
                    .unwrap_or_default();
                mirror.issues.insert(
                    issue.id.clone(),
                    IssueState {
                        issue_id: issue.id.clone(),
                        stage: self.config.initial_stage.clone(),
                        stage_entered_at: now,
                        priority,
                        alerted: None,
                    },
                );
                debug!("Tracking {} in stage {}", issue.id, self.config.initial_stage);
            }
            EventPayload::WorkflowTransition(transition) => {
                match mirror.issues.get_mut(&transition.issue_id) {
                    Some(state) => {
                        debug!(
                            "{} moved {} -> {}",
                            transition.issue_id, state.stage, transition.to_stage
                        );
                        state.stage = transition.to_stage.clone();
                        state.stage_entered_at = now;
                        state.alerted = None;
                    }
                    None => debug!("Ignoring transition for untracked issue {}", transition.issue_id),
                }
            }
            EventPayload::IssueUpdated(update) => match mirror.issues.get_mut(&update.id) {
                Some(state) => state.priority = update.priority,
                None => {
                    debug!("Holding priority update for untracked issue {}", update.id);
                    mirror.hold(&update.id, update.priority);
                }
            },
            EventPayload::IssueDeleted(deleted) => {
                mirror.take_pending(&deleted.id);
                if mirror.issues.remove(&deleted.id).is_some() {
                    debug!("Stopped tracking deleted issue {}", deleted.id);
                }
            }
            EventPayload::SlaWarning(_)
            | EventPayload::SlaBreach(_)
            | EventPayload::AgentTask(_)
            | EventPayload::AgentResult(_)
            | EventPayload::AgentError(_) => {}
        }
    }

    /// Evaluate every tracked issue against its stage SLA
    fn scan(&self) -> Vec<EventPayload> {
        let now = self.clock.utc();
        let mut mirror = self.mirror();
        let mut alerts = Vec::new();

        for state in mirror.issues.values_mut() {
            let Some(sla) = self.config.sla_for(&state.stage) else {
                continue;
            };
            let elapsed = now - state.stage_entered_at;
            let percent = elapsed.num_milliseconds() as f64 / sla.max_duration_ms as f64;

            let level = if percent >= 1.0 {
                SlaLevel::Breach
            } else if percent >= sla.warning_threshold {
                SlaLevel::Warning
            } else {
                continue;
            };

            if self.config.suppress_repeat_alerts && state.alerted == Some(level) {
                continue;
            }
            state.alerted = Some(level);

            alerts.push(match level {
                SlaLevel::Breach => EventPayload::SlaBreach(SlaBreach {
                    issue_id: state.issue_id.clone(),
                    stage: state.stage.clone(),
                    elapsed_ms: elapsed.num_milliseconds(),
                }),
                SlaLevel::Warning => EventPayload::SlaWarning(SlaWarning {
                    issue_id: state.issue_id.clone(),
                    stage: state.stage.clone(),
                    percent,
                }),
            });
        }

        alerts
    }
}

fn publish_alerts(tracker: &StageTracker, bus: &EventBus, source: &str) -> usize {
    // Scan under the lock, publish after releasing it.
    let alerts = tracker.scan();
    let count = alerts.len();
    for alert in alerts {
        bus.publish(alert, source, None);
    }
    count
}

pub struct WorkflowEnforcer {
    ctx: AgentContext,
    tracker: Arc<StageTracker>,
    ticker: Mutex<Option<CancellationToken>>,
}

impl WorkflowEnforcer {
    pub fn new(bus: EventBus, config: WorkflowConfig, clock: SharedClock) -> Self {
        Self {
            ctx: AgentContext::new(AgentKind::WorkflowEnforcer.to_string(), bus),
            tracker: Arc::new(StageTracker {
                config,
                clock,
                mirror: Mutex::new(Mirror::default()),
            }),
            ticker: Mutex::new(None),
        }
    }

    fn ticker(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.ticker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one SLA scan now. Returns the number of events published.
    pub fn check_slas(&self) -> usize {
        publish_alerts(&self.tracker, self.ctx.bus(), self.ctx.name())
    }

    pub fn tracked(&self, issue_id: &str) -> Option<IssueState> {
        self.tracker.mirror().issues.get(issue_id).cloned()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracker.mirror().issues.len()
    }

    pub fn is_ticking(&self) -> bool {
        self.ticker().is_some()
    }

    fn start_ticker(&self) -> anyhow::Result<CancellationToken> {
        let period = Duration::from_secs(self.tracker.config.scan_interval_secs);
        let first_tick = Instant::now().checked_add(period).ok_or_else(|| {
            anyhow::anyhow!(
                "SLA scan interval of {}s is out of range",
                self.tracker.config.scan_interval_secs
            )
        })?;
        let mut interval = tokio::time::interval_at(first_tick, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let token = CancellationToken::new();
        let cancel = token.clone();
        let tracker = self.tracker.clone();
        let bus = self.ctx.bus().clone();
        let name = self.ctx.name().to_string();

        tokio::spawn(async move {
            debug!("SLA ticker started with interval {}s", period.as_secs());

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("SLA ticker cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        let emitted = publish_alerts(&tracker, &bus, &name);
                        if emitted > 0 {
                            info!("SLA scan emitted {} alerts", emitted);
                        }
                    }
                }
            }
        });

        Ok(token)
    }
}

#[async_trait]
impl Agent for WorkflowEnforcer {
    fn name(&self) -> &str {
        self.ctx.name()
    }

    fn kind(&self) -> AgentKind {
        AgentKind::WorkflowEnforcer
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        let mut ticker = self.ticker();
        if ticker.is_some() {
            warn!("[{}] already initialized", self.ctx.name());
            return Ok(());
        }
        info!(
            "[{}] Initializing with {} stage SLAs",
            self.ctx.name(),
            self.tracker.config.stages.len()
        );
        let token = self.start_ticker()?;

        for kind in [
            EventKind::IssueCreated,
            EventKind::WorkflowTransition,
            EventKind::IssueUpdated,
            EventKind::IssueDeleted,
        ] {
            let tracker = self.tracker.clone();
            self.ctx.subscribe(kind, move |event: &Event| {
                tracker.apply(event);
                Ok(())
            });
        }

        *ticker = Some(token);
        Ok(())
    }

    fn destroy(&self) {
        if let Some(token) = self.ticker().take() {
            token.cancel();
        }
        self.ctx.release();
    }
}
