//! Pattern miner
//!
//! Watches every event on the bus and keeps a bounded history of them. After
//! each event the most recent window is recounted by kind, and any kind that
//! shows up often enough becomes (or reinforces) a frequency pattern.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rms_core::{Agent, AgentContext, AgentKind, Event, EventBus, EventKind, Topic};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LearnerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Frequency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub kind: PatternKind,
    pub description: String,
    pub confidence: f64,
    /// Count inside the window when the pattern was last recomputed
    pub occurrences: usize,
}

#[derive(Default)]
struct MinerState {
    /// Newest first
    history: VecDeque<Arc<Event>>,
    patterns: HashMap<String, Pattern>,
}

struct Miner {
    config: LearnerConfig,
    state: Mutex<MinerState>,
}

impl Miner {
    fn state(&self) -> MutexGuard<'_, MinerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Pattern miner state lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn observe(&self, event: &Event) {
        let mut state = self.state();
        state.history.push_front(Arc::new(event.clone()));
        state.history.truncate(self.config.history_capacity);
        self.recompute(&mut state);
    }

    fn recompute(&self, state: &mut MinerState) {
        let mut counts: HashMap<EventKind, usize> = HashMap::new();
        for event in state.history.iter().take(self.config.window) {
            *counts.entry(event.kind()).or_default() += 1;
        }

        for (kind, count) in counts {
            if count < self.config.min_occurrences {
                continue;
            }
            let id = format!("pattern-{}", kind);
            match state.patterns.get_mut(&id) {
                Some(pattern) => {
                    pattern.confidence = (pattern.confidence + self.config.confidence_step)
                        .min(self.config.max_confidence);
                    pattern.occurrences = count;
                }
                None => {
                    debug!("New frequency pattern: {} ({} occurrences)", kind, count);
                    state.patterns.insert(
                        id.clone(),
                        Pattern {
                            id,
                            kind: PatternKind::Frequency,
                            description: format!("High frequency: {}", kind),
                            confidence: self.config.initial_confidence,
                            occurrences: count,
                        },
                    );
                }
            }
        }
    }
}

pub struct PatternMiner {
    ctx: AgentContext,
    miner: Arc<Miner>,
}

impl PatternMiner {
    pub fn new(bus: EventBus, config: LearnerConfig) -> Self {
        Self {
            ctx: AgentContext::new(AgentKind::PatternMiner.to_string(), bus),
            miner: Arc::new(Miner {
                config,
                state: Mutex::new(MinerState::default()),
            }),
        }
    }

    /// Patterns at or above `min_confidence`, most confident first
    pub fn get_patterns(&self, min_confidence: f64) -> Vec<Pattern> {
        let mut patterns: Vec<Pattern> = self
            .miner
            .state()
            .patterns
            .values()
            .filter(|p| p.confidence >= min_confidence)
            .cloned()
            .collect();
        patterns.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.id.cmp(&b.id))
        });
        patterns
    }

    pub fn history_len(&self) -> usize {
        self.miner.state().history.len()
    }
}

#[async_trait]
impl Agent for PatternMiner {
    fn name(&self) -> &str {
        self.ctx.name()
    }

    fn kind(&self) -> AgentKind {
        AgentKind::PatternMiner
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        if self.ctx.subscription_count() > 0 {
            warn!("[{}] already initialized", self.ctx.name());
            return Ok(());
        }
        info!(
            "[{}] Initializing (history: {}, window: {})",
            self.ctx.name(),
            self.miner.config.history_capacity,
            self.miner.config.window
        );

        let miner = self.miner.clone();
        let name = self.ctx.name().to_string();
        self.ctx.subscribe(Topic::All, move |event: &Event| {
            if event.source != name {
                miner.observe(event);
            }
            Ok(())
        });
        Ok(())
    }

    fn destroy(&self) {
        self.ctx.release();
    }
}
