//! Agent configuration
//!
//! These tables are fixed at construction time; nothing in the agents changes
//! them at runtime. Every field has a serde default so a config file only
//! needs to mention what it overrides.

use std::collections::HashSet;

use rms_core::Priority;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("stage '{stage}': warning threshold {value} must be within (0, 1]")]
    InvalidThreshold { stage: String, value: f64 },

    #[error("stage '{0}': max duration must be greater than zero")]
    ZeroDuration(String),

    #[error("stage '{0}' is configured more than once")]
    DuplicateStage(String),

    #[error("workflow scan interval must be greater than zero")]
    ZeroScanInterval,

    #[error("workflow scan interval of {0}s exceeds the maximum of {max}s", max = MAX_SCAN_INTERVAL_SECS)]
    ScanIntervalTooLong(u64),

    #[error("classifier rule #{0} has no keywords")]
    EmptyRule(usize),

    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),

    #[error("pattern miner: {0}")]
    InvalidLearner(String),
}

// ── Workflow / SLA ──────────────────────────────────────────────

/// Maximum residency for one workflow stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSla {
    pub stage: String,
    pub max_duration_ms: u64,
    /// Fraction of `max_duration_ms` at which a warning is raised
    pub warning_threshold: f64,
}

impl StageSla {
    pub fn new(stage: impl Into<String>, max_duration_ms: u64, warning_threshold: f64) -> Self {
        Self {
            stage: stage.into(),
            max_duration_ms,
            warning_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Stage every newly created issue starts in
    #[serde(default = "default_initial_stage")]
    pub initial_stage: String,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Emit each threshold level once per stage residency instead of on
    /// every scan
    #[serde(default)]
    pub suppress_repeat_alerts: bool,
    /// Stages without an entry are never escalated
    #[serde(default = "default_stages")]
    pub stages: Vec<StageSla>,
}

const HOUR_MS: u64 = 60 * 60 * 1000;

fn default_initial_stage() -> String {
    "new".to_string()
}

fn default_scan_interval_secs() -> u64 {
    5 * 60
}

/// Longest accepted SLA scan interval (one day)
pub const MAX_SCAN_INTERVAL_SECS: u64 = 24 * 60 * 60;

fn default_stages() -> Vec<StageSla> {
    vec![
        StageSla::new("new", 24 * HOUR_MS, 0.75),
        StageSla::new("in-progress", 7 * 24 * HOUR_MS, 0.8),
    ]
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            initial_stage: default_initial_stage(),
            scan_interval_secs: default_scan_interval_secs(),
            suppress_repeat_alerts: false,
            stages: default_stages(),
        }
    }
}

impl WorkflowConfig {
    pub fn sla_for(&self, stage: &str) -> Option<&StageSla> {
        self.stages.iter().find(|sla| sla.stage == stage)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_interval_secs == 0 {
            return Err(ConfigError::ZeroScanInterval);
        }
        if self.scan_interval_secs > MAX_SCAN_INTERVAL_SECS {
            return Err(ConfigError::ScanIntervalTooLong(self.scan_interval_secs));
        }
        let mut seen = HashSet::new();
        for sla in &self.stages {
            if !seen.insert(sla.stage.as_str()) {
                return Err(ConfigError::DuplicateStage(sla.stage.clone()));
            }
            if sla.max_duration_ms == 0 {
                return Err(ConfigError::ZeroDuration(sla.stage.clone()));
            }
            if !(sla.warning_threshold > 0.0 && sla.warning_threshold <= 1.0) {
                return Err(ConfigError::InvalidThreshold {
                    stage: sla.stage.clone(),
                    value: sla.warning_threshold,
                });
            }
        }
        Ok(())
    }
}

// ── Classifier ──────────────────────────────────────────────────

/// Category and priority assigned to an issue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    pub priority: Priority,
}

/// Any keyword found in the issue text selects this rule's classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub keywords: Vec<String>,
    pub category: String,
    pub priority: Priority,
}

impl KeywordRule {
    pub fn new(keywords: &[&str], category: &str, priority: Priority) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            category: category.to_string(),
            priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Evaluated in order; the first rule with a matching keyword wins
    #[serde(default = "default_rules")]
    pub rules: Vec<KeywordRule>,
    /// Applied when no rule matches. Without it unmatched issues are left alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Classification>,
}

fn default_rules() -> Vec<KeywordRule> {
    vec![
        KeywordRule::new(&["crash", "error", "bug", "broken"], "bug", Priority::High),
        KeywordRule::new(&["feature", "enhance", "add", "support"], "feature", Priority::Medium),
        KeywordRule::new(&["slow", "performance", "timeout"], "performance", Priority::High),
        KeywordRule::new(&["security", "vulnerability", "auth"], "security", Priority::Critical),
    ]
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            fallback: None,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.keywords.iter().all(|k| k.trim().is_empty()) {
                return Err(ConfigError::EmptyRule(index));
            }
        }
        Ok(())
    }
}

// ── Pattern miner ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerConfig {
    /// Events kept in the history ring
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Most recent events counted when looking for patterns
    #[serde(default = "default_window")]
    pub window: usize,
    /// Occurrences of one kind inside the window that make a pattern
    #[serde(default = "default_min_occurrences")]
    pub min_occurrences: usize,
    #[serde(default = "default_initial_confidence")]
    pub initial_confidence: f64,
    #[serde(default = "default_confidence_step")]
    pub confidence_step: f64,
    #[serde(default = "default_max_confidence")]
    pub max_confidence: f64,
}

fn default_history_capacity() -> usize {
    1000
}
fn default_window() -> usize {
    100
}
fn default_min_occurrences() -> usize {
    10
}
fn default_initial_confidence() -> f64 {
    0.6
}
fn default_confidence_step() -> f64 {
    0.05
}
fn default_max_confidence() -> f64 {
    0.95
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            window: default_window(),
            min_occurrences: default_min_occurrences(),
            initial_confidence: default_initial_confidence(),
            confidence_step: default_confidence_step(),
            max_confidence: default_max_confidence(),
        }
    }
}

impl LearnerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("learner.history_capacity"));
        }
        if self.window == 0 || self.window > self.history_capacity {
            return Err(ConfigError::InvalidLearner(format!(
                "window {} must be between 1 and history_capacity {}",
                self.window, self.history_capacity
            )));
        }
        if self.min_occurrences == 0 {
            return Err(ConfigError::ZeroCapacity("learner.min_occurrences"));
        }
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.initial_confidence) || !in_unit(self.max_confidence) {
            return Err(ConfigError::InvalidLearner(
                "confidence values must be within [0, 1]".to_string(),
            ));
        }
        if self.initial_confidence > self.max_confidence {
            return Err(ConfigError::InvalidLearner(format!(
                "initial_confidence {} exceeds max_confidence {}",
                self.initial_confidence, self.max_confidence
            )));
        }
        if self.confidence_step < 0.0 {
            return Err(ConfigError::InvalidLearner(
                "confidence_step must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Notifications ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Notifications kept before the oldest is dropped
    #[serde(default = "default_notification_capacity")]
    pub capacity: usize,
    /// How many entries `recent()` returns
    #[serde(default = "default_notification_limit")]
    pub default_limit: usize,
}

fn default_notification_capacity() -> usize {
    100
}
fn default_notification_limit() -> usize {
    50
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            capacity: default_notification_capacity(),
            default_limit: default_notification_limit(),
        }
    }
}

impl NotificationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity("notifications.capacity"));
        }
        Ok(())
    }
}

/// Configuration for the whole agent set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub learner: LearnerConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl AgentsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.workflow.validate()?;
        self.classifier.validate()?;
        self.learner.validate()?;
        self.notifications.validate()
    }
}
