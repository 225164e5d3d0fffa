//! Domain events carried by the bus
//!
//! Every event kind has exactly one payload shape. The kind of an [`Event`] is
//! derived from its payload, so a handler matching on [`EventPayload`] never
//! needs to cast.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of domain event names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "issue:created")]
    IssueCreated,
    #[serde(rename = "issue:updated")]
    IssueUpdated,
    #[serde(rename = "issue:deleted")]
    IssueDeleted,
    #[serde(rename = "workflow:transition")]
    WorkflowTransition,
    #[serde(rename = "workflow:sla_warning")]
    SlaWarning,
    #[serde(rename = "workflow:sla_breach")]
    SlaBreach,
    #[serde(rename = "agent:task")]
    AgentTask,
    #[serde(rename = "agent:result")]
    AgentResult,
    #[serde(rename = "agent:error")]
    AgentError,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        Self::IssueCreated,
        Self::IssueUpdated,
        Self::IssueDeleted,
        Self::WorkflowTransition,
        Self::SlaWarning,
        Self::SlaBreach,
        Self::AgentTask,
        Self::AgentResult,
        Self::AgentError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IssueCreated => "issue:created",
            Self::IssueUpdated => "issue:updated",
            Self::IssueDeleted => "issue:deleted",
            Self::WorkflowTransition => "workflow:transition",
            Self::SlaWarning => "workflow:sla_warning",
            Self::SlaBreach => "workflow:sla_breach",
            Self::AgentTask => "agent:task",
            Self::AgentResult => "agent:result",
            Self::AgentError => "agent:error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known event kind
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event kind: {0}")]
pub struct ParseEventKindError(pub String);

impl FromStr for EventKind {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseEventKindError(s.to_string()))
    }
}

/// What a handler subscribes to: one event kind, or every kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Kind(EventKind),
    All,
}

impl From<EventKind> for Topic {
    fn from(kind: EventKind) -> Self {
        Self::Kind(kind)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kind(kind) => kind.fmt(f),
            Self::All => f.write_str("*"),
        }
    }
}

/// Issue priority, most urgent first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueCreated {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueUpdated {
    pub id: String,
    pub category: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueDeleted {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTransition {
    pub issue_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_stage: Option<String>,
    pub to_stage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaWarning {
    pub issue_id: String,
    pub stage: String,
    /// Fraction of the stage's maximum duration already used
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaBreach {
    pub issue_id: String,
    pub stage: String,
    pub elapsed_ms: i64,
}

/// Work handed to the transport layer (or whoever executes tasks)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentTask {
    /// Raised by the orchestrator when an issue breaches its SLA
    Escalate { priority: Priority, issue: SlaBreach },
    /// Externally initiated work fanned out by the orchestrator
    Coordinate {
        task_type: String,
        #[serde(default)]
        payload: serde_json::Value,
        coordinator: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A user-facing notice produced by the notification agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: String,
    pub action: String,
    pub notification: Notification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentError {
    pub agent: String,
    pub context: String,
    pub error: String,
}

/// Payload of an event, one variant per [`EventKind`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum EventPayload {
    #[serde(rename = "issue:created")]
    IssueCreated(IssueCreated),
    #[serde(rename = "issue:updated")]
    IssueUpdated(IssueUpdated),
    #[serde(rename = "issue:deleted")]
    IssueDeleted(IssueDeleted),
    #[serde(rename = "workflow:transition")]
    WorkflowTransition(WorkflowTransition),
    #[serde(rename = "workflow:sla_warning")]
    SlaWarning(SlaWarning),
    #[serde(rename = "workflow:sla_breach")]
    SlaBreach(SlaBreach),
    #[serde(rename = "agent:task")]
    AgentTask(AgentTask),
    #[serde(rename = "agent:result")]
    AgentResult(AgentResult),
    #[serde(rename = "agent:error")]
    AgentError(AgentError),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::IssueCreated(_) => EventKind::IssueCreated,
            Self::IssueUpdated(_) => EventKind::IssueUpdated,
            Self::IssueDeleted(_) => EventKind::IssueDeleted,
            Self::WorkflowTransition(_) => EventKind::WorkflowTransition,
            Self::SlaWarning(_) => EventKind::SlaWarning,
            Self::SlaBreach(_) => EventKind::SlaBreach,
            Self::AgentTask(_) => EventKind::AgentTask,
            Self::AgentResult(_) => EventKind::AgentResult,
            Self::AgentError(_) => EventKind::AgentError,
        }
    }
}

/// An immutable, published event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub payload: EventPayload,
    /// Name of the agent or producer that published the event
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}
