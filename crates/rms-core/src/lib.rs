//! rms-core - Coordination substrate for the RMS issue tracker
//!
//! This crate provides:
//! - The closed set of domain events and their payloads
//! - An in-process event bus with ordered, best-effort dispatch
//! - The agent runtime contract shared by every agent
//! - An injectable clock so time-driven behaviour can be tested
//! - The issue store port agents use to persist their decisions

pub mod agent;
pub mod bus;
pub mod clock;
pub mod event;
pub mod store;

// Re-export main types for convenience
pub use agent::{Agent, AgentContext, AgentKind};
pub use bus::{EventBus, Handler, Subscription};
pub use clock::{ManualClock, SharedClock, system_clock};
pub use event::{
    AgentError, AgentResult, AgentTask, Event, EventKind, EventPayload, IssueCreated,
    IssueDeleted, IssueUpdated, Notification, ParseEventKindError, Priority, Severity, SlaBreach,
    SlaWarning, Topic, WorkflowTransition,
};
pub use store::{IssueDraft, IssuePatch, IssueRecord, IssueStore, MemoryIssueStore, StoreError};
