//! Issue store port
//!
//! The agents never own persistence. When one of them needs to write an issue
//! it goes through [`IssueStore`], whose `update` uses optimistic locking: the
//! caller states the version it read, and the write fails if someone else got
//! there first.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::clock::SharedClock;
use crate::event::Priority;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: Option<String>,
    pub priority: Priority,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when an issue is first stored
#[derive(Debug, Clone, PartialEq)]
pub struct IssueDraft {
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
}

/// Partial update; `None` leaves the field unchanged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("issue {0} not found")]
    NotFound(String),

    #[error("issue {0} already exists")]
    AlreadyExists(String),

    #[error("optimistic lock failed for {id}: expected version {expected}, found {actual}")]
    VersionConflict { id: String, expected: u64, actual: u64 },
}

#[async_trait]
pub trait IssueStore: Send + Sync {
    async fn create(&self, draft: IssueDraft) -> Result<IssueRecord, StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<IssueRecord>, StoreError>;

    /// Apply `patch` if the stored version still equals `expected_version`.
    /// A successful update bumps the version by one.
    async fn update(
        &self,
        id: &str,
        patch: IssuePatch,
        expected_version: u64,
    ) -> Result<IssueRecord, StoreError>;
}

/// In-process store backed by a map
pub struct MemoryIssueStore {
    issues: RwLock<HashMap<String, IssueRecord>>,
    clock: SharedClock,
}

impl MemoryIssueStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            issues: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.issues.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.issues.read().await.is_empty()
    }
}

#[async_trait]
impl IssueStore for MemoryIssueStore {
    async fn create(&self, draft: IssueDraft) -> Result<IssueRecord, StoreError> {
        let mut issues = self.issues.write().await;
        if issues.contains_key(&draft.id) {
            return Err(StoreError::AlreadyExists(draft.id));
        }
        let now = self.clock.utc();
        let record = IssueRecord {
            id: draft.id,
            title: draft.title,
            description: draft.description,
            category: None,
            priority: draft.priority,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        issues.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<IssueRecord>, StoreError> {
        Ok(self.issues.read().await.get(id).cloned())
    }

    async fn update(
        &self,
        id: &str,
        patch: IssuePatch,
        expected_version: u64,
    ) -> Result<IssueRecord, StoreError> {
        let mut issues = self.issues.write().await;
        let record = issues
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if record.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                actual: record.version,
            });
        }

        if let Some(title) = patch.title {
            record.title = title;
        }
        if let Some(description) = patch.description {
            record.description = description;
        }
        if let Some(category) = patch.category {
            record.category = Some(category);
        }
        if let Some(priority) = patch.priority {
            record.priority = priority;
        }
        record.version += 1;
        record.updated_at = self.clock.utc();

        Ok(record.clone())
    }
}
