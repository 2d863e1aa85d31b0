//! Audit records for authorization decisions and mutations.
//!
//! The engine appends through [`AuditSink`]. A failing sink never blocks the
//! primary operation; failures are logged and counted on the engine.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::PrincipalId;

/// Result recorded on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AuditOutcome {
    /// Authorization granted.
    Allowed,
    /// Authorization evaluated to deny.
    Denied,
    /// Authorization could not be evaluated.
    Undetermined,
    /// Mutation committed.
    Success,
    /// Mutation rejected or failed.
    Failure,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Undetermined => "undetermined",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AuditEntry {
    pub id: String,
    pub actor: PrincipalId,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub detail: BTreeMap<String, String>,
}

impl AuditEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(
        actor: PrincipalId,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            actor,
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: None,
            outcome,
            reason: None,
            timestamp: Utc::now(),
            detail: BTreeMap::new(),
        }
    }

    pub fn with_resource_id(mut self, id: impl ToString) -> Self {
        self.resource_id = Some(id.to_string());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.detail.insert(key.into(), value.to_string());
        self
    }
}

/// Destination for audit entries. Schema and retention are owned by the backend.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Appends one entry.
    async fn append(&self, entry: AuditEntry) -> std::result::Result<(), StoreError>;
}

/// Sink that drops every entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAudit;

#[async_trait]
impl AuditSink for NoAudit {
    async fn append(&self, _entry: AuditEntry) -> std::result::Result<(), StoreError> {
        Ok(())
    }
}

/// Filter for [`MemoryAuditSink::query`]. Unset fields match everything.
#[derive(Debug, Clone)]
pub struct AuditQuery {
    pub actor: Option<PrincipalId>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub outcome: Option<AuditOutcome>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// 1-based page number.
    pub page: usize,
    pub per_page: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            actor: None,
            action: None,
            resource_type: None,
            resource_id: None,
            outcome: None,
            since: None,
            until: None,
            page: 1,
            per_page: 50,
        }
    }
}

impl AuditQuery {
    fn matches(&self, entry: &AuditEntry) -> bool {
        self.actor.as_ref().is_none_or(|actor| &entry.actor == actor)
            && self.action.as_ref().is_none_or(|action| &entry.action == action)
            && self
                .resource_type
                .as_ref()
                .is_none_or(|kind| &entry.resource_type == kind)
            && self
                .resource_id
                .as_ref()
                .is_none_or(|id| entry.resource_id.as_ref() == Some(id))
            && self.outcome.is_none_or(|outcome| entry.outcome == outcome)
            && self.since.is_none_or(|since| entry.timestamp >= since)
            && self.until.is_none_or(|until| entry.timestamp < until)
    }
}

/// One page of query results, newest first.
#[derive(Debug, Clone)]
pub struct AuditPage {
    pub entries: Vec<AuditEntry>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

/// Process-local audit sink for tests and demos.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent append fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of all entries in append order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .read()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Filters and pages stored entries, newest first.
    pub fn query(&self, query: &AuditQuery) -> AuditPage {
        let page = query.page.max(1);
        let per_page = query.per_page.max(1);
        let matching: Vec<AuditEntry> = self
            .entries()
            .into_iter()
            .rev()
            .filter(|entry| query.matches(entry))
            .collect();
        let total = matching.len();
        let entries = matching
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();
        AuditPage {
            entries,
            total,
            page,
            per_page,
        }
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, entry: AuditEntry) -> std::result::Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err("audit backend unavailable".into());
        }
        self.entries
            .write()
            .map_err(|_| StoreError::from("audit sink lock poisoned"))?
            .push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn actor(value: &str) -> PrincipalId {
        PrincipalId::try_from(value).unwrap()
    }

    #[test]
    fn query_past_the_end_is_an_empty_page() {
        let sink = MemoryAuditSink::new();
        for _ in 0..3 {
            let entry = AuditEntry::new(actor("admin"), "role.create", "role", AuditOutcome::Success);
            block_on(sink.append(entry)).unwrap();
        }

        let page = sink.query(&AuditQuery {
            page: usize::MAX,
            per_page: usize::MAX,
            ..AuditQuery::default()
        });
        assert_eq!(page.total, 3);
        assert!(page.entries.is_empty());

        let page = sink.query(&AuditQuery {
            page: 0,
            per_page: 0,
            ..AuditQuery::default()
        });
        assert_eq!((page.page, page.per_page), (1, 1));
        assert_eq!(page.entries.len(), 1);
    }

    #[test]
    fn query_filters_and_pages_newest_first() {
        let sink = MemoryAuditSink::new();
        for index in 0..5 {
            let entry = AuditEntry::new(actor("admin"), "role.create", "role", AuditOutcome::Success)
                .with_resource_id(format!("r{index}"));
            block_on(sink.append(entry)).unwrap();
        }
        let denied = AuditEntry::new(actor("u1"), "access_denied", "users", AuditOutcome::Denied)
            .with_reason("no applicable grants");
        block_on(sink.append(denied)).unwrap();

        let page = sink.query(&AuditQuery {
            action: Some("role.create".to_string()),
            per_page: 2,
            page: 1,
            ..AuditQuery::default()
        });
        assert_eq!(page.total, 5);
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].resource_id.as_deref(), Some("r4"));

        let denials = sink.query(&AuditQuery {
            outcome: Some(AuditOutcome::Denied),
            ..AuditQuery::default()
        });
        assert_eq!(denials.total, 1);
        assert_eq!(denials.entries[0].actor, actor("u1"));
    }

    #[test]
    fn failing_sink_rejects_appends() {
        let sink = MemoryAuditSink::new();
        sink.set_failing(true);
        let entry = AuditEntry::new(actor("admin"), "role.create", "role", AuditOutcome::Success);
        assert!(block_on(sink.append(entry)).is_err());
        assert!(sink.entries().is_empty());
    }
}
