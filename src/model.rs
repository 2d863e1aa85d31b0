//! Persisted entities.
//!
//! Every entity is soft-deleted: removal flips `is_active` and stamps
//! `deleted_at`, so audit records keep resolvable references.

use crate::error::{Error, Result};
use crate::permission::Permission;
use crate::types::{GroupId, OrganizationId, PermissionId, PrincipalId, PrincipalType, RoleId};
use chrono::{DateTime, Utc};
use std::fmt;

/// Activity flag plus audit timestamps shared by all entities.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Lifecycle {
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Lifecycle {
    /// Active record created at `now`.
    pub fn created(now: DateTime<Utc>) -> Self {
        Self {
            is_active: true,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Active and not soft-deleted.
    pub fn is_live(&self) -> bool {
        self.is_active && self.deleted_at.is_none()
    }

    /// Marks the record inactive without deleting it.
    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.is_active = false;
        self.updated_at = now;
    }

    /// Soft-deletes the record.
    pub fn soft_delete(&mut self, now: DateTime<Utc>) {
        self.is_active = false;
        self.deleted_at = Some(now);
        self.updated_at = now;
    }

    /// Brings a soft-deleted or inactive record back.
    pub fn reactivate(&mut self, now: DateTime<Utc>) {
        self.is_active = true;
        self.deleted_at = None;
        self.updated_at = now;
    }
}

/// Optional half-open validity window `[starts_at, ends_at)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeWindow {
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// Open-ended window, always effective.
    pub fn always() -> Self {
        Self::default()
    }

    /// Creates a window, rejecting `ends_at <= starts_at`.
    pub fn new(starts_at: Option<DateTime<Utc>>, ends_at: Option<DateTime<Utc>>) -> Result<Self> {
        if let (Some(start), Some(end)) = (starts_at, ends_at)
            && end <= start
        {
            return Err(Error::Validation(format!(
                "window end {end} must be after start {start}"
            )));
        }
        Ok(Self { starts_at, ends_at })
    }

    /// Window effective from `at` onwards.
    pub fn starting(at: DateTime<Utc>) -> Self {
        Self {
            starts_at: Some(at),
            ends_at: None,
        }
    }

    /// Window effective until (excluding) `at`.
    pub fn until(at: DateTime<Utc>) -> Self {
        Self {
            starts_at: None,
            ends_at: Some(at),
        }
    }

    /// Whether `now` falls inside the window. `starts_at` is inclusive,
    /// `ends_at` exclusive.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.starts_at.is_none_or(|start| now >= start) && self.ends_at.is_none_or(|end| now < end)
    }

    /// Earliest boundary strictly after `now`, where effectiveness flips.
    pub fn next_boundary_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        [self.starts_at, self.ends_at]
            .into_iter()
            .flatten()
            .filter(|boundary| *boundary > now)
            .min()
    }
}

/// Applicability boundary of a role.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum RoleScope {
    /// Applies in every organization.
    Global,
    /// Applies inside one organization.
    Organization(OrganizationId),
    /// Applies inside one group (and groups beneath it).
    Group {
        organization: OrganizationId,
        group: GroupId,
    },
}

impl RoleScope {
    /// Lowercase scope name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Organization(_) => "organization",
            Self::Group { .. } => "group",
        }
    }

    /// Organization bound by this scope, if any.
    pub fn organization(&self) -> Option<&OrganizationId> {
        match self {
            Self::Global => None,
            Self::Organization(organization) => Some(organization),
            Self::Group { organization, .. } => Some(organization),
        }
    }

    /// Group bound by this scope, if any.
    pub fn group(&self) -> Option<&GroupId> {
        match self {
            Self::Group { group, .. } => Some(group),
            _ => None,
        }
    }
}

impl fmt::Display for RoleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Organization(organization) => write!(f, "organization {organization}"),
            Self::Group { group, .. } => write!(f, "group {group}"),
        }
    }
}

/// Organization tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    pub org_type: String,
    pub parent_id: Option<OrganizationId>,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub lifecycle: Lifecycle,
}

impl Organization {
    /// New active organization with a generated id.
    pub fn new(
        name: impl Into<String>,
        org_type: impl Into<String>,
        parent_id: Option<OrganizationId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OrganizationId::generate(),
            name: name.into(),
            org_type: org_type.into(),
            parent_id,
            lifecycle: Lifecycle::created(now),
        }
    }

    /// Replaces the generated id.
    pub fn with_id(mut self, id: OrganizationId) -> Self {
        self.id = id;
        self
    }

    pub fn is_live(&self) -> bool {
        self.lifecycle.is_live()
    }
}

/// Group inside exactly one organization.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Group {
    pub id: GroupId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub parent_id: Option<GroupId>,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub lifecycle: Lifecycle,
}

impl Group {
    /// New active group with a generated id.
    pub fn new(
        organization_id: OrganizationId,
        name: impl Into<String>,
        parent_id: Option<GroupId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: GroupId::generate(),
            organization_id,
            name: name.into(),
            parent_id,
            lifecycle: Lifecycle::created(now),
        }
    }

    /// Replaces the generated id.
    pub fn with_id(mut self, id: GroupId) -> Self {
        self.id = id;
        self
    }

    pub fn is_live(&self) -> bool {
        self.lifecycle.is_live()
    }
}

/// Named bundle of permissions.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub scope: RoleScope,
    /// Role whose permissions this role inherits.
    pub parent_id: Option<RoleId>,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub lifecycle: Lifecycle,
}

impl Role {
    /// New active role with a generated id.
    pub fn new(name: impl Into<String>, scope: RoleScope, now: DateTime<Utc>) -> Self {
        Self {
            id: RoleId::generate(),
            name: name.into(),
            scope,
            parent_id: None,
            lifecycle: Lifecycle::created(now),
        }
    }

    /// Replaces the generated id.
    pub fn with_id(mut self, id: RoleId) -> Self {
        self.id = id;
        self
    }

    pub fn is_live(&self) -> bool {
        self.lifecycle.is_live()
    }
}

/// Persisted `(resource, action)` pair.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PermissionRecord {
    pub id: PermissionId,
    pub permission: Permission,
    pub description: Option<String>,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub lifecycle: Lifecycle,
}

impl PermissionRecord {
    /// New active permission record with a generated id.
    pub fn new(permission: Permission, now: DateTime<Utc>) -> Self {
        Self {
            id: PermissionId::generate(),
            permission,
            description: None,
            lifecycle: Lifecycle::created(now),
        }
    }

    pub fn is_live(&self) -> bool {
        self.lifecycle.is_live()
    }
}

/// Role ↔ permission link. Unique per `(role_id, permission_id)`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RolePermission {
    pub role_id: RoleId,
    pub permission_id: PermissionId,
    pub granted_by: PrincipalId,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub lifecycle: Lifecycle,
}

/// Principal ↔ group membership. Unique per `(group_id, principal_id)`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupMembership {
    pub group_id: GroupId,
    pub principal_id: PrincipalId,
    pub principal_type: PrincipalType,
    pub window: TimeWindow,
    pub added_by: PrincipalId,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub lifecycle: Lifecycle,
}

impl GroupMembership {
    /// Active and inside its window at `now`.
    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        self.lifecycle.is_live() && self.window.contains(now)
    }
}

/// Role granted to every member of a group (and of its descendants).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupRole {
    pub group_id: GroupId,
    pub role_id: RoleId,
    pub window: TimeWindow,
    pub assigned_by: PrincipalId,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub lifecycle: Lifecycle,
}

impl GroupRole {
    /// Active and inside its window at `now`.
    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        self.lifecycle.is_live() && self.window.contains(now)
    }
}

/// Direct role grant to a principal, independent of groups.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UserRole {
    pub principal_id: PrincipalId,
    pub role_id: RoleId,
    pub window: TimeWindow,
    pub assigned_by: PrincipalId,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub lifecycle: Lifecycle,
}

impl UserRole {
    /// Active and inside its window at `now`.
    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        self.lifecycle.is_live() && self.window.contains(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn window_is_half_open() {
        let now = Utc::now();

        assert!(TimeWindow::starting(now).contains(now));
        assert!(!TimeWindow::until(now).contains(now));
        assert!(TimeWindow::until(now + Duration::seconds(1)).contains(now));
        assert!(TimeWindow::always().contains(now));
    }

    #[test]
    fn window_rejects_inverted_bounds() {
        let now = Utc::now();
        let err = TimeWindow::new(Some(now), Some(now)).expect_err("empty window");
        assert!(matches!(err, Error::Validation(_)));
        assert!(TimeWindow::new(Some(now), Some(now + Duration::hours(1))).is_ok());
        assert!(TimeWindow::new(None, Some(now - Duration::hours(1))).is_ok());
    }

    #[test]
    fn next_boundary_ignores_past_bounds() {
        let now = Utc::now();
        let start = now - Duration::hours(1);
        let end = now + Duration::hours(1);
        let window = TimeWindow::new(Some(start), Some(end)).unwrap();
        assert_eq!(window.next_boundary_after(now), Some(end));
        assert_eq!(TimeWindow::until(start).next_boundary_after(now), None);
    }

    #[test]
    fn soft_delete_keeps_record_but_disables_it() {
        let now = Utc::now();
        let mut lifecycle = Lifecycle::created(now);
        lifecycle.soft_delete(now);
        assert!(!lifecycle.is_live());
        assert!(lifecycle.deleted_at.is_some());
        lifecycle.reactivate(now);
        assert!(lifecycle.is_live());
    }
}
