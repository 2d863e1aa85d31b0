//! Effective permission resolution.
//!
//! For a principal and organization the resolver collects:
//! 1. direct role grants whose scope is global or matches the organization,
//! 2. role grants on every group in the ancestor chain of each effective
//!    membership (membership in a child group inherits ancestor grants),
//! 3. parent roles of everything above, transitively and depth-bounded,
//!
//! and unions the permissions of the resulting role set. Every role and
//! permission keeps the path that granted it, for explainability.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};

use crate::audit::AuditSink;
use crate::cache::Cache;
use crate::engine::{Authorization, Deadline, Engine};
use crate::error::Result;
use crate::model::{Group, GroupRole, PermissionRecord, Role, RoleScope, TimeWindow};
use crate::permission::{Permission, permission_matches};
use crate::store::Store;
use crate::types::{GroupId, OrganizationId, PermissionId, PrincipalId, RoleId};

/// Role id plus display name.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RoleRef {
    pub id: RoleId,
    pub name: String,
}

impl From<&Role> for RoleRef {
    fn from(role: &Role) -> Self {
        Self {
            id: role.id.clone(),
            name: role.name.clone(),
        }
    }
}

/// How the first role of a [`GrantPath`] reached the principal.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GrantSource {
    /// Direct user-role assignment.
    Direct,
    /// Role granted on `granted_on`, reached through membership of `member_of`
    /// (equal to, or a descendant of, `granted_on`).
    Group {
        member_of: GroupId,
        granted_on: GroupId,
    },
}

/// Chain from a grant to the role that provides a permission.
///
/// `roles[0]` is the granted role; each following role is the parent of the
/// previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GrantPath {
    pub source: GrantSource,
    pub roles: Vec<RoleRef>,
}

impl GrantPath {
    /// Role that was actually assigned.
    pub fn granted_role(&self) -> Option<&RoleRef> {
        self.roles.first()
    }

    /// Role at the end of the inheritance chain.
    pub fn effective_role(&self) -> Option<&RoleRef> {
        self.roles.last()
    }
}

impl fmt::Display for GrantPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.granted_role(), self.effective_role()) {
            (Some(granted), Some(effective)) if granted.id != effective.id => write!(
                f,
                "role {} inherited by role {}",
                effective.name, granted.name
            )?,
            (Some(granted), _) => write!(f, "role {}", granted.name)?,
            _ => f.write_str("unknown role")?,
        }
        match &self.source {
            GrantSource::Direct => f.write_str(" (direct assignment)"),
            GrantSource::Group {
                member_of,
                granted_on,
            } if member_of == granted_on => write!(f, " assigned to group {granted_on}"),
            GrantSource::Group {
                member_of,
                granted_on,
            } => write!(f, " inherited from group {granted_on} (member of {member_of})"),
        }
    }
}

/// A role in the effective set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveRole {
    pub role: Role,
    pub path: GrantPath,
}

/// A permission in the effective set with the path that provides it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePermission {
    pub permission: Permission,
    pub path: GrantPath,
}

/// Resolved roles and permissions for one principal and context.
///
/// Always derived, never a source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePermissions {
    pub principal: PrincipalId,
    pub organization: Option<OrganizationId>,
    pub group: Option<GroupId>,
    pub roles: Vec<EffectiveRole>,
    pub permissions: Vec<EffectivePermission>,
    pub computed_at: DateTime<Utc>,
    /// Earliest future window boundary among examined grants; the set may
    /// change at that instant.
    pub valid_until: Option<DateTime<Utc>>,
}

impl EffectivePermissions {
    pub(crate) fn empty(
        principal: PrincipalId,
        organization: Option<OrganizationId>,
        group: Option<GroupId>,
        computed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            principal,
            organization,
            group,
            roles: Vec::new(),
            permissions: Vec::new(),
            computed_at,
            valid_until: None,
        }
    }

    /// Whether the set is still exact at `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_none_or(|until| now < until)
    }

    /// First permission satisfying `required`.
    pub fn find(&self, required: &Permission, enable_wildcard: bool) -> Option<&EffectivePermission> {
        self.permissions
            .iter()
            .find(|granted| permission_matches(&granted.permission, required, enable_wildcard))
    }

    /// Whether any permission satisfies `required`.
    pub fn allows(&self, required: &Permission, enable_wildcard: bool) -> bool {
        self.find(required, enable_wildcard).is_some()
    }

    /// Sorted, de-duplicated permission strings.
    pub fn permission_strings(&self) -> Vec<String> {
        let mut values: Vec<String> = self
            .permissions
            .iter()
            .map(|granted| granted.permission.to_string())
            .collect();
        values.sort();
        values.dedup();
        values
    }

    pub(crate) fn decide(&self, required: &Permission, enable_wildcard: bool) -> Authorization {
        if let Some(granted) = self.find(required, enable_wildcard) {
            let via = if granted.permission == *required {
                String::new()
            } else {
                format!(" (matched {})", granted.permission)
            };
            return Authorization::Allowed {
                reason: format!("granted {required} via {}{via}", granted.path),
                path: granted.path.clone(),
            };
        }
        let reason = if self.roles.is_empty() {
            "no applicable grants".to_string()
        } else {
            format!(
                "no applicable grants for {required} across {} effective roles",
                self.roles.len()
            )
        };
        Authorization::Denied { reason }
    }
}

/// Tracks the earliest upcoming window boundary.
struct Horizon {
    now: DateTime<Utc>,
    next: Option<DateTime<Utc>>,
}

impl Horizon {
    fn new(now: DateTime<Utc>) -> Self {
        Self { now, next: None }
    }

    fn observe(&mut self, window: &TimeWindow) {
        if let Some(boundary) = window.next_boundary_after(self.now) {
            self.next = Some(self.next.map_or(boundary, |next| next.min(boundary)));
        }
    }
}

/// Whether a role's scope applies in `organization`, optionally restricted
/// to the group ids in `groups`.
fn scope_applies(
    scope: &RoleScope,
    organization: Option<&OrganizationId>,
    groups: Option<&[GroupId]>,
) -> bool {
    match scope {
        RoleScope::Global => true,
        RoleScope::Organization(org) => organization == Some(org),
        RoleScope::Group {
            organization: org,
            group,
        } => organization == Some(org) && groups.is_none_or(|groups| groups.contains(group)),
    }
}

/// Per-resolution memo of store lookups.
#[derive(Default)]
struct Lookups {
    roles: HashMap<RoleId, Option<Role>>,
    group_roles: HashMap<GroupId, Vec<GroupRole>>,
    permissions: HashMap<PermissionId, Option<PermissionRecord>>,
}

impl<S, C, A> Engine<S, C, A>
where
    S: Store,
    C: Cache,
    A: AuditSink,
{
    pub(crate) async fn resolve(
        &self,
        principal: &PrincipalId,
        organization: Option<&OrganizationId>,
        group: Option<&GroupId>,
        deadline: Deadline,
    ) -> Result<EffectivePermissions> {
        let now = Utc::now();
        let mut horizon = Horizon::new(now);
        let mut lookups = Lookups::default();
        let mut seeds: Vec<(Role, GrantSource)> = Vec::new();

        let target_chain: Option<Vec<GroupId>> = match group {
            Some(group_id) => {
                let chain = self.group_hierarchy_within(group_id, deadline).await?;
                Some(chain.into_iter().map(|group| group.id).collect())
            }
            None => None,
        };

        let direct = self
            .call(deadline, "load principal roles", self.store.principal_roles(principal))
            .await?;
        for grant in direct {
            horizon.observe(&grant.window);
            if !grant.is_effective_at(now) {
                continue;
            }
            let Some(role) = self.memo_role(&mut lookups, &grant.role_id, deadline).await? else {
                continue;
            };
            if role.is_live() && scope_applies(&role.scope, organization, target_chain.as_deref()) {
                seeds.push((role, GrantSource::Direct));
            }
        }

        if let Some(org) = organization {
            let memberships = self
                .call(
                    deadline,
                    "load principal memberships",
                    self.store.principal_memberships(principal),
                )
                .await?;
            for membership in memberships {
                horizon.observe(&membership.window);
                if !membership.is_effective_at(now) {
                    continue;
                }
                let member_group = self
                    .call(deadline, "load group", self.store.group(&membership.group_id))
                    .await?;
                let Some(member_group) = member_group else {
                    continue;
                };
                if &member_group.organization_id != org || !member_group.is_live() {
                    continue;
                }
                let chain = self.group_chain(member_group, deadline).await?;
                if let Some(target) = group
                    && !chain.iter().any(|ancestor| &ancestor.id == target)
                {
                    continue;
                }
                self.collect_group_grants(
                    &chain,
                    organization,
                    &mut lookups,
                    &mut horizon,
                    &mut seeds,
                    deadline,
                )
                .await?;
            }
        }

        let roles = self.expand_roles(seeds, &mut lookups, deadline).await?;
        let permissions = self
            .collect_permissions(&roles, &mut lookups, deadline)
            .await?;

        Ok(EffectivePermissions {
            principal: principal.clone(),
            organization: organization.cloned(),
            group: group.cloned(),
            roles,
            permissions,
            computed_at: now,
            valid_until: horizon.next,
        })
    }

    /// Collects grants on every group of a root-to-member chain.
    async fn collect_group_grants(
        &self,
        chain: &[Group],
        organization: Option<&OrganizationId>,
        lookups: &mut Lookups,
        horizon: &mut Horizon,
        seeds: &mut Vec<(Role, GrantSource)>,
        deadline: Deadline,
    ) -> Result<()> {
        let Some(member) = chain.last() else {
            return Ok(());
        };
        let chain_ids: Vec<GroupId> = chain.iter().map(|group| group.id.clone()).collect();

        // Nearest group first so direct group grants explain before inherited ones.
        for ancestor in chain.iter().rev() {
            if !ancestor.is_live() {
                continue;
            }
            if !lookups.group_roles.contains_key(&ancestor.id) {
                let grants = self
                    .call(deadline, "load group roles", self.store.group_roles(&ancestor.id))
                    .await?;
                lookups.group_roles.insert(ancestor.id.clone(), grants);
            }
            let grants = lookups
                .group_roles
                .get(&ancestor.id)
                .cloned()
                .unwrap_or_default();
            for grant in grants {
                horizon.observe(&grant.window);
                if !grant.is_effective_at(horizon.now) {
                    continue;
                }
                let Some(role) = self.memo_role(lookups, &grant.role_id, deadline).await? else {
                    continue;
                };
                if role.is_live() && scope_applies(&role.scope, organization, Some(&chain_ids)) {
                    seeds.push((
                        role,
                        GrantSource::Group {
                            member_of: member.id.clone(),
                            granted_on: ancestor.id.clone(),
                        },
                    ));
                }
            }
        }
        Ok(())
    }

    /// Adds parent roles of every seed. The first path to reach a role wins.
    async fn expand_roles(
        &self,
        seeds: Vec<(Role, GrantSource)>,
        lookups: &mut Lookups,
        deadline: Deadline,
    ) -> Result<Vec<EffectiveRole>> {
        let mut seen = HashSet::new();
        let mut roles = Vec::new();

        for (seed, source) in seeds {
            if !seen.insert(seed.id.clone()) {
                continue;
            }
            let chain = self.role_chain(seed, deadline).await?;
            let mut path = Vec::with_capacity(chain.len());
            for (index, role) in chain.into_iter().enumerate() {
                if !role.is_live() {
                    break;
                }
                path.push(RoleRef::from(&role));
                lookups
                    .roles
                    .entry(role.id.clone())
                    .or_insert_with(|| Some(role.clone()));
                if index > 0 && !seen.insert(role.id.clone()) {
                    continue;
                }
                roles.push(EffectiveRole {
                    role,
                    path: GrantPath {
                        source: source.clone(),
                        roles: path.clone(),
                    },
                });
            }
        }
        Ok(roles)
    }

    async fn collect_permissions(
        &self,
        roles: &[EffectiveRole],
        lookups: &mut Lookups,
        deadline: Deadline,
    ) -> Result<Vec<EffectivePermission>> {
        let mut seen = HashSet::new();
        let mut permissions = Vec::new();

        for effective in roles {
            let links = self
                .call(
                    deadline,
                    "load role permissions",
                    self.store.role_permissions(&effective.role.id),
                )
                .await?;
            for link in links.into_iter().filter(|link| link.lifecycle.is_live()) {
                if !lookups.permissions.contains_key(&link.permission_id) {
                    let record = self
                        .call(deadline, "load permission", self.store.permission(&link.permission_id))
                        .await?;
                    lookups.permissions.insert(link.permission_id.clone(), record);
                }
                let Some(Some(record)) = lookups.permissions.get(&link.permission_id) else {
                    continue;
                };
                if record.is_live() && seen.insert(record.permission.clone()) {
                    permissions.push(EffectivePermission {
                        permission: record.permission.clone(),
                        path: effective.path.clone(),
                    });
                }
            }
        }
        Ok(permissions)
    }

    async fn memo_role(
        &self,
        lookups: &mut Lookups,
        id: &RoleId,
        deadline: Deadline,
    ) -> Result<Option<Role>> {
        if let Some(role) = lookups.roles.get(id) {
            return Ok(role.clone());
        }
        let role = self
            .call(deadline, "load role", self.store.role(id))
            .await?;
        lookups.roles.insert(id.clone(), role.clone());
        Ok(role)
    }
}
