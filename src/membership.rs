//! Group memberships, role assignments and cache invalidation fan-out.
//!
//! Writes commit first; invalidation runs afterwards and is best effort.
//! When a change touches more principals than
//! [`EngineConfig::broad_role_threshold`](crate::EngineConfig), the engine
//! drops the whole organization from the cache, or, for global roles, the
//! whole cache.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use tracing::{info, warn};

use crate::audit::AuditSink;
use crate::cache::Cache;
use crate::engine::{Deadline, Engine};
use crate::error::{Error, Result};
use crate::model::{
    Group, GroupMembership, GroupRole, Lifecycle, Organization, Role, RoleScope, TimeWindow,
    UserRole,
};
use crate::store::Store;
use crate::types::{GroupId, OrganizationId, Principal, PrincipalId, RoleId};

impl<S, C, A> Engine<S, C, A>
where
    S: Store,
    C: Cache,
    A: AuditSink,
{
    /// Principals whose resolution may change when `role` changes: direct
    /// holders and members of granted group subtrees, for the role and every
    /// role inheriting from it. Stops early past the broad-role threshold.
    pub(crate) async fn principals_affected_by_role(
        &self,
        role: &Role,
        deadline: Deadline,
    ) -> Result<HashSet<PrincipalId>> {
        let threshold = self.config.broad_role_threshold;
        let mut roles = vec![role.id.clone()];
        roles.extend(
            self.role_descendants_within(&role.id, deadline)
                .await?
                .into_iter()
                .map(|role| role.id),
        );

        let mut principals = HashSet::new();
        for role_id in &roles {
            let holders = self
                .call(deadline, "load role holders", self.store.role_holders(role_id))
                .await?;
            principals.extend(
                holders
                    .into_iter()
                    .filter(|grant| grant.lifecycle.is_live())
                    .map(|grant| grant.principal_id),
            );
            if principals.len() > threshold {
                return Ok(principals);
            }

            let grants = self
                .call(
                    deadline,
                    "load role group grants",
                    self.store.role_group_grants(role_id),
                )
                .await?;
            for grant in grants.into_iter().filter(|grant| grant.lifecycle.is_live()) {
                let group = self
                    .call(deadline, "load group", self.store.group(&grant.group_id))
                    .await?;
                if let Some(group) = group.filter(Group::is_live) {
                    principals.extend(self.subtree_members(group, deadline).await?);
                }
                if principals.len() > threshold {
                    return Ok(principals);
                }
            }
        }
        Ok(principals)
    }

    async fn subtree_members(&self, root: Group, deadline: Deadline) -> Result<HashSet<PrincipalId>> {
        let mut principals = HashSet::new();
        for group in self.group_subtree(root, deadline).await? {
            let memberships = self
                .call(
                    deadline,
                    "load group memberships",
                    self.store.group_memberships(&group.id),
                )
                .await?;
            principals.extend(
                memberships
                    .into_iter()
                    .filter(|membership| membership.lifecycle.is_live())
                    .map(|membership| membership.principal_id),
            );
        }
        Ok(principals)
    }

    /// Invalidates each affected principal, or falls back to the organization
    /// (or everything) when the set is too broad or could not be enumerated.
    pub(crate) async fn invalidate_principals(
        &self,
        affected: Result<HashSet<PrincipalId>>,
        fallback: Option<&OrganizationId>,
        deadline: Deadline,
    ) {
        match affected {
            Ok(principals) if principals.len() <= self.config.broad_role_threshold => {
                for principal in &principals {
                    self.invalidate_principal(principal, deadline).await;
                }
                return;
            }
            Ok(principals) => info!(
                affected = principals.len(),
                threshold = self.config.broad_role_threshold,
                "broad change; skipping per-principal invalidation"
            ),
            Err(err) => warn!(error = %err, "could not enumerate affected principals"),
        }
        match fallback {
            Some(organization) => self.invalidate_organization(organization, deadline).await,
            None => self.invalidate_all(deadline).await,
        }
    }

    pub(crate) async fn invalidate_role_holders(&self, role: &Role, deadline: Deadline) {
        let affected = self.principals_affected_by_role(role, deadline).await;
        self.invalidate_principals(affected, role.scope.organization(), deadline)
            .await;
    }

    pub(crate) async fn invalidate_group_subtree(&self, group: Group, deadline: Deadline) {
        let organization = group.organization_id.clone();
        let affected = self.subtree_members(group, deadline).await;
        self.invalidate_principals(affected, Some(&organization), deadline)
            .await;
    }

    /// Adds a principal to a group for the given window.
    pub async fn add_group_member(
        &self,
        actor: &PrincipalId,
        group: &GroupId,
        principal: &Principal,
        window: TimeWindow,
    ) -> Result<GroupMembership> {
        let deadline = self.deadline();
        let result = self
            .try_add_group_member(actor, group, principal, window, deadline)
            .await;
        if result.is_ok() {
            self.invalidate_principal(&principal.id, deadline).await;
        }
        self.record_mutation(
            deadline,
            actor,
            "membership.add",
            "group",
            group.as_str(),
            &result,
            &[
                ("principal", principal.id.to_string()),
                ("principal_type", principal.kind.to_string()),
            ],
        )
        .await;
        result
    }

    async fn try_add_group_member(
        &self,
        actor: &PrincipalId,
        group_id: &GroupId,
        principal: &Principal,
        window: TimeWindow,
        deadline: Deadline,
    ) -> Result<GroupMembership> {
        let window = TimeWindow::new(window.starts_at, window.ends_at)?;
        let group = self.live_group(group_id, deadline).await?;
        self.live_organization(&group.organization_id, deadline)
            .await?;

        let now = Utc::now();
        let existing = self
            .call(
                deadline,
                "load group memberships",
                self.store.group_memberships(group_id),
            )
            .await?
            .into_iter()
            .find(|membership| membership.principal_id == principal.id);
        let membership = match existing {
            Some(membership) if membership.lifecycle.is_live() => {
                return Err(Error::Conflict(format!(
                    "{} is already a member of group {group_id}",
                    principal.id
                )));
            }
            Some(mut membership) => {
                membership.lifecycle.reactivate(now);
                membership.window = window;
                membership.principal_type = principal.kind;
                membership.added_by = actor.clone();
                membership
            }
            None => GroupMembership {
                group_id: group_id.clone(),
                principal_id: principal.id.clone(),
                principal_type: principal.kind,
                window,
                added_by: actor.clone(),
                lifecycle: Lifecycle::created(now),
            },
        };
        self.call(
            deadline,
            "save membership",
            self.store.save_membership(membership.clone()),
        )
        .await?;
        Ok(membership)
    }

    /// Ends a principal's membership of a group.
    pub async fn remove_group_member(
        &self,
        actor: &PrincipalId,
        group: &GroupId,
        principal: &PrincipalId,
    ) -> Result<()> {
        let deadline = self.deadline();
        let result = async {
            let mut membership = self
                .call(
                    deadline,
                    "load group memberships",
                    self.store.group_memberships(group),
                )
                .await?
                .into_iter()
                .find(|membership| {
                    &membership.principal_id == principal && membership.lifecycle.is_live()
                })
                .ok_or_else(|| Error::not_found("membership", format!("{group}/{principal}")))?;
            membership.lifecycle.soft_delete(Utc::now());
            self.call(deadline, "save membership", self.store.save_membership(membership))
                .await
        }
        .await;
        if result.is_ok() {
            self.invalidate_principal(principal, deadline).await;
        }
        self.record_mutation(
            deadline,
            actor,
            "membership.remove",
            "group",
            group.as_str(),
            &result,
            &[("principal", principal.to_string())],
        )
        .await;
        result
    }

    /// Grants a role to every member of a group and its descendants.
    pub async fn assign_role_to_group(
        &self,
        actor: &PrincipalId,
        group: &GroupId,
        role: &RoleId,
        window: TimeWindow,
    ) -> Result<GroupRole> {
        let deadline = self.deadline();
        let result = self
            .try_assign_role_to_group(actor, group, role, window, deadline)
            .await;
        if let Ok((target, _)) = &result {
            self.invalidate_group_subtree(target.clone(), deadline).await;
        }
        let result = result.map(|(_, grant)| grant);
        self.record_mutation(
            deadline,
            actor,
            "group_role.assign",
            "group",
            group.as_str(),
            &result,
            &[("role", role.to_string())],
        )
        .await;
        result
    }

    async fn try_assign_role_to_group(
        &self,
        actor: &PrincipalId,
        group_id: &GroupId,
        role_id: &RoleId,
        window: TimeWindow,
        deadline: Deadline,
    ) -> Result<(Group, GroupRole)> {
        let window = TimeWindow::new(window.starts_at, window.ends_at)?;
        let group = self.live_group(group_id, deadline).await?;
        let role = self.live_role(role_id, deadline).await?;
        match &role.scope {
            RoleScope::Global => {}
            RoleScope::Organization(organization) if organization == &group.organization_id => {}
            RoleScope::Group {
                organization,
                group: scoped,
            } if organization == &group.organization_id => {
                let chain = self.group_chain(group.clone(), deadline).await?;
                if !chain.iter().any(|ancestor| &ancestor.id == scoped) {
                    return Err(Error::Validation(format!(
                        "role {role_id} is scoped to group {scoped}, outside group {group_id}"
                    )));
                }
            }
            scope => {
                return Err(Error::Validation(format!(
                    "role {role_id} in {scope} cannot be granted in organization {}",
                    group.organization_id
                )));
            }
        }

        let now = Utc::now();
        let existing = self
            .call(deadline, "load group roles", self.store.group_roles(group_id))
            .await?
            .into_iter()
            .find(|grant| &grant.role_id == role_id);
        let grant = match existing {
            Some(grant) if grant.lifecycle.is_live() => {
                return Err(Error::Conflict(format!(
                    "role {role_id} is already assigned to group {group_id}"
                )));
            }
            Some(mut grant) => {
                grant.lifecycle.reactivate(now);
                grant.window = window;
                grant.assigned_by = actor.clone();
                grant
            }
            None => GroupRole {
                group_id: group_id.clone(),
                role_id: role_id.clone(),
                window,
                assigned_by: actor.clone(),
                lifecycle: Lifecycle::created(now),
            },
        };
        self.call(deadline, "save group role", self.store.save_group_role(grant.clone()))
            .await?;
        Ok((group, grant))
    }

    /// Revokes a group role grant.
    pub async fn revoke_role_from_group(
        &self,
        actor: &PrincipalId,
        group: &GroupId,
        role: &RoleId,
    ) -> Result<()> {
        let deadline = self.deadline();
        let result = async {
            let target = self
                .call(deadline, "load group", self.store.group(group))
                .await?
                .ok_or_else(|| Error::not_found("group", group))?;
            let mut grant = self
                .call(deadline, "load group roles", self.store.group_roles(group))
                .await?
                .into_iter()
                .find(|grant| &grant.role_id == role && grant.lifecycle.is_live())
                .ok_or_else(|| Error::not_found("group role", format!("{group}/{role}")))?;
            grant.lifecycle.soft_delete(Utc::now());
            grant.assigned_by = actor.clone();
            self.call(deadline, "save group role", self.store.save_group_role(grant))
                .await?;
            Ok::<_, Error>(target)
        }
        .await;
        if let Ok(target) = &result {
            self.invalidate_group_subtree(target.clone(), deadline).await;
        }
        let result = result.map(|_| ());
        self.record_mutation(
            deadline,
            actor,
            "group_role.revoke",
            "group",
            group.as_str(),
            &result,
            &[("role", role.to_string())],
        )
        .await;
        result
    }

    /// Grants a role directly to a principal.
    pub async fn assign_role_to_user(
        &self,
        actor: &PrincipalId,
        principal: &PrincipalId,
        role: &RoleId,
        window: TimeWindow,
    ) -> Result<UserRole> {
        let deadline = self.deadline();
        let result = self
            .try_assign_role_to_user(actor, principal, role, window, deadline)
            .await;
        if result.is_ok() {
            self.invalidate_principal(principal, deadline).await;
        }
        self.record_mutation(
            deadline,
            actor,
            "user_role.assign",
            "principal",
            principal.as_str(),
            &result,
            &[("role", role.to_string())],
        )
        .await;
        result
    }

    async fn try_assign_role_to_user(
        &self,
        actor: &PrincipalId,
        principal: &PrincipalId,
        role_id: &RoleId,
        window: TimeWindow,
        deadline: Deadline,
    ) -> Result<UserRole> {
        let window = TimeWindow::new(window.starts_at, window.ends_at)?;
        self.live_role(role_id, deadline).await?;

        let now = Utc::now();
        let existing = self
            .call(deadline, "load principal roles", self.store.principal_roles(principal))
            .await?
            .into_iter()
            .find(|grant| &grant.role_id == role_id);
        let grant = match existing {
            Some(grant) if grant.lifecycle.is_live() => {
                return Err(Error::Conflict(format!(
                    "role {role_id} is already assigned to {principal}"
                )));
            }
            Some(mut grant) => {
                grant.lifecycle.reactivate(now);
                grant.window = window;
                grant.assigned_by = actor.clone();
                grant
            }
            None => UserRole {
                principal_id: principal.clone(),
                role_id: role_id.clone(),
                window,
                assigned_by: actor.clone(),
                lifecycle: Lifecycle::created(now),
            },
        };
        self.call(deadline, "save user role", self.store.save_user_role(grant.clone()))
            .await?;
        Ok(grant)
    }

    /// Revokes a direct role grant.
    pub async fn revoke_role_from_user(
        &self,
        actor: &PrincipalId,
        principal: &PrincipalId,
        role: &RoleId,
    ) -> Result<()> {
        let deadline = self.deadline();
        let result = async {
            let mut grant = self
                .call(deadline, "load principal roles", self.store.principal_roles(principal))
                .await?
                .into_iter()
                .find(|grant| &grant.role_id == role && grant.lifecycle.is_live())
                .ok_or_else(|| Error::not_found("user role", format!("{principal}/{role}")))?;
            grant.lifecycle.soft_delete(Utc::now());
            grant.assigned_by = actor.clone();
            self.call(deadline, "save user role", self.store.save_user_role(grant))
                .await
        }
        .await;
        if result.is_ok() {
            self.invalidate_principal(principal, deadline).await;
        }
        self.record_mutation(
            deadline,
            actor,
            "user_role.revoke",
            "principal",
            principal.as_str(),
            &result,
            &[("role", role.to_string())],
        )
        .await;
        result
    }

    /// Live groups, in live organizations, the principal is an effective
    /// member of right now.
    pub async fn principal_groups(&self, principal: &PrincipalId) -> Result<Vec<Group>> {
        self.principal_groups_within(principal, self.deadline())
            .await
    }

    pub(crate) async fn principal_groups_within(
        &self,
        principal: &PrincipalId,
        deadline: Deadline,
    ) -> Result<Vec<Group>> {
        let now = Utc::now();
        let memberships = self
            .call(
                deadline,
                "load principal memberships",
                self.store.principal_memberships(principal),
            )
            .await?;
        let mut live_organizations: HashMap<OrganizationId, bool> = HashMap::new();
        let mut groups = Vec::new();
        for membership in memberships {
            if !membership.is_effective_at(now) {
                continue;
            }
            let group = self
                .call(deadline, "load group", self.store.group(&membership.group_id))
                .await?;
            let Some(group) = group.filter(Group::is_live) else {
                continue;
            };
            let live = match live_organizations.get(&group.organization_id) {
                Some(live) => *live,
                None => {
                    let live = self
                        .call(
                            deadline,
                            "load organization",
                            self.store.organization(&group.organization_id),
                        )
                        .await?
                        .is_some_and(|organization| organization.is_live());
                    live_organizations.insert(group.organization_id.clone(), live);
                    live
                }
            };
            if live {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    /// Live organizations the principal reaches through memberships or
    /// organization-scoped direct grants, ordered by id.
    pub async fn principal_organizations(
        &self,
        principal: &PrincipalId,
    ) -> Result<Vec<Organization>> {
        self.principal_organizations_within(principal, self.deadline())
            .await
    }

    pub(crate) async fn principal_organizations_within(
        &self,
        principal: &PrincipalId,
        deadline: Deadline,
    ) -> Result<Vec<Organization>> {
        let now = Utc::now();
        let mut ids: HashSet<OrganizationId> = self
            .principal_groups_within(principal, deadline)
            .await?
            .into_iter()
            .map(|group| group.organization_id)
            .collect();

        let grants = self
            .call(deadline, "load principal roles", self.store.principal_roles(principal))
            .await?;
        for grant in grants.into_iter().filter(|grant| grant.is_effective_at(now)) {
            let role = self
                .call(deadline, "load role", self.store.role(&grant.role_id))
                .await?;
            if let Some(organization) = role
                .filter(Role::is_live)
                .and_then(|role| role.scope.organization().cloned())
            {
                ids.insert(organization);
            }
        }

        let mut organizations = BTreeMap::new();
        for id in ids {
            let organization = self
                .call(deadline, "load organization", self.store.organization(&id))
                .await?;
            if let Some(organization) = organization.filter(Organization::is_live) {
                organizations.insert(id, organization);
            }
        }
        Ok(organizations.into_values().collect())
    }

    /// Memberships of a group that are effective right now.
    pub async fn group_members(&self, group: &GroupId) -> Result<Vec<GroupMembership>> {
        let deadline = self.deadline();
        self.call(deadline, "load group", self.store.group(group))
            .await?
            .ok_or_else(|| Error::not_found("group", group))?;
        let now = Utc::now();
        Ok(self
            .call(
                deadline,
                "load group memberships",
                self.store.group_memberships(group),
            )
            .await?
            .into_iter()
            .filter(|membership| membership.is_effective_at(now))
            .collect())
    }
}

#[cfg(all(test, feature = "memory-store"))]
mod tests {
    use super::*;
    use crate::engine::EngineBuilder;
    use crate::error::ErrorKind;
    use crate::memory_store::MemoryStore;
    use crate::store::HierarchyStore;
    use chrono::Duration;
    use futures::executor::block_on;

    fn admin() -> PrincipalId {
        PrincipalId::try_from("admin").unwrap()
    }

    fn user(value: &str) -> Principal {
        Principal::user(PrincipalId::try_from(value).unwrap())
    }

    #[test]
    fn groups_of_inactive_organizations_are_hidden() {
        let store = MemoryStore::new();
        let engine = EngineBuilder::new(store.clone()).build();
        let acme = block_on(engine.create_organization(&admin(), "Acme", "company", None)).unwrap();
        let other = block_on(engine.create_organization(&admin(), "Other", "company", None)).unwrap();
        let eng = block_on(engine.create_group(&admin(), &acme.id, "Eng", None)).unwrap();
        let ops = block_on(engine.create_group(&admin(), &other.id, "Ops", None)).unwrap();
        let u1 = user("u1");
        block_on(engine.add_group_member(&admin(), &eng.id, &u1, TimeWindow::always())).unwrap();
        block_on(engine.add_group_member(&admin(), &ops.id, &u1, TimeWindow::always())).unwrap();
        assert_eq!(block_on(engine.principal_groups(&u1.id)).unwrap().len(), 2);

        let mut closed = other.clone();
        closed.lifecycle.deactivate(Utc::now());
        block_on(store.save_organization(closed)).unwrap();

        let groups = block_on(engine.principal_groups(&u1.id)).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, eng.id);
        let organizations = block_on(engine.principal_organizations(&u1.id)).unwrap();
        assert_eq!(organizations.len(), 1);
        assert_eq!(organizations[0].id, acme.id);
    }

    #[test]
    fn double_membership_conflicts() {
        let engine = EngineBuilder::new(MemoryStore::new()).build();
        let org = block_on(engine.create_organization(&admin(), "Acme", "company", None)).unwrap();
        let group = block_on(engine.create_group(&admin(), &org.id, "Eng", None)).unwrap();
        let u1 = user("u1");

        block_on(engine.add_group_member(&admin(), &group.id, &u1, TimeWindow::always())).unwrap();
        let err = block_on(engine.add_group_member(&admin(), &group.id, &u1, TimeWindow::always()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        block_on(engine.remove_group_member(&admin(), &group.id, &u1.id)).unwrap();
        let err = block_on(engine.remove_group_member(&admin(), &group.id, &u1.id)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        block_on(engine.add_group_member(&admin(), &group.id, &u1, TimeWindow::always())).unwrap();
        assert_eq!(block_on(engine.group_members(&group.id)).unwrap().len(), 1);
    }

    #[test]
    fn inverted_window_is_rejected() {
        let engine = EngineBuilder::new(MemoryStore::new()).build();
        let org = block_on(engine.create_organization(&admin(), "Acme", "company", None)).unwrap();
        let group = block_on(engine.create_group(&admin(), &org.id, "Eng", None)).unwrap();
        let now = Utc::now();
        let window = TimeWindow {
            starts_at: Some(now),
            ends_at: Some(now - Duration::hours(1)),
        };

        let err =
            block_on(engine.add_group_member(&admin(), &group.id, &user("u1"), window)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn group_scoped_role_must_cover_target_group() {
        let engine = EngineBuilder::new(MemoryStore::new()).build();
        let org = block_on(engine.create_organization(&admin(), "Acme", "company", None)).unwrap();
        let eng = block_on(engine.create_group(&admin(), &org.id, "Eng", None)).unwrap();
        let ops = block_on(engine.create_group(&admin(), &org.id, "Ops", None)).unwrap();
        let role = block_on(engine.create_role(
            &admin(),
            "eng-lead",
            RoleScope::Group {
                organization: org.id.clone(),
                group: eng.id.clone(),
            },
        ))
        .unwrap();

        let err = block_on(engine.assign_role_to_group(
            &admin(),
            &ops.id,
            &role.id,
            TimeWindow::always(),
        ))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        block_on(engine.assign_role_to_group(&admin(), &eng.id, &role.id, TimeWindow::always()))
            .unwrap();
    }

    #[test]
    fn principal_organizations_include_direct_scoped_grants() {
        let engine = EngineBuilder::new(MemoryStore::new()).build();
        let acme = block_on(engine.create_organization(&admin(), "Acme", "company", None)).unwrap();
        let beta = block_on(engine.create_organization(&admin(), "Beta", "company", None)).unwrap();
        let group = block_on(engine.create_group(&admin(), &acme.id, "Eng", None)).unwrap();
        let role = block_on(engine.create_role(
            &admin(),
            "auditor",
            RoleScope::Organization(beta.id.clone()),
        ))
        .unwrap();
        let u1 = user("u1");

        block_on(engine.add_group_member(&admin(), &group.id, &u1, TimeWindow::always())).unwrap();
        block_on(engine.assign_role_to_user(&admin(), &u1.id, &role.id, TimeWindow::always()))
            .unwrap();

        let organizations = block_on(engine.principal_organizations(&u1.id)).unwrap();
        let mut ids: Vec<_> = organizations.into_iter().map(|org| org.id).collect();
        ids.sort();
        let mut expected = vec![acme.id, beta.id];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(block_on(engine.principal_groups(&u1.id)).unwrap().len(), 1);
    }
}
