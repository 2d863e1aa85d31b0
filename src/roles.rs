//! Roles, permissions and the role hierarchy.

use std::collections::{HashSet, VecDeque};

use chrono::Utc;
use tracing::warn;

use crate::audit::AuditSink;
use crate::cache::Cache;
use crate::engine::{Deadline, Engine};
use crate::error::{Error, Result};
use crate::model::{Lifecycle, PermissionRecord, Role, RolePermission, RoleScope};
use crate::permission::Permission;
use crate::store::Store;
use crate::types::{PermissionId, PrincipalId, RoleId, validate_display_name};

impl<S, C, A> Engine<S, C, A>
where
    S: Store,
    C: Cache,
    A: AuditSink,
{
    /// `[role, parent, grandparent, ...]`, inactive roles included.
    pub(crate) async fn role_chain(&self, role: Role, deadline: Deadline) -> Result<Vec<Role>> {
        self.ancestry(role, deadline, "load parent role", move |id| async move {
            self.store.role(&id).await
        })
        .await
    }

    pub(crate) async fn live_role(&self, id: &RoleId, deadline: Deadline) -> Result<Role> {
        self.call(deadline, "load role", self.store.role(id))
            .await?
            .filter(Role::is_live)
            .ok_or_else(|| Error::not_found("role", id))
    }

    /// Every live role inheriting from `id`, breadth first, excluding `id`.
    pub(crate) async fn role_descendants_within(
        &self,
        id: &RoleId,
        deadline: Deadline,
    ) -> Result<Vec<Role>> {
        let mut visited = HashSet::new();
        visited.insert(id.clone());
        let mut queue = VecDeque::from([(id.clone(), 0usize)]);
        let mut descendants = Vec::new();

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= self.config.max_depth {
                continue;
            }
            let children = self
                .call(deadline, "load child roles", self.store.child_roles(&current))
                .await?;
            for child in children.into_iter().filter(Role::is_live) {
                if visited.insert(child.id.clone()) {
                    queue.push_back((child.id.clone(), depth + 1));
                    descendants.push(child);
                }
            }
        }
        Ok(descendants)
    }

    /// Checks that a scope references live entities.
    async fn check_scope(&self, scope: &RoleScope, deadline: Deadline) -> Result<()> {
        match scope {
            RoleScope::Global => Ok(()),
            RoleScope::Organization(organization) => {
                self.live_organization(organization, deadline).await?;
                Ok(())
            }
            RoleScope::Group {
                organization,
                group,
            } => {
                self.live_organization(organization, deadline).await?;
                let group = self.live_group(group, deadline).await?;
                if &group.organization_id != organization {
                    return Err(Error::Validation(format!(
                        "group {} does not belong to organization {organization}",
                        group.id
                    )));
                }
                Ok(())
            }
        }
    }

    /// Creates a role. Names are unique within a scope.
    pub async fn create_role(
        &self,
        actor: &PrincipalId,
        name: &str,
        scope: RoleScope,
    ) -> Result<Role> {
        let deadline = self.deadline();
        let scope_detail = scope.to_string();
        let result = self.try_create_role(name, scope, deadline).await;
        let id = result
            .as_ref()
            .map(|role| role.id.to_string())
            .unwrap_or_default();
        self.record_mutation(
            deadline,
            actor,
            "role.create",
            "role",
            &id,
            &result,
            &[("name", name.to_string()), ("scope", scope_detail)],
        )
        .await;
        result
    }

    async fn try_create_role(&self, name: &str, scope: RoleScope, deadline: Deadline) -> Result<Role> {
        let name = validate_display_name(name, "role name")?;
        self.check_scope(&scope, deadline).await?;
        let existing = self
            .call(deadline, "find role", self.store.find_role(&scope, &name))
            .await?;
        if existing.is_some() {
            return Err(Error::Conflict(format!(
                "role {name} already exists in {scope}"
            )));
        }
        let role = Role::new(name, scope, Utc::now());
        self.call(deadline, "save role", self.store.save_role(role.clone()))
            .await?;
        Ok(role)
    }

    /// Loads a live role.
    pub async fn get_role(&self, id: &RoleId) -> Result<Role> {
        self.live_role(id, self.deadline()).await
    }

    /// Marks a role inactive. Inheritance through it stops immediately.
    pub async fn deactivate_role(&self, actor: &PrincipalId, id: &RoleId) -> Result<Role> {
        let deadline = self.deadline();
        let result = async {
            let mut role = self.live_role(id, deadline).await?;
            role.lifecycle.deactivate(Utc::now());
            self.call(deadline, "save role", self.store.save_role(role.clone()))
                .await?;
            Ok::<_, Error>(role)
        }
        .await;
        if let Ok(role) = &result {
            self.invalidate_role_holders(role, deadline).await;
        }
        self.record_mutation(deadline, actor, "role.deactivate", "role", id.as_str(), &result, &[])
            .await;
        result
    }

    /// Soft-deletes a role.
    ///
    /// Fails with a conflict while live user or group assignments reference
    /// the role, unless `force` is set, in which case those assignments are
    /// revoked first.
    pub async fn delete_role(&self, actor: &PrincipalId, id: &RoleId, force: bool) -> Result<()> {
        let deadline = self.deadline();
        let result = async {
            let role = self.live_role(id, deadline).await?;
            // Holders are captured before the revocations hide them.
            let affected = self.principals_affected_by_role(&role, deadline).await;
            self.try_delete_role(role.clone(), actor, force, deadline)
                .await?;
            Ok::<_, Error>((role, affected))
        }
        .await;
        let result = match result {
            Ok((role, affected)) => {
                self.invalidate_principals(affected, role.scope.organization(), deadline)
                    .await;
                Ok(())
            }
            Err(err) => Err(err),
        };
        self.record_mutation(
            deadline,
            actor,
            "role.delete",
            "role",
            id.as_str(),
            &result,
            &[("force", force.to_string())],
        )
        .await;
        result
    }

    async fn try_delete_role(
        &self,
        mut role: Role,
        actor: &PrincipalId,
        force: bool,
        deadline: Deadline,
    ) -> Result<()> {
        let now = Utc::now();
        let holders = self
            .call(deadline, "load role holders", self.store.role_holders(&role.id))
            .await?;
        let group_grants = self
            .call(
                deadline,
                "load role group grants",
                self.store.role_group_grants(&role.id),
            )
            .await?;
        let live_holders: Vec<_> = holders
            .into_iter()
            .filter(|grant| grant.lifecycle.is_live())
            .collect();
        let live_group_grants: Vec<_> = group_grants
            .into_iter()
            .filter(|grant| grant.lifecycle.is_live())
            .collect();
        let referenced = live_holders.len() + live_group_grants.len();
        if referenced > 0 && !force {
            return Err(Error::Conflict(format!(
                "role {} is referenced by {referenced} active assignments",
                role.id
            )));
        }

        for mut grant in live_holders {
            grant.lifecycle.soft_delete(now);
            grant.assigned_by = actor.clone();
            self.call(deadline, "save user role", self.store.save_user_role(grant))
                .await?;
        }
        for mut grant in live_group_grants {
            grant.lifecycle.soft_delete(now);
            grant.assigned_by = actor.clone();
            self.call(deadline, "save group role", self.store.save_group_role(grant))
                .await?;
        }
        if referenced > 0 {
            warn!(role = %role.id, referenced, "force-deleting role with active assignments");
        }

        role.lifecycle.soft_delete(now);
        self.call(deadline, "save role", self.store.save_role(role))
            .await
    }

    /// Registers a permission. Creating `*` permissions is audited separately.
    pub async fn create_permission(
        &self,
        actor: &PrincipalId,
        permission: Permission,
        description: Option<&str>,
    ) -> Result<PermissionRecord> {
        let deadline = self.deadline();
        let wildcard = permission.is_wildcard();
        let permission_detail = permission.to_string();
        let result = self
            .try_create_permission(permission, description, deadline)
            .await;
        let action = if wildcard {
            warn!(%actor, permission = %permission_detail, "wildcard permission created");
            "permission.create_wildcard"
        } else {
            "permission.create"
        };
        let id = result
            .as_ref()
            .map(|record| record.id.to_string())
            .unwrap_or_default();
        self.record_mutation(
            deadline,
            actor,
            action,
            "permission",
            &id,
            &result,
            &[("permission", permission_detail)],
        )
        .await;
        result
    }

    async fn try_create_permission(
        &self,
        permission: Permission,
        description: Option<&str>,
        deadline: Deadline,
    ) -> Result<PermissionRecord> {
        let now = Utc::now();
        let existing = self
            .call(deadline, "find permission", self.store.find_permission(&permission))
            .await?;
        let record = match existing {
            Some(record) if record.is_live() => {
                return Err(Error::Conflict(format!(
                    "permission {permission} already exists"
                )));
            }
            Some(mut record) => {
                record.lifecycle.reactivate(now);
                record.description = description.map(str::to_string);
                record
            }
            None => PermissionRecord {
                description: description.map(str::to_string),
                ..PermissionRecord::new(permission, now)
            },
        };
        self.call(
            deadline,
            "save permission",
            self.store.save_permission(record.clone()),
        )
        .await?;
        Ok(record)
    }

    /// Looks up a live permission record by its key.
    pub async fn find_permission(&self, permission: &Permission) -> Result<PermissionRecord> {
        self.call(
            self.deadline(),
            "find permission",
            self.store.find_permission(permission),
        )
        .await?
        .filter(PermissionRecord::is_live)
        .ok_or_else(|| Error::not_found("permission", permission))
    }

    /// Links a permission to a role. Idempotent: an existing live link is
    /// returned unchanged.
    pub async fn assign_permission(
        &self,
        actor: &PrincipalId,
        role: &RoleId,
        permission: &PermissionId,
    ) -> Result<RolePermission> {
        let deadline = self.deadline();
        let result = self
            .try_assign_permission(actor, role, permission, deadline)
            .await;
        if let Ok((role, _, true)) = &result {
            self.invalidate_role_holders(role, deadline).await;
        }
        let result = result.map(|(_, link, _)| link);
        self.record_mutation(
            deadline,
            actor,
            "role_permission.assign",
            "role",
            role.as_str(),
            &result,
            &[("permission", permission.to_string())],
        )
        .await;
        result
    }

    async fn try_assign_permission(
        &self,
        actor: &PrincipalId,
        role_id: &RoleId,
        permission_id: &PermissionId,
        deadline: Deadline,
    ) -> Result<(Role, RolePermission, bool)> {
        let role = self.live_role(role_id, deadline).await?;
        self.call(deadline, "load permission", self.store.permission(permission_id))
            .await?
            .filter(PermissionRecord::is_live)
            .ok_or_else(|| Error::not_found("permission", permission_id))?;

        let now = Utc::now();
        let links = self
            .call(deadline, "load role permissions", self.store.role_permissions(role_id))
            .await?;
        let link = match links
            .into_iter()
            .find(|link| &link.permission_id == permission_id)
        {
            Some(link) if link.lifecycle.is_live() => return Ok((role, link, false)),
            Some(mut link) => {
                link.lifecycle.reactivate(now);
                link.granted_by = actor.clone();
                link
            }
            None => RolePermission {
                role_id: role_id.clone(),
                permission_id: permission_id.clone(),
                granted_by: actor.clone(),
                lifecycle: Lifecycle::created(now),
            },
        };
        self.call(
            deadline,
            "save role permission",
            self.store.save_role_permission(link.clone()),
        )
        .await?;
        Ok((role, link, true))
    }

    /// Unlinks a permission from a role. Removing an absent link succeeds.
    pub async fn remove_permission(
        &self,
        actor: &PrincipalId,
        role: &RoleId,
        permission: &PermissionId,
    ) -> Result<()> {
        let deadline = self.deadline();
        let result = self.try_remove_permission(role, permission, deadline).await;
        if let Ok(Some(role)) = &result {
            self.invalidate_role_holders(role, deadline).await;
        }
        let result = result.map(|_| ());
        self.record_mutation(
            deadline,
            actor,
            "role_permission.remove",
            "role",
            role.as_str(),
            &result,
            &[("permission", permission.to_string())],
        )
        .await;
        result
    }

    async fn try_remove_permission(
        &self,
        role_id: &RoleId,
        permission_id: &PermissionId,
        deadline: Deadline,
    ) -> Result<Option<Role>> {
        let role = self.live_role(role_id, deadline).await?;
        let links = self
            .call(deadline, "load role permissions", self.store.role_permissions(role_id))
            .await?;
        let Some(mut link) = links
            .into_iter()
            .find(|link| &link.permission_id == permission_id && link.lifecycle.is_live())
        else {
            return Ok(None);
        };
        link.lifecycle.soft_delete(Utc::now());
        self.call(
            deadline,
            "save role permission",
            self.store.save_role_permission(link),
        )
        .await?;
        Ok(Some(role))
    }

    /// Makes `child` inherit every permission of `parent`.
    ///
    /// Rejects links that would close a cycle or push the chain past the
    /// depth bound.
    pub async fn add_child_role(
        &self,
        actor: &PrincipalId,
        parent: &RoleId,
        child: &RoleId,
    ) -> Result<Role> {
        let deadline = self.deadline();
        let result = self.try_add_child_role(parent, child, deadline).await;
        if let Ok(role) = &result {
            self.invalidate_role_holders(role, deadline).await;
        }
        self.record_mutation(
            deadline,
            actor,
            "role.add_child",
            "role",
            child.as_str(),
            &result,
            &[("parent", parent.to_string())],
        )
        .await;
        result
    }

    async fn try_add_child_role(
        &self,
        parent_id: &RoleId,
        child_id: &RoleId,
        deadline: Deadline,
    ) -> Result<Role> {
        if parent_id == child_id {
            return Err(Error::CycleDetected {
                kind: "role",
                id: child_id.to_string(),
            });
        }
        let parent = self.live_role(parent_id, deadline).await?;
        let mut child = self.live_role(child_id, deadline).await?;
        if let Some(organization) = parent.scope.organization()
            && child.scope.organization() != Some(organization)
        {
            return Err(Error::Validation(format!(
                "role {child_id} in {} cannot inherit from role {parent_id} in {}",
                child.scope, parent.scope
            )));
        }

        let ancestors = self.role_chain(parent, deadline).await?;
        if ancestors.iter().any(|ancestor| &ancestor.id == child_id) {
            return Err(Error::CycleDetected {
                kind: "role",
                id: child_id.to_string(),
            });
        }
        let below = self
            .subtree_height::<Role, _, _>(
                child_id.clone(),
                deadline,
                "load child roles",
                move |id: RoleId| async move { self.store.child_roles(&id).await },
            )
            .await?;
        self.check_link_depth("role", child_id, ancestors.len(), below)?;

        child.parent_id = Some(parent_id.clone());
        child.lifecycle.updated_at = Utc::now();
        self.call(deadline, "save role", self.store.save_role(child.clone()))
            .await?;
        Ok(child)
    }

    /// Detaches a role from its parent.
    pub async fn remove_parent_role(&self, actor: &PrincipalId, child: &RoleId) -> Result<Role> {
        let deadline = self.deadline();
        let result = async {
            let mut role = self.live_role(child, deadline).await?;
            if role.parent_id.take().is_some() {
                role.lifecycle.updated_at = Utc::now();
                self.call(deadline, "save role", self.store.save_role(role.clone()))
                    .await?;
            }
            Ok::<_, Error>(role)
        }
        .await;
        if let Ok(role) = &result {
            self.invalidate_role_holders(role, deadline).await;
        }
        self.record_mutation(deadline, actor, "role.remove_parent", "role", child.as_str(), &result, &[])
            .await;
        result
    }

    /// Ancestors of a role, nearest first. Stops at the first inactive role.
    pub async fn role_ancestors(&self, id: &RoleId) -> Result<Vec<Role>> {
        let deadline = self.deadline();
        let role = self.live_role(id, deadline).await?;
        Ok(self
            .role_chain(role, deadline)
            .await?
            .into_iter()
            .skip(1)
            .take_while(Role::is_live)
            .collect())
    }

    /// Live roles inheriting from `id`, breadth first.
    pub async fn role_descendants(&self, id: &RoleId) -> Result<Vec<Role>> {
        let deadline = self.deadline();
        self.live_role(id, deadline).await?;
        self.role_descendants_within(id, deadline).await
    }
}
