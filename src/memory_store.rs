use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{
    Group, GroupMembership, GroupRole, Organization, PermissionRecord, Role, RolePermission,
    RoleScope, UserRole,
};
use crate::permission::Permission;
use crate::store::{AssignmentStore, HierarchyStore, RoleStore};
use crate::types::{GroupId, OrganizationId, PermissionId, PrincipalId, RoleId};

/// In-memory store implementation for tests and demos.
///
/// Every record write is atomic on its own. `set_unavailable` and
/// `set_latency` simulate a degraded backend.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    organizations: RwLock<HashMap<OrganizationId, Organization>>,
    groups: RwLock<HashMap<GroupId, Group>>,
    roles: RwLock<HashMap<RoleId, Role>>,
    permissions: RwLock<HashMap<PermissionId, PermissionRecord>>,
    role_permissions: RwLock<HashMap<(RoleId, PermissionId), RolePermission>>,
    memberships: RwLock<HashMap<(GroupId, PrincipalId), GroupMembership>>,
    group_roles: RwLock<HashMap<(GroupId, RoleId), GroupRole>>,
    user_roles: RwLock<HashMap<(PrincipalId, RoleId), UserRole>>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

fn poisoned() -> StoreError {
    "memory store lock poisoned".into()
}

fn read<T>(lock: &RwLock<T>) -> std::result::Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read().map_err(|_| poisoned())
}

fn write<T>(lock: &RwLock<T>) -> std::result::Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write().map_err(|_| poisoned())
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delays every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        let millis = latency.map_or(0, |latency| latency.as_millis() as u64);
        self.inner.latency_ms.store(millis, Ordering::SeqCst);
    }

    async fn io(&self) -> std::result::Result<(), StoreError> {
        let millis = self.inner.latency_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err("memory store unavailable".into());
        }
        Ok(())
    }
}

fn sorted_by<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_by_key(key);
    items
}

#[async_trait]
impl HierarchyStore for MemoryStore {
    async fn organization(
        &self,
        id: &OrganizationId,
    ) -> std::result::Result<Option<Organization>, StoreError> {
        self.io().await?;
        Ok(read(&self.inner.organizations)?.get(id).cloned())
    }

    async fn save_organization(
        &self,
        organization: Organization,
    ) -> std::result::Result<(), StoreError> {
        self.io().await?;
        write(&self.inner.organizations)?.insert(organization.id.clone(), organization);
        Ok(())
    }

    async fn child_organizations(
        &self,
        id: &OrganizationId,
    ) -> std::result::Result<Vec<Organization>, StoreError> {
        self.io().await?;
        let guard = read(&self.inner.organizations)?;
        let children = guard
            .values()
            .filter(|org| org.parent_id.as_ref() == Some(id))
            .cloned()
            .collect();
        Ok(sorted_by(children, |org: &Organization| org.id.clone()))
    }

    async fn group(&self, id: &GroupId) -> std::result::Result<Option<Group>, StoreError> {
        self.io().await?;
        Ok(read(&self.inner.groups)?.get(id).cloned())
    }

    async fn save_group(&self, group: Group) -> std::result::Result<(), StoreError> {
        self.io().await?;
        write(&self.inner.groups)?.insert(group.id.clone(), group);
        Ok(())
    }

    async fn child_groups(&self, id: &GroupId) -> std::result::Result<Vec<Group>, StoreError> {
        self.io().await?;
        let guard = read(&self.inner.groups)?;
        let children = guard
            .values()
            .filter(|group| group.parent_id.as_ref() == Some(id))
            .cloned()
            .collect();
        Ok(sorted_by(children, |group: &Group| group.id.clone()))
    }

    async fn organization_groups(
        &self,
        id: &OrganizationId,
    ) -> std::result::Result<Vec<Group>, StoreError> {
        self.io().await?;
        let guard = read(&self.inner.groups)?;
        let groups = guard
            .values()
            .filter(|group| &group.organization_id == id)
            .cloned()
            .collect();
        Ok(sorted_by(groups, |group: &Group| group.id.clone()))
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn role(&self, id: &RoleId) -> std::result::Result<Option<Role>, StoreError> {
        self.io().await?;
        Ok(read(&self.inner.roles)?.get(id).cloned())
    }

    async fn find_role(
        &self,
        scope: &RoleScope,
        name: &str,
    ) -> std::result::Result<Option<Role>, StoreError> {
        self.io().await?;
        let guard = read(&self.inner.roles)?;
        Ok(guard
            .values()
            .find(|role| role.is_live() && &role.scope == scope && role.name == name)
            .cloned())
    }

    async fn save_role(&self, role: Role) -> std::result::Result<(), StoreError> {
        self.io().await?;
        write(&self.inner.roles)?.insert(role.id.clone(), role);
        Ok(())
    }

    async fn child_roles(&self, id: &RoleId) -> std::result::Result<Vec<Role>, StoreError> {
        self.io().await?;
        let guard = read(&self.inner.roles)?;
        let children = guard
            .values()
            .filter(|role| role.parent_id.as_ref() == Some(id))
            .cloned()
            .collect();
        Ok(sorted_by(children, |role: &Role| role.id.clone()))
    }

    async fn permission(
        &self,
        id: &PermissionId,
    ) -> std::result::Result<Option<PermissionRecord>, StoreError> {
        self.io().await?;
        Ok(read(&self.inner.permissions)?.get(id).cloned())
    }

    async fn find_permission(
        &self,
        permission: &Permission,
    ) -> std::result::Result<Option<PermissionRecord>, StoreError> {
        self.io().await?;
        let guard = read(&self.inner.permissions)?;
        Ok(guard
            .values()
            .find(|record| &record.permission == permission)
            .cloned())
    }

    async fn save_permission(
        &self,
        record: PermissionRecord,
    ) -> std::result::Result<(), StoreError> {
        self.io().await?;
        write(&self.inner.permissions)?.insert(record.id.clone(), record);
        Ok(())
    }

    async fn role_permissions(
        &self,
        role: &RoleId,
    ) -> std::result::Result<Vec<RolePermission>, StoreError> {
        self.io().await?;
        let guard = read(&self.inner.role_permissions)?;
        let links = guard
            .values()
            .filter(|link| &link.role_id == role)
            .cloned()
            .collect();
        Ok(sorted_by(links, |link: &RolePermission| {
            link.permission_id.clone()
        }))
    }

    async fn save_role_permission(
        &self,
        link: RolePermission,
    ) -> std::result::Result<(), StoreError> {
        self.io().await?;
        let key = (link.role_id.clone(), link.permission_id.clone());
        write(&self.inner.role_permissions)?.insert(key, link);
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn principal_memberships(
        &self,
        principal: &PrincipalId,
    ) -> std::result::Result<Vec<GroupMembership>, StoreError> {
        self.io().await?;
        let guard = read(&self.inner.memberships)?;
        let memberships = guard
            .values()
            .filter(|membership| &membership.principal_id == principal)
            .cloned()
            .collect();
        Ok(sorted_by(memberships, |membership: &GroupMembership| {
            membership.group_id.clone()
        }))
    }

    async fn group_memberships(
        &self,
        group: &GroupId,
    ) -> std::result::Result<Vec<GroupMembership>, StoreError> {
        self.io().await?;
        let guard = read(&self.inner.memberships)?;
        let memberships = guard
            .values()
            .filter(|membership| &membership.group_id == group)
            .cloned()
            .collect();
        Ok(sorted_by(memberships, |membership: &GroupMembership| {
            membership.principal_id.clone()
        }))
    }

    async fn save_membership(
        &self,
        membership: GroupMembership,
    ) -> std::result::Result<(), StoreError> {
        self.io().await?;
        let key = (membership.group_id.clone(), membership.principal_id.clone());
        write(&self.inner.memberships)?.insert(key, membership);
        Ok(())
    }

    async fn group_roles(
        &self,
        group: &GroupId,
    ) -> std::result::Result<Vec<GroupRole>, StoreError> {
        self.io().await?;
        let guard = read(&self.inner.group_roles)?;
        let grants = guard
            .values()
            .filter(|grant| &grant.group_id == group)
            .cloned()
            .collect();
        Ok(sorted_by(grants, |grant: &GroupRole| grant.role_id.clone()))
    }

    async fn role_group_grants(
        &self,
        role: &RoleId,
    ) -> std::result::Result<Vec<GroupRole>, StoreError> {
        self.io().await?;
        let guard = read(&self.inner.group_roles)?;
        let grants = guard
            .values()
            .filter(|grant| &grant.role_id == role)
            .cloned()
            .collect();
        Ok(sorted_by(grants, |grant: &GroupRole| grant.group_id.clone()))
    }

    async fn save_group_role(&self, grant: GroupRole) -> std::result::Result<(), StoreError> {
        self.io().await?;
        let key = (grant.group_id.clone(), grant.role_id.clone());
        write(&self.inner.group_roles)?.insert(key, grant);
        Ok(())
    }

    async fn principal_roles(
        &self,
        principal: &PrincipalId,
    ) -> std::result::Result<Vec<UserRole>, StoreError> {
        self.io().await?;
        let guard = read(&self.inner.user_roles)?;
        let grants = guard
            .values()
            .filter(|grant| &grant.principal_id == principal)
            .cloned()
            .collect();
        Ok(sorted_by(grants, |grant: &UserRole| grant.role_id.clone()))
    }

    async fn role_holders(&self, role: &RoleId) -> std::result::Result<Vec<UserRole>, StoreError> {
        self.io().await?;
        let guard = read(&self.inner.user_roles)?;
        let grants = guard
            .values()
            .filter(|grant| &grant.role_id == role)
            .cloned()
            .collect();
        Ok(sorted_by(grants, |grant: &UserRole| grant.principal_id.clone()))
    }

    async fn save_user_role(&self, grant: UserRole) -> std::result::Result<(), StoreError> {
        self.io().await?;
        let key = (grant.principal_id.clone(), grant.role_id.clone());
        write(&self.inner.user_roles)?.insert(key, grant);
        Ok(())
    }
}
