use crate::error::StoreError;
use crate::model::{
    Group, GroupMembership, GroupRole, Organization, PermissionRecord, Role, RolePermission,
    RoleScope, UserRole,
};
use crate::permission::Permission;
use crate::types::{GroupId, OrganizationId, PermissionId, PrincipalId, RoleId};
use async_trait::async_trait;

/// Store interface for the organization and group trees.
///
/// Parent links are plain ids resolved at traversal time; the store does
/// not enforce acyclicity itself.
#[async_trait]
pub trait HierarchyStore {
    /// Loads an organization, including soft-deleted ones.
    async fn organization(
        &self,
        id: &OrganizationId,
    ) -> std::result::Result<Option<Organization>, StoreError>;

    /// Inserts or replaces an organization.
    async fn save_organization(
        &self,
        organization: Organization,
    ) -> std::result::Result<(), StoreError>;

    /// Returns organizations whose parent is `id`.
    async fn child_organizations(
        &self,
        id: &OrganizationId,
    ) -> std::result::Result<Vec<Organization>, StoreError>;

    /// Loads a group, including soft-deleted ones.
    async fn group(&self, id: &GroupId) -> std::result::Result<Option<Group>, StoreError>;

    /// Inserts or replaces a group.
    async fn save_group(&self, group: Group) -> std::result::Result<(), StoreError>;

    /// Returns groups whose parent is `id`.
    async fn child_groups(&self, id: &GroupId) -> std::result::Result<Vec<Group>, StoreError>;

    /// Returns all groups belonging to an organization.
    async fn organization_groups(
        &self,
        id: &OrganizationId,
    ) -> std::result::Result<Vec<Group>, StoreError>;
}

/// Store interface for roles, permissions and their links.
#[async_trait]
pub trait RoleStore {
    /// Loads a role, including soft-deleted ones.
    async fn role(&self, id: &RoleId) -> std::result::Result<Option<Role>, StoreError>;

    /// Finds a live role by name within a scope.
    async fn find_role(
        &self,
        scope: &RoleScope,
        name: &str,
    ) -> std::result::Result<Option<Role>, StoreError>;

    /// Inserts or replaces a role.
    async fn save_role(&self, role: Role) -> std::result::Result<(), StoreError>;

    /// Returns roles whose parent is `id`.
    async fn child_roles(&self, id: &RoleId) -> std::result::Result<Vec<Role>, StoreError>;

    /// Loads a permission record.
    async fn permission(
        &self,
        id: &PermissionId,
    ) -> std::result::Result<Option<PermissionRecord>, StoreError>;

    /// Finds a permission record by its `(resource, action)` key.
    async fn find_permission(
        &self,
        permission: &Permission,
    ) -> std::result::Result<Option<PermissionRecord>, StoreError>;

    /// Inserts or replaces a permission record.
    async fn save_permission(
        &self,
        record: PermissionRecord,
    ) -> std::result::Result<(), StoreError>;

    /// Returns permission links of a role, active or not.
    async fn role_permissions(
        &self,
        role: &RoleId,
    ) -> std::result::Result<Vec<RolePermission>, StoreError>;

    /// Inserts or replaces the link keyed by `(role_id, permission_id)`.
    async fn save_role_permission(
        &self,
        link: RolePermission,
    ) -> std::result::Result<(), StoreError>;
}

/// Store interface for memberships and role assignments.
#[async_trait]
pub trait AssignmentStore {
    /// Memberships held by a principal, active or not.
    async fn principal_memberships(
        &self,
        principal: &PrincipalId,
    ) -> std::result::Result<Vec<GroupMembership>, StoreError>;

    /// Memberships of a group, active or not.
    async fn group_memberships(
        &self,
        group: &GroupId,
    ) -> std::result::Result<Vec<GroupMembership>, StoreError>;

    /// Inserts or replaces the membership keyed by `(group_id, principal_id)`.
    async fn save_membership(
        &self,
        membership: GroupMembership,
    ) -> std::result::Result<(), StoreError>;

    /// Role grants on a group, active or not.
    async fn group_roles(&self, group: &GroupId)
    -> std::result::Result<Vec<GroupRole>, StoreError>;

    /// Group grants referencing a role, active or not.
    async fn role_group_grants(
        &self,
        role: &RoleId,
    ) -> std::result::Result<Vec<GroupRole>, StoreError>;

    /// Inserts or replaces the grant keyed by `(group_id, role_id)`.
    async fn save_group_role(&self, grant: GroupRole) -> std::result::Result<(), StoreError>;

    /// Direct grants held by a principal, active or not.
    async fn principal_roles(
        &self,
        principal: &PrincipalId,
    ) -> std::result::Result<Vec<UserRole>, StoreError>;

    /// Direct grants referencing a role, active or not.
    async fn role_holders(&self, role: &RoleId) -> std::result::Result<Vec<UserRole>, StoreError>;

    /// Inserts or replaces the grant keyed by `(principal_id, role_id)`.
    async fn save_user_role(&self, grant: UserRole) -> std::result::Result<(), StoreError>;
}

/// Composite store trait.
pub trait Store: HierarchyStore + RoleStore + AssignmentStore + Send + Sync {}

impl<T> Store for T where T: HierarchyStore + RoleStore + AssignmentStore + Send + Sync {}
