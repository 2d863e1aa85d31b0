use crate::error::StoreError;
use crate::resolver::EffectivePermissions;
use crate::types::{GroupId, OrganizationId, PrincipalId};
use async_trait::async_trait;
use std::sync::Arc;

/// Cache key: one resolution per principal, organization and target group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub principal: PrincipalId,
    pub organization: Option<OrganizationId>,
    pub group: Option<GroupId>,
}

impl CacheKey {
    pub fn new(
        principal: &PrincipalId,
        organization: Option<&OrganizationId>,
        group: Option<&GroupId>,
    ) -> Self {
        Self {
            principal: principal.clone(),
            organization: organization.cloned(),
            group: group.cloned(),
        }
    }
}

/// Cache interface for resolved effective permissions.
///
/// Errors are reported to the engine, which logs them and falls back to the
/// store; a failing cache never fails an authorization.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Gets a cached resolution.
    async fn get(
        &self,
        key: &CacheKey,
    ) -> std::result::Result<Option<Arc<EffectivePermissions>>, StoreError>;

    /// Stores a resolution.
    async fn set(
        &self,
        key: CacheKey,
        value: Arc<EffectivePermissions>,
    ) -> std::result::Result<(), StoreError>;

    /// Drops every entry of a principal.
    async fn invalidate_principal(
        &self,
        principal: &PrincipalId,
    ) -> std::result::Result<(), StoreError>;

    /// Drops every entry resolved within an organization.
    async fn invalidate_organization(
        &self,
        organization: &OrganizationId,
    ) -> std::result::Result<(), StoreError>;

    /// Drops everything.
    async fn invalidate_all(&self) -> std::result::Result<(), StoreError>;
}

/// No-op cache implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

#[async_trait]
impl Cache for NoCache {
    async fn get(
        &self,
        _key: &CacheKey,
    ) -> std::result::Result<Option<Arc<EffectivePermissions>>, StoreError> {
        Ok(None)
    }

    async fn set(
        &self,
        _key: CacheKey,
        _value: Arc<EffectivePermissions>,
    ) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    async fn invalidate_principal(
        &self,
        _principal: &PrincipalId,
    ) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    async fn invalidate_organization(
        &self,
        _organization: &OrganizationId,
    ) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    async fn invalidate_all(&self) -> std::result::Result<(), StoreError> {
        Ok(())
    }
}
