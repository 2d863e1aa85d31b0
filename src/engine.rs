use crate::audit::{AuditEntry, AuditOutcome, AuditSink, NoAudit};
use crate::cache::{Cache, CacheKey, NoCache};
use crate::error::{Error, Result, StoreError};
use crate::permission::Permission;
use crate::resolver::{EffectivePermissions, GrantPath};
use crate::store::Store;
use crate::types::{GroupId, OrganizationId, PrincipalId};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Permission is granted.
    Allow,
    /// Permission is denied after evaluation.
    Deny,
    /// Evaluation could not complete; treated as deny.
    Undetermined,
}

/// Outcome of an authorization check.
///
/// `Denied` is a business result and must not be retried; `Undetermined`
/// means the engine failed closed on an infrastructure problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Allowed { reason: String, path: GrantPath },
    Denied { reason: String },
    Undetermined { reason: String, retryable: bool },
}

impl Authorization {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn decision(&self) -> Decision {
        match self {
            Self::Allowed { .. } => Decision::Allow,
            Self::Denied { .. } => Decision::Deny,
            Self::Undetermined { .. } => Decision::Undetermined,
        }
    }

    /// Human-readable explanation.
    pub fn reason(&self) -> &str {
        match self {
            Self::Allowed { reason, .. }
            | Self::Denied { reason }
            | Self::Undetermined { reason, .. } => reason,
        }
    }

    fn undetermined(error: &Error) -> Self {
        Self::Undetermined {
            reason: format!("could not determine: {error}"),
            retryable: error.is_retryable(),
        }
    }

    fn audit_outcome(&self) -> (&'static str, AuditOutcome) {
        match self {
            Self::Allowed { .. } => ("authorize", AuditOutcome::Allowed),
            Self::Denied { .. } => ("access_denied", AuditOutcome::Denied),
            Self::Undetermined { .. } => ("authorize", AuditOutcome::Undetermined),
        }
    }
}

/// Tunables for [`Engine`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Bound for every parent-chain walk (groups, organizations, roles).
    pub max_depth: usize,
    /// Honour `*` resource/action segments when matching.
    pub enable_wildcard: bool,
    /// Default deadline for the store/cache/audit calls of one operation.
    pub call_timeout: Option<Duration>,
    /// Holder count above which role mutations drop the organization (or,
    /// for global roles, the whole cache) instead of single principals.
    pub broad_role_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 32,
            enable_wildcard: true,
            call_timeout: None,
            broad_role_threshold: 256,
        }
    }
}

/// Absolute deadline shared by every call of one operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout: Option<Duration>) -> Self {
        Self(timeout.map(|timeout| Instant::now() + timeout))
    }

    fn remaining(self) -> Option<Duration> {
        self.0
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Authorization engine over a pluggable store, cache and audit sink.
#[derive(Debug)]
pub struct Engine<S, C = NoCache, A = NoAudit> {
    pub(crate) store: S,
    cache: C,
    audit: A,
    pub(crate) config: EngineConfig,
    audit_failures: AtomicU64,
    cache_failures: AtomicU64,
}

/// Builder for [`Engine`].
pub struct EngineBuilder<S, C = NoCache, A = NoAudit> {
    store: S,
    cache: C,
    audit: A,
    config: EngineConfig,
}

impl<S> EngineBuilder<S, NoCache, NoAudit> {
    /// Creates a new builder with default configuration.
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: NoCache,
            audit: NoAudit,
            config: EngineConfig::default(),
        }
    }
}

impl<S, C, A> EngineBuilder<S, C, A> {
    /// Replaces the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets maximum hierarchy depth.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.config.max_depth = depth;
        self
    }

    /// Enables or disables wildcard permission matching.
    pub fn enable_wildcard(mut self, on: bool) -> Self {
        self.config.enable_wildcard = on;
        self
    }

    /// Sets the default per-operation deadline.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// Sets the holder count above which role changes invalidate in bulk.
    pub fn broad_role_threshold(mut self, threshold: usize) -> Self {
        self.config.broad_role_threshold = threshold;
        self
    }

    /// Sets the cache implementation.
    pub fn cache<C2: Cache>(self, cache: C2) -> EngineBuilder<S, C2, A> {
        EngineBuilder {
            store: self.store,
            cache,
            audit: self.audit,
            config: self.config,
        }
    }

    /// Sets the audit sink.
    pub fn audit<A2: AuditSink>(self, audit: A2) -> EngineBuilder<S, C, A2> {
        EngineBuilder {
            store: self.store,
            cache: self.cache,
            audit,
            config: self.config,
        }
    }

    /// Builds the engine.
    pub fn build(self) -> Engine<S, C, A> {
        Engine {
            store: self.store,
            cache: self.cache,
            audit: self.audit,
            config: self.config,
            audit_failures: AtomicU64::new(0),
            cache_failures: AtomicU64::new(0),
        }
    }
}

enum CheckTarget {
    Inactive(String),
    Resolved(Arc<EffectivePermissions>),
}

impl<S, C, A> Engine<S, C, A>
where
    S: Store,
    C: Cache,
    A: AuditSink,
{
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Underlying store, for read access by callers.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Number of audit entries that could not be written.
    pub fn audit_failures(&self) -> u64 {
        self.audit_failures.load(Ordering::Relaxed)
    }

    /// Number of cache calls that failed and were treated as misses.
    pub fn cache_failures(&self) -> u64 {
        self.cache_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn deadline(&self) -> Deadline {
        Deadline::after(self.config.call_timeout)
    }

    /// Runs a store call under the deadline, attaching operation context.
    pub(crate) async fn call<T, F>(
        &self,
        deadline: Deadline,
        operation: &'static str,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        let result = match deadline.remaining() {
            None => fut.await,
            Some(remaining) if remaining.is_zero() => return Err(Error::Timeout { operation }),
            Some(remaining) => tokio::time::timeout(remaining, fut)
                .await
                .map_err(|_| Error::Timeout { operation })?,
        };
        result.map_err(|source| Error::Store { operation, source })
    }

    /// Authorizes a principal for a permission within an organization.
    pub async fn authorize(
        &self,
        principal: &PrincipalId,
        organization: &OrganizationId,
        permission: &Permission,
    ) -> Authorization {
        self.authorize_with_timeout(principal, organization, permission, self.config.call_timeout)
            .await
    }

    /// Like [`Engine::authorize`] with a caller-supplied deadline.
    pub async fn authorize_with_timeout(
        &self,
        principal: &PrincipalId,
        organization: &OrganizationId,
        permission: &Permission,
        timeout: Option<Duration>,
    ) -> Authorization {
        let deadline = Deadline::after(timeout);
        self.decide(principal, organization, None, std::slice::from_ref(permission), deadline)
            .await
            .pop()
            .unwrap_or_else(|| Authorization::Denied {
                reason: "no applicable grants".to_string(),
            })
    }

    /// Authorizes within a target group: group-derived grants count only for
    /// memberships at or beneath that group.
    pub async fn authorize_in_group(
        &self,
        principal: &PrincipalId,
        organization: &OrganizationId,
        group: &GroupId,
        permission: &Permission,
    ) -> Authorization {
        self.decide(
            principal,
            organization,
            Some(group),
            std::slice::from_ref(permission),
            self.deadline(),
        )
        .await
        .pop()
        .unwrap_or_else(|| Authorization::Denied {
            reason: "no applicable grants".to_string(),
        })
    }

    /// Checks several permissions against one resolution.
    pub async fn authorize_many(
        &self,
        principal: &PrincipalId,
        organization: &OrganizationId,
        permissions: &[Permission],
    ) -> Vec<Authorization> {
        self.decide(principal, organization, None, permissions, self.deadline())
            .await
    }

    /// Authorizes an HTTP request by mapping its method and path to a permission.
    pub async fn authorize_endpoint(
        &self,
        principal: &PrincipalId,
        organization: &OrganizationId,
        method: &str,
        path: &str,
    ) -> Authorization {
        match Permission::from_endpoint(method, path) {
            Ok(permission) => self.authorize(principal, organization, &permission).await,
            Err(err) => Authorization::Denied {
                reason: format!("endpoint {method} {path} has no valid permission: {err}"),
            },
        }
    }

    /// Authorizes `action` on `resource`. Unparseable input is denied.
    pub async fn authorize_action(
        &self,
        principal: &PrincipalId,
        organization: &OrganizationId,
        resource: &str,
        action: &str,
    ) -> Authorization {
        match Permission::from_parts(resource, action) {
            Ok(permission) => self.authorize(principal, organization, &permission).await,
            Err(err) => Authorization::Denied {
                reason: format!("invalid permission {resource}:{action}: {err}"),
            },
        }
    }

    async fn decide(
        &self,
        principal: &PrincipalId,
        organization: &OrganizationId,
        group: Option<&GroupId>,
        permissions: &[Permission],
        deadline: Deadline,
    ) -> Vec<Authorization> {
        let outcomes: Vec<Authorization> = match self
            .check_target(principal, organization, group, deadline)
            .await
        {
            Ok(CheckTarget::Inactive(reason)) => permissions
                .iter()
                .map(|_| Authorization::Denied {
                    reason: reason.clone(),
                })
                .collect(),
            Ok(CheckTarget::Resolved(effective)) => permissions
                .iter()
                .map(|permission| effective.decide(permission, self.config.enable_wildcard))
                .collect(),
            Err(err) => {
                warn!(%principal, %organization, error = %err, "authorization undetermined");
                permissions
                    .iter()
                    .map(|_| Authorization::undetermined(&err))
                    .collect()
            }
        };

        for (permission, outcome) in permissions.iter().zip(&outcomes) {
            debug!(
                %principal,
                %organization,
                %permission,
                decision = ?outcome.decision(),
                reason = outcome.reason(),
                "authorization evaluated"
            );
            let (action, audit_outcome) = outcome.audit_outcome();
            let mut entry =
                AuditEntry::new(principal.clone(), action, permission.resource(), audit_outcome)
                    .with_reason(outcome.reason())
                    .with_detail("organization", organization)
                    .with_detail("permission", permission);
            if let Some(group) = group {
                entry = entry.with_detail("group", group);
            }
            self.emit(entry, deadline).await;
        }
        outcomes
    }

    async fn check_target(
        &self,
        principal: &PrincipalId,
        organization: &OrganizationId,
        group: Option<&GroupId>,
        deadline: Deadline,
    ) -> Result<CheckTarget> {
        let org = self
            .call(deadline, "load organization", self.store.organization(organization))
            .await?;
        match org {
            None => {
                return Ok(CheckTarget::Inactive(format!(
                    "organization {organization} not found"
                )));
            }
            Some(org) if !org.is_live() => {
                return Ok(CheckTarget::Inactive(format!(
                    "organization {organization} is not active"
                )));
            }
            Some(_) => {}
        }
        if let Some(group_id) = group {
            let target = self
                .call(deadline, "load group", self.store.group(group_id))
                .await?;
            let in_org = target
                .as_ref()
                .is_some_and(|target| target.is_live() && &target.organization_id == organization);
            if !in_org {
                return Ok(CheckTarget::Inactive(format!(
                    "group {group_id} is not an active group of organization {organization}"
                )));
            }
        }

        let effective = self
            .effective_permissions_within(principal, Some(organization), group, deadline)
            .await?;
        Ok(CheckTarget::Resolved(effective))
    }

    /// Resolves effective roles and permissions, consulting the cache first.
    ///
    /// `organization = None` resolves global grants only.
    pub async fn effective_permissions(
        &self,
        principal: &PrincipalId,
        organization: Option<&OrganizationId>,
        group: Option<&GroupId>,
    ) -> Result<Arc<EffectivePermissions>> {
        self.effective_permissions_within(principal, organization, group, self.deadline())
            .await
    }

    pub(crate) async fn effective_permissions_within(
        &self,
        principal: &PrincipalId,
        organization: Option<&OrganizationId>,
        group: Option<&GroupId>,
        deadline: Deadline,
    ) -> Result<Arc<EffectivePermissions>> {
        let key = CacheKey::new(principal, organization, group);
        match self.call(deadline, "cache get", self.cache.get(&key)).await {
            Ok(Some(cached)) if cached.is_fresh_at(Utc::now()) => {
                debug!(%principal, "effective permissions served from cache");
                return Ok(cached);
            }
            Ok(_) => {}
            Err(err) => self.cache_failed("get", &err),
        }

        let resolved = Arc::new(
            self.resolve(principal, organization, group, deadline)
                .await?,
        );
        if let Err(err) = self
            .call(deadline, "cache set", self.cache.set(key, resolved.clone()))
            .await
        {
            self.cache_failed("set", &err);
        }
        Ok(resolved)
    }

    fn cache_failed(&self, operation: &str, err: &Error) {
        self.cache_failures.fetch_add(1, Ordering::Relaxed);
        warn!(operation, error = %err, "cache call failed; falling back to store");
    }

    /// Best-effort invalidation of one principal's cached resolutions.
    pub(crate) async fn invalidate_principal(&self, principal: &PrincipalId, deadline: Deadline) {
        if let Err(err) = self
            .call(
                deadline,
                "cache invalidate principal",
                self.cache.invalidate_principal(principal),
            )
            .await
        {
            self.cache_failed("invalidate principal", &err);
        }
    }

    /// Best-effort invalidation of an organization's cached resolutions.
    pub(crate) async fn invalidate_organization(
        &self,
        organization: &OrganizationId,
        deadline: Deadline,
    ) {
        if let Err(err) = self
            .call(
                deadline,
                "cache invalidate organization",
                self.cache.invalidate_organization(organization),
            )
            .await
        {
            self.cache_failed("invalidate organization", &err);
        }
    }

    /// Best-effort flush of every cached resolution.
    pub(crate) async fn invalidate_all(&self, deadline: Deadline) {
        if let Err(err) = self
            .call(deadline, "cache invalidate all", self.cache.invalidate_all())
            .await
        {
            self.cache_failed("invalidate all", &err);
        }
    }

    /// Appends an audit entry within the operation's deadline. Failures are
    /// logged and counted, never returned.
    pub(crate) async fn emit(&self, entry: AuditEntry, deadline: Deadline) {
        let action = entry.action.clone();
        if let Err(err) = self
            .call(deadline, "audit append", self.audit.append(entry))
            .await
        {
            self.audit_failures.fetch_add(1, Ordering::Relaxed);
            error!(action, error = %err, "audit write failed");
        }
    }

    /// Audits a mutation result and logs committed changes.
    pub(crate) async fn record_mutation<T>(
        &self,
        deadline: Deadline,
        actor: &PrincipalId,
        action: &'static str,
        resource_type: &'static str,
        resource_id: &str,
        result: &Result<T>,
        detail: &[(&'static str, String)],
    ) {
        let mut entry = match result {
            Ok(_) => {
                info!(%actor, action, resource_id, "mutation committed");
                AuditEntry::new(actor.clone(), action, resource_type, AuditOutcome::Success)
            }
            Err(err) => {
                debug!(%actor, action, resource_id, error = %err, "mutation rejected");
                AuditEntry::new(actor.clone(), action, resource_type, AuditOutcome::Failure)
                    .with_reason(err.to_string())
            }
        }
        .with_resource_id(resource_id);
        for (key, value) in detail {
            entry = entry.with_detail(*key, value);
        }
        self.emit(entry, deadline).await;
    }
}
