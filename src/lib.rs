//! Multi-tenant hierarchical RBAC core.
//!
//! Organizations form a tree, groups form trees inside an organization, and
//! roles inherit from parent roles. A principal's effective permissions are
//! the union of direct role grants and grants made to every group it belongs
//! to, including groups above its membership. Decisions are fail-closed:
//! anything the [`Engine`] cannot determine is never treated as allowed.
//!
//! # Examples
//!
//! Basic authorization flow using the in-memory store (enable `memory-store`):
//! ```no_run
//! use rs_orgauthz::{EngineBuilder, Permission, Principal, PrincipalId, RoleScope, TimeWindow};
//! # #[cfg(feature = "memory-store")]
//! # async fn run() -> rs_orgauthz::Result<()> {
//! use rs_orgauthz::MemoryStore;
//! let engine = EngineBuilder::new(MemoryStore::new()).build();
//! let admin = PrincipalId::try_from("admin")?;
//!
//! let org = engine.create_organization(&admin, "Acme", "company", None).await?;
//! let group = engine.create_group(&admin, &org.id, "Engineering", None).await?;
//! let role = engine.create_role(&admin, "reader", RoleScope::Global).await?;
//! let read = engine
//!     .create_permission(&admin, Permission::try_from("users:read")?, None)
//!     .await?;
//! engine.assign_permission(&admin, &role.id, &read.id).await?;
//! engine.assign_role_to_group(&admin, &group.id, &role.id, TimeWindow::always()).await?;
//!
//! let user = Principal::user(PrincipalId::try_from("u1")?);
//! engine.add_group_member(&admin, &group.id, &user, TimeWindow::always()).await?;
//!
//! let outcome = engine.authorize_action(&user.id, &org.id, "users", "read").await;
//! assert!(outcome.is_allowed());
//! # Ok(())
//! # }
//! ```
//!
//! Creating a process-local cache (enable `memory-cache`):
//! ```no_run
//! # #[cfg(feature = "memory-cache")]
//! # {
//! use rs_orgauthz::MemoryCache;
//! use std::time::Duration;
//! let cache = MemoryCache::new(1024).with_ttl(Duration::from_secs(30));
//! # let _ = cache;
//! # }
//! ```
#![forbid(unsafe_code)]

mod audit;
mod cache;
mod engine;
mod error;
mod hierarchy;
mod membership;
mod model;
mod permission;
mod resolver;
mod roles;
mod store;
mod types;
#[cfg(feature = "memory-cache")]
mod memory_cache;

#[cfg(feature = "memory-store")]
mod memory_store;

#[cfg(feature = "session")]
pub mod session;

#[cfg(feature = "axum")]
pub mod axum;

pub use crate::audit::{
    AuditEntry, AuditOutcome, AuditPage, AuditQuery, AuditSink, MemoryAuditSink, NoAudit,
};
pub use crate::cache::{Cache, CacheKey, NoCache};
pub use crate::engine::{Authorization, Decision, Engine, EngineBuilder, EngineConfig};
pub use crate::error::{Error, ErrorKind, Result, StoreError};
pub use crate::model::{
    Group, GroupMembership, GroupRole, Lifecycle, Organization, PermissionRecord, Role,
    RolePermission, RoleScope, TimeWindow, UserRole,
};
pub use crate::permission::{DefaultPermissionValidator, Permission, PermissionValidator};
pub use crate::resolver::{
    EffectivePermission, EffectivePermissions, EffectiveRole, GrantPath, GrantSource, RoleRef,
};
pub use crate::store::{AssignmentStore, HierarchyStore, RoleStore, Store};
pub use crate::types::{
    GroupId, OrganizationId, PermissionId, Principal, PrincipalId, PrincipalType, RoleId,
    SessionId, TokenId,
};

#[cfg(feature = "memory-store")]
pub use crate::memory_store::MemoryStore;

#[cfg(feature = "memory-cache")]
pub use crate::memory_cache::MemoryCache;
