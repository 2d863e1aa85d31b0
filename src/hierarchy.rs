//! Organization and group trees.
//!
//! Parent links are plain ids. Every walk is bounded by
//! [`EngineConfig::max_depth`](crate::EngineConfig) and re-checks for cycles
//! at read time, so corrupted links surface as errors instead of loops.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::hash::Hash;

use chrono::Utc;
use tracing::warn;

use crate::audit::AuditSink;
use crate::cache::Cache;
use crate::engine::{Deadline, Engine};
use crate::error::{Error, Result, StoreError};
use crate::model::{Group, Organization, Role};
use crate::store::Store;
use crate::types::{GroupId, OrganizationId, PrincipalId, RoleId, validate_display_name};

/// Entity with an optional parent link.
pub(crate) trait TreeNode: Clone {
    type Id: Clone + Eq + Hash + fmt::Display;
    const KIND: &'static str;

    fn node_id(&self) -> &Self::Id;
    fn parent(&self) -> Option<&Self::Id>;
}

impl TreeNode for Organization {
    type Id = OrganizationId;
    const KIND: &'static str = "organization";

    fn node_id(&self) -> &OrganizationId {
        &self.id
    }

    fn parent(&self) -> Option<&OrganizationId> {
        self.parent_id.as_ref()
    }
}

impl TreeNode for Group {
    type Id = GroupId;
    const KIND: &'static str = "group";

    fn node_id(&self) -> &GroupId {
        &self.id
    }

    fn parent(&self) -> Option<&GroupId> {
        self.parent_id.as_ref()
    }
}

impl TreeNode for Role {
    type Id = RoleId;
    const KIND: &'static str = "role";

    fn node_id(&self) -> &RoleId {
        &self.id
    }

    fn parent(&self) -> Option<&RoleId> {
        self.parent_id.as_ref()
    }
}

impl<S, C, A> Engine<S, C, A>
where
    S: Store,
    C: Cache,
    A: AuditSink,
{
    /// Walks parent links from `start`, returning `[start, parent, ...]`.
    ///
    /// A missing parent ends the chain. Inactive nodes are included; callers
    /// decide whether they break inheritance.
    pub(crate) async fn ancestry<N, F, Fut>(
        &self,
        start: N,
        deadline: Deadline,
        operation: &'static str,
        mut load: F,
    ) -> Result<Vec<N>>
    where
        N: TreeNode,
        F: FnMut(N::Id) -> Fut,
        Fut: Future<Output = std::result::Result<Option<N>, StoreError>>,
    {
        let mut visited = HashSet::new();
        visited.insert(start.node_id().clone());
        let mut chain = vec![start];

        while let Some(parent_id) = chain.last().and_then(|node| node.parent().cloned()) {
            if chain.len() > self.config.max_depth {
                return Err(Error::DepthExceeded {
                    kind: N::KIND,
                    id: parent_id.to_string(),
                    max_depth: self.config.max_depth,
                });
            }
            if !visited.insert(parent_id.clone()) {
                return Err(Error::CycleDetected {
                    kind: N::KIND,
                    id: parent_id.to_string(),
                });
            }
            match self.call(deadline, operation, load(parent_id)).await? {
                Some(parent) => chain.push(parent),
                None => break,
            }
        }
        Ok(chain)
    }

    /// Levels below `root` (a leaf has height 0), counting children in any
    /// lifecycle state. Stops counting once past `max_depth`.
    pub(crate) async fn subtree_height<N, F, Fut>(
        &self,
        root: N::Id,
        deadline: Deadline,
        operation: &'static str,
        mut children: F,
    ) -> Result<usize>
    where
        N: TreeNode,
        F: FnMut(N::Id) -> Fut,
        Fut: Future<Output = std::result::Result<Vec<N>, StoreError>>,
    {
        let mut visited = HashSet::new();
        visited.insert(root.clone());
        let mut level = vec![root];
        let mut height = 0;

        while height <= self.config.max_depth {
            let mut next = Vec::new();
            for id in level {
                for child in self.call(deadline, operation, children(id)).await? {
                    if visited.insert(child.node_id().clone()) {
                        next.push(child.node_id().clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            height += 1;
            level = next;
        }
        Ok(height)
    }

    /// Rejects a link whose longest resulting chain exceeds `max_depth`:
    /// `above` nodes from the new parent up, `below` levels under the child.
    pub(crate) fn check_link_depth(
        &self,
        kind: &'static str,
        id: &impl fmt::Display,
        above: usize,
        below: usize,
    ) -> Result<()> {
        if above + below > self.config.max_depth {
            return Err(Error::DepthExceeded {
                kind,
                id: id.to_string(),
                max_depth: self.config.max_depth,
            });
        }
        Ok(())
    }

    /// Root-to-node chain of a group, confined to the group's organization.
    pub(crate) async fn group_chain(&self, group: Group, deadline: Deadline) -> Result<Vec<Group>> {
        let organization = group.organization_id.clone();
        let mut chain = self
            .ancestry(group, deadline, "load parent group", move |id| async move {
                self.store.group(&id).await
            })
            .await?;
        if let Some(foreign) = chain
            .iter()
            .position(|ancestor| ancestor.organization_id != organization)
        {
            warn!(
                group = %chain[foreign].id,
                %organization,
                "group chain crosses organizations; truncating"
            );
            chain.truncate(foreign);
        }
        chain.reverse();
        Ok(chain)
    }

    pub(crate) async fn group_hierarchy_within(
        &self,
        id: &GroupId,
        deadline: Deadline,
    ) -> Result<Vec<Group>> {
        let group = self
            .call(deadline, "load group", self.store.group(id))
            .await?
            .ok_or_else(|| Error::not_found("group", id))?;
        self.group_chain(group, deadline).await
    }

    async fn organization_chain(
        &self,
        organization: Organization,
        deadline: Deadline,
    ) -> Result<Vec<Organization>> {
        self.ancestry(
            organization,
            deadline,
            "load parent organization",
            move |id| async move { self.store.organization(&id).await },
        )
        .await
    }

    pub(crate) async fn live_organization(
        &self,
        id: &OrganizationId,
        deadline: Deadline,
    ) -> Result<Organization> {
        self.call(deadline, "load organization", self.store.organization(id))
            .await?
            .filter(Organization::is_live)
            .ok_or_else(|| Error::not_found("organization", id))
    }

    pub(crate) async fn live_group(&self, id: &GroupId, deadline: Deadline) -> Result<Group> {
        self.call(deadline, "load group", self.store.group(id))
            .await?
            .filter(Group::is_live)
            .ok_or_else(|| Error::not_found("group", id))
    }

    /// The group and every live descendant, breadth first.
    pub(crate) async fn group_subtree(&self, root: Group, deadline: Deadline) -> Result<Vec<Group>> {
        let mut visited = HashSet::new();
        visited.insert(root.id.clone());
        let mut queue = VecDeque::from([(root, 0usize)]);
        let mut subtree = Vec::new();

        while let Some((group, depth)) = queue.pop_front() {
            if depth < self.config.max_depth {
                let children = self
                    .call(deadline, "load child groups", self.store.child_groups(&group.id))
                    .await?;
                for child in children.into_iter().filter(Group::is_live) {
                    if visited.insert(child.id.clone()) {
                        queue.push_back((child, depth + 1));
                    }
                }
            }
            subtree.push(group);
        }
        Ok(subtree)
    }

    /// Creates an organization, optionally under a live parent.
    pub async fn create_organization(
        &self,
        actor: &PrincipalId,
        name: &str,
        org_type: &str,
        parent: Option<&OrganizationId>,
    ) -> Result<Organization> {
        let deadline = self.deadline();
        let result = self
            .try_create_organization(name, org_type, parent, deadline)
            .await;
        let id = result
            .as_ref()
            .map(|organization| organization.id.to_string())
            .unwrap_or_default();
        self.record_mutation(
            deadline,
            actor,
            "organization.create",
            "organization",
            &id,
            &result,
            &[("name", name.to_string())],
        )
        .await;
        result
    }

    async fn try_create_organization(
        &self,
        name: &str,
        org_type: &str,
        parent: Option<&OrganizationId>,
        deadline: Deadline,
    ) -> Result<Organization> {
        let name = validate_display_name(name, "organization name")?;
        let org_type = validate_display_name(org_type, "organization type")?;
        if let Some(parent_id) = parent {
            let parent = self.live_organization(parent_id, deadline).await?;
            let ancestors = self.organization_chain(parent, deadline).await?;
            self.check_link_depth("organization", parent_id, ancestors.len(), 0)?;
        }
        let organization = Organization::new(name, org_type, parent.cloned(), Utc::now());
        self.call(
            deadline,
            "save organization",
            self.store.save_organization(organization.clone()),
        )
        .await?;
        Ok(organization)
    }

    /// Re-parents an organization. Rejects cycles and depth overflow.
    pub async fn set_organization_parent(
        &self,
        actor: &PrincipalId,
        id: &OrganizationId,
        parent: Option<&OrganizationId>,
    ) -> Result<Organization> {
        let deadline = self.deadline();
        let result = self.try_set_organization_parent(id, parent, deadline).await;
        if result.is_ok() {
            self.invalidate_organization(id, deadline).await;
        }
        let parent_detail = parent.map(ToString::to_string).unwrap_or_default();
        self.record_mutation(
            deadline,
            actor,
            "organization.set_parent",
            "organization",
            id.as_str(),
            &result,
            &[("parent", parent_detail)],
        )
        .await;
        result
    }

    async fn try_set_organization_parent(
        &self,
        id: &OrganizationId,
        parent: Option<&OrganizationId>,
        deadline: Deadline,
    ) -> Result<Organization> {
        let mut organization = self.live_organization(id, deadline).await?;
        if let Some(parent_id) = parent {
            if parent_id == id {
                return Err(Error::CycleDetected {
                    kind: "organization",
                    id: id.to_string(),
                });
            }
            let parent = self.live_organization(parent_id, deadline).await?;
            let ancestors = self.organization_chain(parent, deadline).await?;
            if ancestors.iter().any(|ancestor| &ancestor.id == id) {
                return Err(Error::CycleDetected {
                    kind: "organization",
                    id: id.to_string(),
                });
            }
            let below = self
                .subtree_height::<Organization, _, _>(
                    id.clone(),
                    deadline,
                    "load child organizations",
                    move |id: OrganizationId| async move {
                        self.store.child_organizations(&id).await
                    },
                )
                .await?;
            self.check_link_depth("organization", id, ancestors.len(), below)?;
        }
        organization.parent_id = parent.cloned();
        organization.lifecycle.updated_at = Utc::now();
        self.call(
            deadline,
            "save organization",
            self.store.save_organization(organization.clone()),
        )
        .await?;
        Ok(organization)
    }

    /// Root-to-node chain of an organization.
    pub async fn get_organization_hierarchy(&self, id: &OrganizationId) -> Result<Vec<Organization>> {
        let deadline = self.deadline();
        let organization = self
            .call(deadline, "load organization", self.store.organization(id))
            .await?
            .ok_or_else(|| Error::not_found("organization", id))?;
        let mut chain = self.organization_chain(organization, deadline).await?;
        chain.reverse();
        Ok(chain)
    }

    /// Soft-deletes an organization without live child organizations or groups.
    pub async fn delete_organization(&self, actor: &PrincipalId, id: &OrganizationId) -> Result<()> {
        let deadline = self.deadline();
        let result = self.try_delete_organization(id, deadline).await;
        if result.is_ok() {
            self.invalidate_organization(id, deadline).await;
        }
        self.record_mutation(
            deadline,
            actor,
            "organization.delete",
            "organization",
            id.as_str(),
            &result,
            &[],
        )
        .await;
        result
    }

    async fn try_delete_organization(&self, id: &OrganizationId, deadline: Deadline) -> Result<()> {
        let mut organization = self.live_organization(id, deadline).await?;
        let children = self
            .call(
                deadline,
                "load child organizations",
                self.store.child_organizations(id),
            )
            .await?;
        let live_children = children.iter().filter(|child| child.is_live()).count();
        if live_children > 0 {
            return Err(Error::Conflict(format!(
                "organization {id} has {live_children} active child organizations"
            )));
        }
        let groups = self
            .call(deadline, "load organization groups", self.store.organization_groups(id))
            .await?;
        let live_groups = groups.iter().filter(|group| group.is_live()).count();
        if live_groups > 0 {
            return Err(Error::Conflict(format!(
                "organization {id} has {live_groups} active groups"
            )));
        }
        organization.lifecycle.soft_delete(Utc::now());
        self.call(
            deadline,
            "save organization",
            self.store.save_organization(organization),
        )
        .await
    }

    /// Creates a group in a live organization, optionally under a parent
    /// group of the same organization.
    pub async fn create_group(
        &self,
        actor: &PrincipalId,
        organization: &OrganizationId,
        name: &str,
        parent: Option<&GroupId>,
    ) -> Result<Group> {
        let deadline = self.deadline();
        let result = self
            .try_create_group(organization, name, parent, deadline)
            .await;
        let id = result
            .as_ref()
            .map(|group| group.id.to_string())
            .unwrap_or_default();
        let mut detail = vec![
            ("organization", organization.to_string()),
            ("name", name.to_string()),
        ];
        if let Some(parent) = parent {
            detail.push(("parent", parent.to_string()));
        }
        self.record_mutation(deadline, actor, "group.create", "group", &id, &result, &detail)
            .await;
        result
    }

    async fn try_create_group(
        &self,
        organization: &OrganizationId,
        name: &str,
        parent: Option<&GroupId>,
        deadline: Deadline,
    ) -> Result<Group> {
        let name = validate_display_name(name, "group name")?;
        self.live_organization(organization, deadline).await?;
        if let Some(parent_id) = parent {
            self.check_group_parent(organization, parent_id, None, deadline)
                .await?;
        }
        let group = Group::new(organization.clone(), name, parent.cloned(), Utc::now());
        self.call(deadline, "save group", self.store.save_group(group.clone()))
            .await?;
        Ok(group)
    }

    /// Validates `parent_id` as the parent of `moving` (or of a new group).
    async fn check_group_parent(
        &self,
        organization: &OrganizationId,
        parent_id: &GroupId,
        moving: Option<&GroupId>,
        deadline: Deadline,
    ) -> Result<()> {
        let parent = self.live_group(parent_id, deadline).await?;
        if &parent.organization_id != organization {
            return Err(Error::Validation(format!(
                "parent group {parent_id} belongs to organization {}, not {organization}",
                parent.organization_id
            )));
        }
        let chain = self.group_chain(parent, deadline).await?;
        if let Some(moving) = moving
            && chain.iter().any(|ancestor| &ancestor.id == moving)
        {
            return Err(Error::CycleDetected {
                kind: "group",
                id: moving.to_string(),
            });
        }
        let below = match moving {
            Some(moving) => {
                self.subtree_height::<Group, _, _>(
                    moving.clone(),
                    deadline,
                    "load child groups",
                    move |id: GroupId| async move { self.store.child_groups(&id).await },
                )
                .await?
            }
            None => 0,
        };
        self.check_link_depth("group", moving.unwrap_or(parent_id), chain.len(), below)
    }

    /// Moves a group under a new parent (or to the root of its organization).
    ///
    /// Members of the whole moved subtree are invalidated.
    pub async fn move_group(
        &self,
        actor: &PrincipalId,
        id: &GroupId,
        parent: Option<&GroupId>,
    ) -> Result<Group> {
        let deadline = self.deadline();
        let result = self.try_move_group(id, parent, deadline).await;
        if let Ok(group) = &result {
            self.invalidate_group_subtree(group.clone(), deadline).await;
        }
        let parent_detail = parent.map(ToString::to_string).unwrap_or_default();
        self.record_mutation(
            deadline,
            actor,
            "group.move",
            "group",
            id.as_str(),
            &result,
            &[("parent", parent_detail)],
        )
        .await;
        result
    }

    async fn try_move_group(
        &self,
        id: &GroupId,
        parent: Option<&GroupId>,
        deadline: Deadline,
    ) -> Result<Group> {
        let mut group = self.live_group(id, deadline).await?;
        if let Some(parent_id) = parent {
            if parent_id == id {
                return Err(Error::CycleDetected {
                    kind: "group",
                    id: id.to_string(),
                });
            }
            self.check_group_parent(&group.organization_id, parent_id, Some(id), deadline)
                .await?;
        }
        group.parent_id = parent.cloned();
        group.lifecycle.updated_at = Utc::now();
        self.call(deadline, "save group", self.store.save_group(group.clone()))
            .await?;
        Ok(group)
    }

    /// Root-to-node chain of a group.
    pub async fn get_group_hierarchy(&self, id: &GroupId) -> Result<Vec<Group>> {
        self.group_hierarchy_within(id, self.deadline()).await
    }

    /// Soft-deletes a group without live child groups or active memberships.
    pub async fn delete_group(&self, actor: &PrincipalId, id: &GroupId) -> Result<()> {
        let deadline = self.deadline();
        let result = self.try_delete_group(id, deadline).await;
        self.record_mutation(deadline, actor, "group.delete", "group", id.as_str(), &result, &[])
            .await;
        result
    }

    async fn try_delete_group(&self, id: &GroupId, deadline: Deadline) -> Result<()> {
        let mut group = self.live_group(id, deadline).await?;
        let children = self
            .call(deadline, "load child groups", self.store.child_groups(id))
            .await?;
        let live_children = children.iter().filter(|child| child.is_live()).count();
        if live_children > 0 {
            return Err(Error::Conflict(format!(
                "group {id} has {live_children} active child groups"
            )));
        }
        let memberships = self
            .call(deadline, "load group memberships", self.store.group_memberships(id))
            .await?;
        let active = memberships
            .iter()
            .filter(|membership| membership.lifecycle.is_live())
            .count();
        if active > 0 {
            return Err(Error::Conflict(format!(
                "group {id} has {active} active memberships"
            )));
        }
        group.lifecycle.soft_delete(Utc::now());
        self.call(deadline, "save group", self.store.save_group(group))
            .await
    }
}

#[cfg(all(test, feature = "memory-store"))]
mod tests {
    use super::*;
    use crate::engine::EngineBuilder;
    use crate::error::ErrorKind;
    use crate::memory_store::MemoryStore;
    use crate::store::HierarchyStore;
    use futures::executor::block_on;

    fn admin() -> PrincipalId {
        PrincipalId::try_from("admin").unwrap()
    }

    fn engine() -> Engine<MemoryStore> {
        EngineBuilder::new(MemoryStore::new()).build()
    }

    #[test]
    fn group_chain_is_root_to_node() {
        let engine = engine();
        let org = block_on(engine.create_organization(&admin(), "Acme", "company", None)).unwrap();
        let a = block_on(engine.create_group(&admin(), &org.id, "A", None)).unwrap();
        let b = block_on(engine.create_group(&admin(), &org.id, "B", Some(&a.id))).unwrap();
        let c = block_on(engine.create_group(&admin(), &org.id, "C", Some(&b.id))).unwrap();

        let chain = block_on(engine.get_group_hierarchy(&c.id)).unwrap();
        let ids: Vec<_> = chain.iter().map(|group| group.id.clone()).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn move_group_rejects_cycle() {
        let engine = engine();
        let org = block_on(engine.create_organization(&admin(), "Acme", "company", None)).unwrap();
        let a = block_on(engine.create_group(&admin(), &org.id, "A", None)).unwrap();
        let b = block_on(engine.create_group(&admin(), &org.id, "B", Some(&a.id))).unwrap();

        let err = block_on(engine.move_group(&admin(), &a.id, Some(&b.id))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(matches!(err, Error::CycleDetected { kind: "group", .. }));

        let err = block_on(engine.move_group(&admin(), &a.id, Some(&a.id))).unwrap_err();
        assert!(matches!(err, Error::CycleDetected { .. }));
    }

    #[test]
    fn parent_group_must_share_organization() {
        let engine = engine();
        let acme = block_on(engine.create_organization(&admin(), "Acme", "company", None)).unwrap();
        let other = block_on(engine.create_organization(&admin(), "Other", "company", None)).unwrap();
        let parent = block_on(engine.create_group(&admin(), &acme.id, "Eng", None)).unwrap();

        let err =
            block_on(engine.create_group(&admin(), &other.id, "Ops", Some(&parent.id))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn create_group_requires_live_organization() {
        let engine = engine();
        let missing = OrganizationId::try_from("missing").unwrap();
        let err = block_on(engine.create_group(&admin(), &missing, "Eng", None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn depth_bound_rejects_deep_groups() {
        let engine = EngineBuilder::new(MemoryStore::new()).max_depth(2).build();
        let org = block_on(engine.create_organization(&admin(), "Acme", "company", None)).unwrap();
        let a = block_on(engine.create_group(&admin(), &org.id, "A", None)).unwrap();
        let b = block_on(engine.create_group(&admin(), &org.id, "B", Some(&a.id))).unwrap();
        let c = block_on(engine.create_group(&admin(), &org.id, "C", Some(&b.id))).unwrap();

        let err = block_on(engine.create_group(&admin(), &org.id, "D", Some(&c.id))).unwrap_err();
        assert!(matches!(err, Error::DepthExceeded { kind: "group", .. }));
    }

    #[test]
    fn move_group_counts_depth_below_moved_group() {
        let engine = EngineBuilder::new(MemoryStore::new()).max_depth(2).build();
        let org = block_on(engine.create_organization(&admin(), "Acme", "company", None)).unwrap();
        let x = block_on(engine.create_group(&admin(), &org.id, "X", None)).unwrap();
        let y = block_on(engine.create_group(&admin(), &org.id, "Y", Some(&x.id))).unwrap();
        let p = block_on(engine.create_group(&admin(), &org.id, "P", None)).unwrap();
        let q = block_on(engine.create_group(&admin(), &org.id, "Q", Some(&p.id))).unwrap();

        let err = block_on(engine.move_group(&admin(), &p.id, Some(&y.id))).unwrap_err();
        assert!(matches!(err, Error::DepthExceeded { kind: "group", .. }));
        assert_eq!(block_on(engine.get_group_hierarchy(&q.id)).unwrap().len(), 2);

        block_on(engine.move_group(&admin(), &p.id, Some(&x.id))).unwrap();
        let chain = block_on(engine.get_group_hierarchy(&q.id)).unwrap();
        let names: Vec<_> = chain.iter().map(|group| group.name.as_str()).collect();
        assert_eq!(names, vec!["X", "P", "Q"]);
    }

    #[test]
    fn organization_parent_counts_depth_below() {
        let engine = EngineBuilder::new(MemoryStore::new()).max_depth(1).build();
        let a = block_on(engine.create_organization(&admin(), "A", "holding", None)).unwrap();
        let b = block_on(engine.create_organization(&admin(), "B", "company", None)).unwrap();
        block_on(engine.create_organization(&admin(), "C", "company", Some(&b.id))).unwrap();

        let err = block_on(engine.set_organization_parent(&admin(), &b.id, Some(&a.id))).unwrap_err();
        assert!(matches!(err, Error::DepthExceeded { kind: "organization", .. }));
    }

    #[test]
    fn corrupted_group_cycle_is_detected_on_read() {
        let store = MemoryStore::new();
        let engine = EngineBuilder::new(store.clone()).build();
        let org = block_on(engine.create_organization(&admin(), "Acme", "company", None)).unwrap();
        let a = block_on(engine.create_group(&admin(), &org.id, "A", None)).unwrap();
        let b = block_on(engine.create_group(&admin(), &org.id, "B", Some(&a.id))).unwrap();

        let mut looped = a.clone();
        looped.parent_id = Some(b.id.clone());
        block_on(store.save_group(looped)).unwrap();

        let err = block_on(engine.get_group_hierarchy(&b.id)).unwrap_err();
        assert!(matches!(err, Error::CycleDetected { .. }));
    }

    #[test]
    fn delete_blocked_by_children() {
        let engine = engine();
        let org = block_on(engine.create_organization(&admin(), "Acme", "company", None)).unwrap();
        let a = block_on(engine.create_group(&admin(), &org.id, "A", None)).unwrap();
        let b = block_on(engine.create_group(&admin(), &org.id, "B", Some(&a.id))).unwrap();

        let err = block_on(engine.delete_group(&admin(), &a.id)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = block_on(engine.delete_organization(&admin(), &org.id)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        block_on(engine.delete_group(&admin(), &b.id)).unwrap();
        block_on(engine.delete_group(&admin(), &a.id)).unwrap();
        block_on(engine.delete_organization(&admin(), &org.id)).unwrap();
        let err = block_on(engine.create_group(&admin(), &org.id, "C", None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn organization_parent_rejects_cycle() {
        let engine = engine();
        let root = block_on(engine.create_organization(&admin(), "Holding", "holding", None)).unwrap();
        let child =
            block_on(engine.create_organization(&admin(), "Sub", "company", Some(&root.id))).unwrap();

        let err =
            block_on(engine.set_organization_parent(&admin(), &root.id, Some(&child.id))).unwrap_err();
        assert!(matches!(err, Error::CycleDetected { kind: "organization", .. }));

        let chain = block_on(engine.get_organization_hierarchy(&child.id)).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].id, root.id);
    }
}
