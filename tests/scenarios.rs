#![cfg(all(feature = "memory-store", feature = "memory-cache"))]

use chrono::{Duration as ChronoDuration, Utc};
use futures::executor::block_on;
use rs_orgauthz::{
    AuditOutcome, AuditQuery, AuditSink, Authorization, Cache, Decision, Engine, EngineBuilder,
    ErrorKind, Group, GrantSource, MemoryAuditSink, MemoryCache, MemoryStore, Organization,
    Permission, PermissionRecord, Principal, PrincipalId, Role, RoleScope, TimeWindow,
};
use std::time::Duration;

fn admin() -> PrincipalId {
    PrincipalId::try_from("admin").unwrap()
}

fn user(id: &str) -> Principal {
    Principal::user(PrincipalId::try_from(id).unwrap())
}

fn perm(value: &str) -> Permission {
    Permission::try_from(value).unwrap()
}

struct World {
    org: Organization,
    g1: Group,
    r1: Role,
    users_read: PermissionRecord,
}

/// O1 with group G1 and role R1 granting `users:read`; R1 is not assigned yet.
fn world<C: Cache, A: AuditSink>(engine: &Engine<MemoryStore, C, A>) -> World {
    let org = block_on(engine.create_organization(&admin(), "O1", "company", None)).unwrap();
    let g1 = block_on(engine.create_group(&admin(), &org.id, "G1", None)).unwrap();
    let r1 = block_on(engine.create_role(
        &admin(),
        "R1",
        RoleScope::Organization(org.id.clone()),
    ))
    .unwrap();
    let users_read =
        block_on(engine.create_permission(&admin(), perm("users:read"), Some("Read users")))
            .unwrap();
    block_on(engine.assign_permission(&admin(), &r1.id, &users_read.id)).unwrap();
    World {
        org,
        g1,
        r1,
        users_read,
    }
}

#[test]
fn member_of_granted_group_is_allowed() {
    let engine = EngineBuilder::new(MemoryStore::new()).build();
    let w = world(&engine);
    let u1 = user("u1");
    block_on(engine.add_group_member(&admin(), &w.g1.id, &u1, TimeWindow::always())).unwrap();
    block_on(engine.assign_role_to_group(&admin(), &w.g1.id, &w.r1.id, TimeWindow::always()))
        .unwrap();

    let outcome = block_on(engine.authorize_action(&u1.id, &w.org.id, "users", "read"));
    let Authorization::Allowed { reason, path } = outcome else {
        panic!("expected allow, got {outcome:?}");
    };
    assert!(reason.contains("R1"), "{reason}");
    assert!(reason.contains(w.g1.id.as_str()), "{reason}");
    assert_eq!(
        path.source,
        GrantSource::Group {
            member_of: w.g1.id.clone(),
            granted_on: w.g1.id.clone(),
        }
    );
}

#[test]
fn child_group_member_inherits_parent_group_grants() {
    let engine = EngineBuilder::new(MemoryStore::new()).build();
    let w = world(&engine);
    let g2 = block_on(engine.create_group(&admin(), &w.org.id, "G2", Some(&w.g1.id))).unwrap();
    block_on(engine.assign_role_to_group(&admin(), &w.g1.id, &w.r1.id, TimeWindow::always()))
        .unwrap();
    let u2 = user("u2");
    block_on(engine.add_group_member(&admin(), &g2.id, &u2, TimeWindow::always())).unwrap();

    let allowed = block_on(engine.authorize_action(&u2.id, &w.org.id, "users", "read"));
    let Authorization::Allowed { path, .. } = &allowed else {
        panic!("expected allow, got {allowed:?}");
    };
    assert_eq!(
        path.source,
        GrantSource::Group {
            member_of: g2.id.clone(),
            granted_on: w.g1.id.clone(),
        }
    );

    let denied = block_on(engine.authorize_action(&u2.id, &w.org.id, "orders", "read"));
    assert_eq!(denied.decision(), Decision::Deny);
}

#[test]
fn three_level_group_chain_inherits_from_root() {
    let engine = EngineBuilder::new(MemoryStore::new()).build();
    let w = world(&engine);
    let b = block_on(engine.create_group(&admin(), &w.org.id, "B", Some(&w.g1.id))).unwrap();
    let c = block_on(engine.create_group(&admin(), &w.org.id, "C", Some(&b.id))).unwrap();
    block_on(engine.assign_role_to_group(&admin(), &w.g1.id, &w.r1.id, TimeWindow::always()))
        .unwrap();
    let u3 = user("u3");
    block_on(engine.add_group_member(&admin(), &c.id, &u3, TimeWindow::always())).unwrap();

    assert!(block_on(engine.authorize(&u3.id, &w.org.id, &perm("users:read"))).is_allowed());

    let effective =
        block_on(engine.effective_permissions(&u3.id, Some(&w.org.id), None)).unwrap();
    assert_eq!(effective.permission_strings(), vec!["users:read".to_string()]);
}

#[test]
fn expired_group_grant_is_denied() {
    let engine = EngineBuilder::new(MemoryStore::new()).build();
    let w = world(&engine);
    let expired = TimeWindow::until(Utc::now() - ChronoDuration::hours(1));
    block_on(engine.assign_role_to_group(&admin(), &w.g1.id, &w.r1.id, expired)).unwrap();
    let newcomer = user("newcomer");
    block_on(engine.add_group_member(&admin(), &w.g1.id, &newcomer, TimeWindow::always()))
        .unwrap();

    let outcome = block_on(engine.authorize_action(&newcomer.id, &w.org.id, "users", "read"));
    assert_eq!(
        outcome,
        Authorization::Denied {
            reason: "no applicable grants".to_string()
        }
    );
}

#[test]
fn windows_are_half_open() {
    let engine = EngineBuilder::new(MemoryStore::new()).build();
    let w = world(&engine);
    let now = Utc::now();
    block_on(engine.assign_role_to_group(&admin(), &w.g1.id, &w.r1.id, TimeWindow::always()))
        .unwrap();

    let future_member = user("future");
    let starts_later = TimeWindow::starting(now + ChronoDuration::hours(1));
    block_on(engine.add_group_member(&admin(), &w.g1.id, &future_member, starts_later)).unwrap();
    assert!(
        !block_on(engine.authorize(&future_member.id, &w.org.id, &perm("users:read")))
            .is_allowed()
    );

    let current_member = user("current");
    let ends_later = TimeWindow::until(now + ChronoDuration::hours(1));
    block_on(engine.add_group_member(&admin(), &w.g1.id, &current_member, ends_later)).unwrap();
    assert!(
        block_on(engine.authorize(&current_member.id, &w.org.id, &perm("users:read")))
            .is_allowed()
    );
}

#[test]
fn revoking_one_path_keeps_other_paths() {
    let engine = EngineBuilder::new(MemoryStore::new())
        .cache(MemoryCache::new(1024))
        .build();
    let w = world(&engine);
    let u1 = user("u1");
    block_on(engine.add_group_member(&admin(), &w.g1.id, &u1, TimeWindow::always())).unwrap();
    block_on(engine.assign_role_to_group(&admin(), &w.g1.id, &w.r1.id, TimeWindow::always()))
        .unwrap();
    block_on(engine.assign_role_to_user(&admin(), &u1.id, &w.r1.id, TimeWindow::always()))
        .unwrap();
    assert!(block_on(engine.authorize_action(&u1.id, &w.org.id, "users", "read")).is_allowed());

    block_on(engine.revoke_role_from_user(&admin(), &u1.id, &w.r1.id)).unwrap();
    assert!(block_on(engine.authorize_action(&u1.id, &w.org.id, "users", "read")).is_allowed());

    block_on(engine.revoke_role_from_group(&admin(), &w.g1.id, &w.r1.id)).unwrap();
    let outcome = block_on(engine.authorize_action(&u1.id, &w.org.id, "users", "read"));
    assert_eq!(outcome.decision(), Decision::Deny);
}

/// Decisions for a fixed grant timeline: before any grant, after a group
/// grant, after the membership is removed.
fn timeline<C: Cache, A: AuditSink>(engine: &Engine<MemoryStore, C, A>) -> Vec<Vec<Decision>> {
    let w = world(engine);
    let u1 = user("u1");
    let checks = [perm("users:read"), perm("users:delete"), perm("orders:read")];
    let check = || {
        // Read twice so a cached engine answers the second call from cache.
        block_on(engine.authorize_many(&u1.id, &w.org.id, &checks));
        block_on(engine.authorize_many(&u1.id, &w.org.id, &checks))
            .iter()
            .map(Authorization::decision)
            .collect::<Vec<_>>()
    };

    let mut steps = vec![check()];
    block_on(engine.add_group_member(&admin(), &w.g1.id, &u1, TimeWindow::always())).unwrap();
    block_on(engine.assign_role_to_group(&admin(), &w.g1.id, &w.r1.id, TimeWindow::always()))
        .unwrap();
    steps.push(check());
    block_on(engine.remove_group_member(&admin(), &w.g1.id, &u1.id)).unwrap();
    steps.push(check());
    steps
}

#[test]
fn cached_and_uncached_engines_agree() {
    let plain = timeline(&EngineBuilder::new(MemoryStore::new()).build());
    let cached = timeline(
        &EngineBuilder::new(MemoryStore::new())
            .cache(MemoryCache::new(1024))
            .build(),
    );
    assert_eq!(plain, cached);
    assert_eq!(plain[1], vec![Decision::Allow, Decision::Deny, Decision::Deny]);
    assert_eq!(plain[2], vec![Decision::Deny, Decision::Deny, Decision::Deny]);
}

#[test]
fn role_inheritance_grants_parent_permissions() {
    let engine = EngineBuilder::new(MemoryStore::new()).build();
    let w = world(&engine);
    let manager = block_on(engine.create_role(
        &admin(),
        "manager",
        RoleScope::Organization(w.org.id.clone()),
    ))
    .unwrap();
    block_on(engine.add_child_role(&admin(), &w.r1.id, &manager.id)).unwrap();
    let u1 = user("u1");
    block_on(engine.assign_role_to_user(&admin(), &u1.id, &manager.id, TimeWindow::always()))
        .unwrap();

    let outcome = block_on(engine.authorize(&u1.id, &w.org.id, &perm("users:read")));
    let Authorization::Allowed { path, .. } = outcome else {
        panic!("expected allow");
    };
    assert_eq!(path.source, GrantSource::Direct);
    assert_eq!(path.granted_role().unwrap().id, manager.id);
    assert_eq!(path.effective_role().unwrap().id, w.r1.id);

    block_on(engine.deactivate_role(&admin(), &w.r1.id)).unwrap();
    assert!(!block_on(engine.authorize(&u1.id, &w.org.id, &perm("users:read"))).is_allowed());
}

#[test]
fn wildcard_grants_are_explicit_and_switchable() {
    for enable_wildcard in [true, false] {
        let engine = EngineBuilder::new(MemoryStore::new())
            .enable_wildcard(enable_wildcard)
            .build();
        let w = world(&engine);
        let super_admin = block_on(engine.create_role(&admin(), "super_admin", RoleScope::Global))
            .unwrap();
        let all = block_on(engine.create_permission(&admin(), perm("*:*"), None)).unwrap();
        block_on(engine.assign_permission(&admin(), &super_admin.id, &all.id)).unwrap();
        let root = user("root");
        block_on(engine.assign_role_to_user(
            &admin(),
            &root.id,
            &super_admin.id,
            TimeWindow::always(),
        ))
        .unwrap();

        let outcome = block_on(engine.authorize_action(&root.id, &w.org.id, "invoices", "void"));
        assert_eq!(outcome.is_allowed(), enable_wildcard);
        if enable_wildcard {
            assert!(outcome.reason().contains("matched *:*"), "{}", outcome.reason());
        }
    }
}

#[test]
fn partial_wildcard_matches_one_resource() {
    let engine = EngineBuilder::new(MemoryStore::new()).build();
    let w = world(&engine);
    let editor = block_on(engine.create_role(&admin(), "editor", RoleScope::Global)).unwrap();
    let any_user_action = block_on(engine.create_permission(&admin(), perm("users:*"), None)).unwrap();
    block_on(engine.assign_permission(&admin(), &editor.id, &any_user_action.id)).unwrap();
    let u1 = user("u1");
    block_on(engine.assign_role_to_user(&admin(), &u1.id, &editor.id, TimeWindow::always()))
        .unwrap();

    let outcomes = block_on(engine.authorize_many(
        &u1.id,
        &w.org.id,
        &[perm("users:delete"), perm("orders:delete")],
    ));
    assert!(outcomes[0].is_allowed());
    assert!(!outcomes[1].is_allowed());
}

#[test]
fn unavailable_store_is_undetermined_and_retryable() {
    let store = MemoryStore::new();
    let engine = EngineBuilder::new(store.clone()).build();
    let w = world(&engine);
    store.set_unavailable(true);

    let outcome = block_on(engine.authorize_action(&user("u1").id, &w.org.id, "users", "read"));
    assert!(matches!(
        outcome,
        Authorization::Undetermined {
            retryable: true,
            ..
        }
    ));
    assert!(!outcome.is_allowed());

    let err = block_on(engine.create_group(&admin(), &w.org.id, "G9", None)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn slow_store_times_out_undetermined() {
    let store = MemoryStore::new();
    let engine = EngineBuilder::new(store.clone())
        .call_timeout(Duration::from_millis(20))
        .build();
    let org = engine
        .create_organization(&admin(), "O1", "company", None)
        .await
        .unwrap();
    store.set_latency(Some(Duration::from_millis(200)));

    let outcome = engine
        .authorize_action(&user("u1").id, &org.id, "users", "read")
        .await;
    assert_eq!(outcome.decision(), Decision::Undetermined);
    assert!(outcome.reason().contains("timed out"), "{}", outcome.reason());

    let relaxed = engine
        .authorize_with_timeout(&user("u1").id, &org.id, &perm("users:read"), None)
        .await;
    assert_eq!(relaxed.decision(), Decision::Deny);
}

#[tokio::test]
async fn audit_shares_the_decision_deadline() {
    let store = MemoryStore::new();
    let audit = MemoryAuditSink::new();
    let engine = EngineBuilder::new(store.clone())
        .audit(audit.clone())
        .call_timeout(Duration::from_millis(20))
        .build();
    let org = engine
        .create_organization(&admin(), "O1", "company", None)
        .await
        .unwrap();
    let recorded = audit.entries().len();
    store.set_latency(Some(Duration::from_millis(200)));

    let outcome = engine
        .authorize_action(&user("u1").id, &org.id, "users", "read")
        .await;
    assert_eq!(outcome.decision(), Decision::Undetermined);
    assert_eq!(engine.audit_failures(), 1);
    assert_eq!(audit.entries().len(), recorded);
}

#[test]
fn audit_failures_never_block_decisions() {
    let audit = MemoryAuditSink::new();
    let engine = EngineBuilder::new(MemoryStore::new())
        .audit(audit.clone())
        .build();
    let w = world(&engine);
    let u1 = user("u1");
    block_on(engine.assign_role_to_user(&admin(), &u1.id, &w.r1.id, TimeWindow::always()))
        .unwrap();

    audit.set_failing(true);
    assert!(block_on(engine.authorize(&u1.id, &w.org.id, &perm("users:read"))).is_allowed());
    block_on(engine.revoke_role_from_user(&admin(), &u1.id, &w.r1.id)).unwrap();
    assert_eq!(engine.audit_failures(), 2);
}

#[test]
fn denials_and_mutations_are_audited() {
    let audit = MemoryAuditSink::new();
    let engine = EngineBuilder::new(MemoryStore::new())
        .audit(audit.clone())
        .build();
    let w = world(&engine);
    let u1 = user("u1");

    assert!(!block_on(engine.authorize_action(&u1.id, &w.org.id, "users", "read")).is_allowed());

    let denied = audit.query(&AuditQuery {
        action: Some("access_denied".to_string()),
        ..AuditQuery::default()
    });
    assert_eq!(denied.total, 1);
    let entry = &denied.entries[0];
    assert_eq!(entry.actor, u1.id);
    assert_eq!(entry.resource_type, "users");
    assert_eq!(entry.outcome, AuditOutcome::Denied);
    assert_eq!(
        entry.detail.get("organization").map(String::as_str),
        Some(w.org.id.as_str())
    );

    let mutations = audit.query(&AuditQuery {
        actor: Some(admin()),
        outcome: Some(AuditOutcome::Success),
        ..AuditQuery::default()
    });
    assert!(mutations.total >= 5);
    assert!(
        mutations
            .entries
            .iter()
            .any(|entry| entry.resource_id.as_deref() == Some(w.users_read.id.as_str()))
    );
}

#[test]
fn cache_is_invalidated_on_membership_removal() {
    let cache = MemoryCache::new(1024);
    let engine = EngineBuilder::new(MemoryStore::new())
        .cache(cache.clone())
        .build();
    let w = world(&engine);
    let u1 = user("u1");
    block_on(engine.assign_role_to_group(&admin(), &w.g1.id, &w.r1.id, TimeWindow::always()))
        .unwrap();
    block_on(engine.add_group_member(&admin(), &w.g1.id, &u1, TimeWindow::always())).unwrap();

    assert!(block_on(engine.authorize(&u1.id, &w.org.id, &perm("users:read"))).is_allowed());
    assert!(!cache.is_empty());

    block_on(engine.remove_group_member(&admin(), &w.g1.id, &u1.id)).unwrap();
    assert!(!block_on(engine.authorize(&u1.id, &w.org.id, &perm("users:read"))).is_allowed());
}

#[test]
fn broad_global_role_change_flushes_cache() {
    let cache = MemoryCache::new(1024);
    let engine = EngineBuilder::new(MemoryStore::new())
        .cache(cache.clone())
        .broad_role_threshold(0)
        .build();
    let w = world(&engine);
    let auditor = block_on(engine.create_role(&admin(), "auditor", RoleScope::Global)).unwrap();
    block_on(engine.assign_permission(&admin(), &auditor.id, &w.users_read.id)).unwrap();
    let u1 = user("u1");
    block_on(engine.assign_role_to_user(&admin(), &u1.id, &auditor.id, TimeWindow::always()))
        .unwrap();

    assert!(block_on(engine.authorize(&u1.id, &w.org.id, &perm("users:read"))).is_allowed());
    assert!(!cache.is_empty());

    block_on(engine.remove_permission(&admin(), &auditor.id, &w.users_read.id)).unwrap();
    assert!(cache.is_empty());
    assert!(!block_on(engine.authorize(&u1.id, &w.org.id, &perm("users:read"))).is_allowed());
}

#[tokio::test]
async fn cached_grant_is_not_served_past_its_window() {
    let engine = EngineBuilder::new(MemoryStore::new())
        .cache(MemoryCache::new(1024))
        .build();
    let w = world(&engine);
    let u1 = user("u1");
    let window = TimeWindow::until(Utc::now() + ChronoDuration::milliseconds(300));
    engine
        .assign_role_to_user(&admin(), &u1.id, &w.r1.id, window)
        .await
        .unwrap();

    let permission = perm("users:read");
    assert!(engine.authorize(&u1.id, &w.org.id, &permission).await.is_allowed());
    assert!(engine.authorize(&u1.id, &w.org.id, &permission).await.is_allowed());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let outcome = engine.authorize(&u1.id, &w.org.id, &permission).await;
    assert_eq!(outcome.decision(), Decision::Deny, "{outcome:?}");
}

#[test]
fn deleting_an_assigned_role_requires_force() {
    let engine = EngineBuilder::new(MemoryStore::new())
        .cache(MemoryCache::new(1024))
        .build();
    let w = world(&engine);
    let u1 = user("u1");
    block_on(engine.assign_role_to_user(&admin(), &u1.id, &w.r1.id, TimeWindow::always()))
        .unwrap();
    assert!(block_on(engine.authorize(&u1.id, &w.org.id, &perm("users:read"))).is_allowed());

    let err = block_on(engine.delete_role(&admin(), &w.r1.id, false)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(block_on(engine.authorize(&u1.id, &w.org.id, &perm("users:read"))).is_allowed());

    block_on(engine.delete_role(&admin(), &w.r1.id, true)).unwrap();
    assert!(!block_on(engine.authorize(&u1.id, &w.org.id, &perm("users:read"))).is_allowed());
    assert!(block_on(engine.get_role(&w.r1.id)).is_err());
}

#[test]
fn endpoint_and_group_targeted_checks() {
    let engine = EngineBuilder::new(MemoryStore::new()).build();
    let w = world(&engine);
    let g2 = block_on(engine.create_group(&admin(), &w.org.id, "G2", None)).unwrap();
    block_on(engine.assign_role_to_group(&admin(), &w.g1.id, &w.r1.id, TimeWindow::always()))
        .unwrap();
    let u1 = user("u1");
    block_on(engine.add_group_member(&admin(), &w.g1.id, &u1, TimeWindow::always())).unwrap();

    let endpoint = block_on(engine.authorize_endpoint(&u1.id, &w.org.id, "GET", "/api/v1/users"));
    assert!(endpoint.is_allowed());
    let write = block_on(engine.authorize_endpoint(&u1.id, &w.org.id, "POST", "/api/v1/users"));
    assert!(!write.is_allowed());

    let in_g1 = block_on(engine.authorize_in_group(&u1.id, &w.org.id, &w.g1.id, &perm("users:read")));
    assert!(in_g1.is_allowed());
    let in_g2 = block_on(engine.authorize_in_group(&u1.id, &w.org.id, &g2.id, &perm("users:read")));
    assert!(!in_g2.is_allowed());
}

#[test]
fn other_organizations_see_no_grants() {
    let engine = EngineBuilder::new(MemoryStore::new()).build();
    let w = world(&engine);
    let other = block_on(engine.create_organization(&admin(), "O2", "company", None)).unwrap();
    let u1 = user("u1");
    block_on(engine.add_group_member(&admin(), &w.g1.id, &u1, TimeWindow::always())).unwrap();
    block_on(engine.assign_role_to_group(&admin(), &w.g1.id, &w.r1.id, TimeWindow::always()))
        .unwrap();

    assert!(block_on(engine.authorize_action(&u1.id, &w.org.id, "users", "read")).is_allowed());
    assert!(!block_on(engine.authorize_action(&u1.id, &other.id, "users", "read")).is_allowed());

    let err = block_on(engine.delete_organization(&admin(), &w.org.id)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    block_on(engine.remove_group_member(&admin(), &w.g1.id, &u1.id)).unwrap();
    block_on(engine.delete_group(&admin(), &w.g1.id)).unwrap();
    block_on(engine.delete_organization(&admin(), &w.org.id)).unwrap();
    let outcome = block_on(engine.authorize_action(&u1.id, &w.org.id, "users", "read"));
    assert_eq!(outcome.decision(), Decision::Deny);
    assert!(outcome.reason().contains("not active"), "{}", outcome.reason());
}
