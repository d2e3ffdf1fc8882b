//! End-to-end engine behavior against the in-memory backend: registration
//! validation, rule lifecycle, hierarchy propagation in all three graphs,
//! and the deny-overrides decision semantics.

use auth_lattice::{
    AuthorizationEngine, Decision, EntityKind, InMemoryAccessRepository, LatticeError, RawId,
    RuleSide, RuleSign, SUPREMUM,
};
use std::sync::Arc;

async fn create_test_engine() -> AuthorizationEngine {
    AuthorizationEngine::new(Arc::new(InMemoryAccessRepository::new()))
        .await
        .unwrap()
}

/// Engine with `alice`, `doc`, and `edit` registered.
async fn seeded_engine() -> AuthorizationEngine {
    let engine = create_test_engine().await;
    engine.register_subject("alice", "Alice").await.unwrap();
    engine.register_object("doc", "A document").await.unwrap();
    engine.register_permission("edit", "Modify content").await.unwrap();
    engine
}

#[tokio::test]
async fn nothing_is_granted_by_default() {
    let engine = seeded_engine().await;
    assert_eq!(
        engine.check("alice", "doc", "edit").await.unwrap(),
        Decision::Denied
    );
}

#[tokio::test]
async fn grant_conflict_and_revoke_lifecycle() {
    let engine = seeded_engine().await;

    engine.grant("alice", "doc", "edit").await.unwrap();
    assert_eq!(
        engine.check("alice", "doc", "edit").await.unwrap(),
        Decision::Granted
    );

    // Opposite sign on the same triple is a conflict, not an override.
    assert!(matches!(
        engine.deny("alice", "doc", "edit").await,
        Err(LatticeError::ConflictingRuleType { .. })
    ));

    // Re-granting is a silent no-op.
    engine.grant("alice", "doc", "edit").await.unwrap();

    engine.revoke("alice", "doc", "edit").await.unwrap();
    assert_eq!(
        engine.check("alice", "doc", "edit").await.unwrap(),
        Decision::Denied
    );

    // Revoking again, and clearing an absent deny, both succeed.
    engine.revoke("alice", "doc", "edit").await.unwrap();
    engine.allow("alice", "doc", "edit").await.unwrap();
}

#[tokio::test]
async fn grants_propagate_down_the_subject_hierarchy() {
    let engine = seeded_engine().await;
    engine.register_subject("admin", "Administrators").await.unwrap();
    engine.register_subject("editor", "Editors").await.unwrap();
    engine
        .add_child("admin", "editor", EntityKind::Subject)
        .await
        .unwrap();
    engine
        .add_child("editor", "alice", EntityKind::Subject)
        .await
        .unwrap();

    engine.grant("admin", "doc", "edit").await.unwrap();
    assert_eq!(
        engine.check("alice", "doc", "edit").await.unwrap(),
        Decision::Granted
    );
    // Siblings outside the chain get nothing.
    engine.register_subject("bob", "Bob").await.unwrap();
    assert_eq!(
        engine.check("bob", "doc", "edit").await.unwrap(),
        Decision::Denied
    );
}

#[tokio::test]
async fn stronger_privileges_imply_weaker_ones() {
    let engine = seeded_engine().await;
    engine.register_permission("read", "View content").await.unwrap();
    engine
        .add_child("edit", "read", EntityKind::Privilege)
        .await
        .unwrap();

    engine.grant("alice", "doc", "edit").await.unwrap();
    assert_eq!(
        engine.check("alice", "doc", "read").await.unwrap(),
        Decision::Granted
    );
}

#[tokio::test]
async fn deny_on_weaker_privilege_takes_down_the_stronger() {
    let engine = seeded_engine().await;
    engine.register_permission("read", "View content").await.unwrap();
    engine
        .add_child("edit", "read", EntityKind::Privilege)
        .await
        .unwrap();
    engine.grant("alice", "doc", "edit").await.unwrap();

    engine.deny("alice", "doc", "read").await.unwrap();

    // The veto on `read` propagates up to `edit` and also overrides the
    // ancestor-level grant on `read` itself.
    assert_eq!(
        engine.check("alice", "doc", "edit").await.unwrap(),
        Decision::Denied
    );
    assert_eq!(
        engine.check("alice", "doc", "read").await.unwrap(),
        Decision::Denied
    );
}

#[tokio::test]
async fn object_hierarchy_scopes_grants_and_denies() {
    let engine = seeded_engine().await;
    engine.register_permission("read", "View content").await.unwrap();
    engine.register_object("docs", "All documents").await.unwrap();
    engine.register_object("private", "Private documents").await.unwrap();
    engine
        .add_child("docs", "private", EntityKind::Object)
        .await
        .unwrap();

    engine.grant("alice", "docs", "read").await.unwrap();
    engine.deny("alice", "private", "read").await.unwrap();

    assert_eq!(
        engine.check("alice", "docs", "read").await.unwrap(),
        Decision::Granted
    );
    assert_eq!(
        engine.check("alice", "private", "read").await.unwrap(),
        Decision::Denied
    );
}

#[tokio::test]
async fn supremum_rules_cover_everything() {
    let engine = seeded_engine().await;
    engine.grant(SUPREMUM, "doc", "edit").await.unwrap();
    assert_eq!(
        engine.check("alice", "doc", "edit").await.unwrap(),
        Decision::Granted
    );

    // A deny on the privilege supremum vetoes every privilege.
    engine.deny("alice", "doc", SUPREMUM).await.unwrap();
    assert_eq!(
        engine.check("alice", "doc", "edit").await.unwrap(),
        Decision::Denied
    );
}

#[tokio::test]
async fn registration_validates_id_and_description() {
    let engine = create_test_engine().await;

    assert!(matches!(
        engine.register_subject("", "Somebody").await,
        Err(LatticeError::IdIsRequired)
    ));
    assert!(matches!(
        engine.register_subject("   ", "Somebody").await,
        Err(LatticeError::IdIsRequired)
    ));
    assert!(matches!(
        engine.register_subject("alice", "").await,
        Err(LatticeError::DescriptionIsRequired)
    ));

    // Failed registration leaves no trace.
    assert!(!engine.exists(EntityKind::Subject, "alice").await.unwrap());
}

#[tokio::test]
async fn registration_upserts_on_collision() {
    let engine = create_test_engine().await;
    let first = engine.register_subject("alice", "Alice").await.unwrap();
    let second = engine.register_subject("alice", "Alice Arnold").await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.description, "Alice Arnold");

    let found = engine
        .lookup(EntityKind::Subject, "alice")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.description, "Alice Arnold");
}

#[tokio::test]
async fn heterogeneous_identifiers_normalize() {
    let engine = create_test_engine().await;
    engine.register_subject(42i64, "Account 42").await.unwrap();
    engine
        .register_object(("doc", "reports/2024"), "Yearly reports")
        .await
        .unwrap();
    engine
        .register_permission(RawId::token("edit"), "Modify content")
        .await
        .unwrap();

    engine.grant(42i64, ("doc", "reports/2024"), "edit").await.unwrap();
    assert_eq!(
        engine
            .check("42", "doc:reports/2024", RawId::token("edit"))
            .await
            .unwrap(),
        Decision::Granted
    );
}

#[tokio::test]
async fn unknown_identifiers_surface_as_invalid_errors() {
    let engine = seeded_engine().await;

    assert!(matches!(
        engine.check("ghost", "doc", "edit").await,
        Err(LatticeError::InvalidSubject(_))
    ));
    assert!(matches!(
        engine.grant("alice", "ghost", "edit").await,
        Err(LatticeError::InvalidObject(_))
    ));
    assert!(matches!(
        engine.deny("alice", "doc", "ghost").await,
        Err(LatticeError::InvalidPermission(_))
    ));
    assert!(matches!(
        engine.add_child("ghost", "alice", EntityKind::Subject).await,
        Err(LatticeError::InvalidParent(_))
    ));
    assert!(matches!(
        engine.add_child("alice", "ghost", EntityKind::Subject).await,
        Err(LatticeError::InvalidChild(_))
    ));
}

async fn register_node(engine: &AuthorizationEngine, kind: EntityKind, ext: &str) {
    match kind {
        EntityKind::Subject => engine.register_subject(ext, "node").await.unwrap(),
        EntityKind::Object => engine.register_object(ext, "node").await.unwrap(),
        EntityKind::Privilege => engine.register_permission(ext, "node").await.unwrap(),
    };
}

#[tokio::test]
async fn cycles_are_rejected_in_every_kind() {
    let engine = create_test_engine().await;
    for kind in EntityKind::ALL {
        register_node(&engine, kind, "a").await;
        register_node(&engine, kind, "b").await;
        engine.add_child("a", "b", kind).await.unwrap();

        assert!(matches!(
            engine.add_child("b", "a", kind).await,
            Err(LatticeError::CyclicEdge { .. })
        ));
        assert!(matches!(
            engine.add_child("a", "a", kind).await,
            Err(LatticeError::CyclicEdge { .. })
        ));
        // The supremum can never become a child.
        assert!(matches!(
            engine.add_child("a", SUPREMUM, kind).await,
            Err(LatticeError::CyclicEdge { .. })
        ));
    }
}

#[tokio::test]
async fn removing_an_edge_reverts_propagation() {
    let engine = seeded_engine().await;
    engine.register_subject("team", "The team").await.unwrap();
    engine
        .add_child("team", "alice", EntityKind::Subject)
        .await
        .unwrap();
    engine.grant("team", "doc", "edit").await.unwrap();
    assert_eq!(
        engine.check("alice", "doc", "edit").await.unwrap(),
        Decision::Granted
    );

    engine
        .remove_child("team", "alice", EntityKind::Subject)
        .await
        .unwrap();
    assert_eq!(
        engine.check("alice", "doc", "edit").await.unwrap(),
        Decision::Denied
    );
    // Alice is back directly under the supremum rather than orphaned.
    let parents = engine.parents_of(EntityKind::Subject, "alice").await.unwrap();
    assert_eq!(parents.len(), 1);
    assert_eq!(parents[0].ext_id, SUPREMUM);

    // Removing it again is a silent no-op.
    engine
        .remove_child("team", "alice", EntityKind::Subject)
        .await
        .unwrap();
}

#[tokio::test]
async fn members_lists_proper_descendants() {
    let engine = create_test_engine().await;
    engine.register_subject("admins", "Admins").await.unwrap();
    engine.register_subject("carol", "Carol").await.unwrap();
    engine.register_subject("dave", "Dave").await.unwrap();
    engine
        .add_child("admins", "dave", EntityKind::Subject)
        .await
        .unwrap();
    engine
        .add_child("admins", "carol", EntityKind::Subject)
        .await
        .unwrap();

    assert_eq!(
        engine.members(EntityKind::Subject, "admins").await.unwrap(),
        vec!["carol", "dave"]
    );
    assert!(matches!(
        engine.members(EntityKind::Subject, "ghost").await,
        Err(LatticeError::NotFound(_))
    ));
}

#[tokio::test]
async fn set_queries_are_inclusive_and_ordered() {
    let engine = create_test_engine().await;
    engine.register_object("docs", "All documents").await.unwrap();
    engine.register_object("private", "Private documents").await.unwrap();
    engine.register_object("archive", "Archived documents").await.unwrap();
    engine
        .add_child("docs", "private", EntityKind::Object)
        .await
        .unwrap();
    engine
        .add_child("docs", "archive", EntityKind::Object)
        .await
        .unwrap();

    let ancestors: Vec<String> = engine
        .ancestors_of(EntityKind::Object, "private")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.ext_id)
        .collect();
    assert_eq!(ancestors, vec![SUPREMUM.to_string(), "docs".into(), "private".into()]);

    let descendants: Vec<String> = engine
        .descendants_of(EntityKind::Object, "docs")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.ext_id)
        .collect();
    assert_eq!(descendants, vec!["archive".to_string(), "docs".into(), "private".into()]);

    let children: Vec<String> = engine
        .children_of(EntityKind::Object, "docs")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.ext_id)
        .collect();
    assert_eq!(children, vec!["archive".to_string(), "private".into()]);
}

#[tokio::test]
async fn rule_listings_cover_both_sides_in_order() {
    let engine = seeded_engine().await;
    engine.register_object("wiki", "The wiki").await.unwrap();
    engine.register_subject("bob", "Bob").await.unwrap();

    engine.grant("alice", "wiki", "edit").await.unwrap();
    engine.deny("alice", "doc", "edit").await.unwrap();
    engine.grant("bob", "doc", "edit").await.unwrap();

    let by_alice = engine.list_rules("alice", RuleSide::Subject).await.unwrap();
    assert_eq!(by_alice.len(), 2);
    assert_eq!(by_alice[0].object_ext, "doc");
    assert_eq!(by_alice[0].sign, RuleSign::Deny);
    assert_eq!(by_alice[1].object_ext, "wiki");

    let on_doc = engine.list_rules("doc", RuleSide::Object).await.unwrap();
    assert_eq!(on_doc.len(), 2);
    assert_eq!(on_doc[0].subject_ext, "alice");
    assert_eq!(on_doc[1].subject_ext, "bob");

    assert!(engine
        .list_rules("ghost", RuleSide::Subject)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn removing_a_dynamic_entity_cascades_its_rules() {
    let engine = seeded_engine().await;
    engine.grant("alice", "doc", "edit").await.unwrap();

    engine.remove_entity(EntityKind::Subject, "alice").await.unwrap();
    assert!(!engine.exists(EntityKind::Subject, "alice").await.unwrap());
    assert!(engine
        .list_rules("doc", RuleSide::Object)
        .await
        .unwrap()
        .is_empty());

    assert!(matches!(
        engine.remove_entity(EntityKind::Subject, "alice").await,
        Err(LatticeError::NotFound(_))
    ));
    // The supremum is not removable.
    assert!(matches!(
        engine.remove_entity(EntityKind::Subject, SUPREMUM).await,
        Err(LatticeError::NotFound(_))
    ));
}

#[tokio::test]
async fn cached_decisions_follow_mutations() {
    let repo = Arc::new(InMemoryAccessRepository::new());
    let engine = AuthorizationEngine::new(repo)
        .await
        .unwrap()
        .with_decision_cache();
    engine.register_subject("alice", "Alice").await.unwrap();
    engine.register_object("doc", "A document").await.unwrap();
    engine.register_permission("edit", "Modify content").await.unwrap();

    assert_eq!(
        engine.check("alice", "doc", "edit").await.unwrap(),
        Decision::Denied
    );
    engine.grant("alice", "doc", "edit").await.unwrap();
    assert_eq!(
        engine.check("alice", "doc", "edit").await.unwrap(),
        Decision::Granted
    );
    // Repeat hits the cache; the answer must not go stale after revoke.
    assert_eq!(
        engine.check("alice", "doc", "edit").await.unwrap(),
        Decision::Granted
    );
    engine.revoke("alice", "doc", "edit").await.unwrap();
    assert_eq!(
        engine.check("alice", "doc", "edit").await.unwrap(),
        Decision::Denied
    );
}

#[tokio::test]
async fn adding_positive_rules_never_shrinks_access() {
    let engine = seeded_engine().await;
    engine.register_subject("team", "The team").await.unwrap();
    engine
        .add_child("team", "alice", EntityKind::Subject)
        .await
        .unwrap();

    engine.grant("alice", "doc", "edit").await.unwrap();
    assert!(engine.is_granted("alice", "doc", "edit").await.unwrap());

    // Piling on more positive rules keeps every prior grant intact.
    engine.grant("team", "doc", "edit").await.unwrap();
    engine.grant(SUPREMUM, "doc", "edit").await.unwrap();
    assert!(engine.is_granted("alice", "doc", "edit").await.unwrap());

    // One reachable negative flips it regardless of all the positives.
    engine.revoke("alice", "doc", "edit").await.unwrap();
    engine.deny("alice", "doc", "edit").await.unwrap();
    assert!(!engine.is_granted("alice", "doc", "edit").await.unwrap());
}
