//! Storage interface for the engine, plus the in-memory reference backend.
//!
//! Every mutation is atomic: the Postgres backend brackets each one in a
//! transaction, the in-memory backend serializes through a single lock.
//! Reachability is a first-class part of the interface — the backends keep
//! a transitive-closure index in step with edge mutations so that ancestor
//! and descendant lookups, and the two decision probes, are single indexed
//! reads.

pub mod postgres;

use crate::error::{LatticeError, Result};
use crate::models::{Entity, EntityKind, Rule, RuleEntry, RuleSide, RuleSign, SUPREMUM};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Storage interface for entities, edges, rules, and reachability.
///
/// The closure index stores reflexive `(ancestor, descendant)` pairs, so
/// ancestor/descendant sets include the node itself by construction.
#[async_trait]
pub trait AccessRepository: Send + Sync {
    /// Insert the entity or, on external-id collision, rewrite its
    /// description and static flag in place. New rows get a reflexive
    /// closure pair.
    async fn upsert_entity(
        &self,
        kind: EntityKind,
        ext_id: &str,
        description: &str,
        is_static: bool,
    ) -> Result<Entity>;

    async fn find_entity(&self, kind: EntityKind, ext_id: &str) -> Result<Option<Entity>>;

    /// All static rows of a kind, ordered by external id.
    async fn static_entities(&self, kind: EntityKind) -> Result<Vec<Entity>>;

    /// Delete an entity together with its rules and edges. Children left
    /// without a path to the supremum are re-attached to it directly.
    async fn delete_entity(&self, kind: EntityKind, id: i64) -> Result<()>;

    async fn edge_exists(&self, kind: EntityKind, parent_id: i64, child_id: i64) -> Result<bool>;

    /// Insert the edge and extend the closure index. Idempotent; an
    /// existing edge has its static flag rewritten. Callers are
    /// responsible for the cycle check.
    async fn insert_edge(
        &self,
        kind: EntityKind,
        parent_id: i64,
        child_id: i64,
        is_static: bool,
    ) -> Result<()>;

    /// Remove the edge, if present, and bring the closure index back in
    /// line. A child stranded without a path to the supremum is
    /// re-attached to it directly (the restored edge is dynamic).
    async fn remove_edge(&self, kind: EntityKind, parent_id: i64, child_id: i64) -> Result<()>;

    async fn parents(&self, kind: EntityKind, id: i64) -> Result<Vec<Entity>>;
    async fn children(&self, kind: EntityKind, id: i64) -> Result<Vec<Entity>>;

    /// Direct parents connected through static edges.
    async fn static_parents(&self, kind: EntityKind, child_id: i64) -> Result<Vec<Entity>>;

    /// Direct children connected through static edges.
    async fn static_children(&self, kind: EntityKind, parent_id: i64) -> Result<Vec<Entity>>;

    /// One indexed read against the closure table.
    async fn is_reachable(&self, kind: EntityKind, ancestor_id: i64, descendant_id: i64)
        -> Result<bool>;

    /// Ancestor set of the node, inclusive, ordered by external id.
    async fn ancestors(&self, kind: EntityKind, id: i64) -> Result<Vec<Entity>>;

    /// Descendant set of the node, inclusive, ordered by external id.
    async fn descendants(&self, kind: EntityKind, id: i64) -> Result<Vec<Entity>>;

    async fn find_rule(
        &self,
        subject_id: i64,
        object_id: i64,
        privilege_id: i64,
    ) -> Result<Option<Rule>>;

    /// Insert the rule row. Callers have already checked for a conflicting
    /// sign on the triple.
    async fn insert_rule(
        &self,
        subject_id: i64,
        object_id: i64,
        privilege_id: i64,
        sign: RuleSign,
        is_static: bool,
    ) -> Result<()>;

    /// Remove exactly the matching (triple, sign) row; absence is success.
    async fn delete_rule(
        &self,
        subject_id: i64,
        object_id: i64,
        privilege_id: i64,
        sign: RuleSign,
    ) -> Result<()>;

    /// Rules where the entity appears on the given side, joined back to
    /// external ids and ordered by `(subject, object, privilege, sign)`.
    async fn rules_for(&self, side: RuleSide, id: i64) -> Result<Vec<RuleEntry>>;

    async fn delete_static_rules(&self) -> Result<()>;

    /// Existence probe for the negative branch: is there a `-` rule whose
    /// subject is an ancestor of `subject_id`, whose object is an ancestor
    /// of `object_id`, and whose privilege is a descendant of
    /// `privilege_id` or the privilege supremum?
    async fn denial_exists(
        &self,
        subject_id: i64,
        object_id: i64,
        privilege_id: i64,
        privilege_supremum_id: i64,
    ) -> Result<bool>;

    /// Existence probe for the positive branch: is there a `+` rule whose
    /// subject and object are ancestors of the query pair and whose
    /// privilege is an ancestor of `privilege_id`?
    async fn grant_exists(&self, subject_id: i64, object_id: i64, privilege_id: i64)
        -> Result<bool>;

    /// Serialize reconciliation runs against each other. The in-memory
    /// backend is already serialized through its state lock; Postgres uses
    /// an advisory lock.
    async fn acquire_reconcile_lock(&self) -> Result<()>;
    async fn release_reconcile_lock(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct KindState {
    entities: BTreeMap<i64, Entity>,
    by_ext: HashMap<String, i64>,
    /// (parent, child) -> static flag
    edges: BTreeMap<(i64, i64), bool>,
    /// Reflexive (ancestor, descendant) pairs.
    closure: HashSet<(i64, i64)>,
}

impl KindState {
    fn supremum_id(&self) -> Option<i64> {
        self.by_ext.get(SUPREMUM).copied()
    }

    fn entity_list(&self, ids: impl IntoIterator<Item = i64>) -> Vec<Entity> {
        let mut out: Vec<Entity> = ids
            .into_iter()
            .filter_map(|id| self.entities.get(&id).cloned())
            .collect();
        out.sort_by(|a, b| a.ext_id.cmp(&b.ext_id));
        out
    }

    /// Extend the closure for a fresh (parent, child) edge: every ancestor
    /// of the parent now reaches every descendant of the child.
    fn extend_closure(&mut self, parent_id: i64, child_id: i64) {
        let above: Vec<i64> = self
            .closure
            .iter()
            .filter(|(_, d)| *d == parent_id)
            .map(|(a, _)| *a)
            .collect();
        let below: Vec<i64> = self
            .closure
            .iter()
            .filter(|(a, _)| *a == child_id)
            .map(|(_, d)| *d)
            .collect();
        for a in &above {
            for d in &below {
                self.closure.insert((*a, *d));
            }
        }
    }

    /// Rebuild the closure from scratch: reflexive pairs plus a walk over
    /// child edges from every node. Used after removals, where pair
    /// deletion is wrong in the presence of diamonds.
    fn rebuild_closure(&mut self) {
        let mut child_map: HashMap<i64, Vec<i64>> = HashMap::new();
        for (parent, child) in self.edges.keys() {
            child_map.entry(*parent).or_default().push(*child);
        }
        let mut closure = HashSet::new();
        for &id in self.entities.keys() {
            let mut stack = vec![id];
            let mut seen = HashSet::new();
            while let Some(node) = stack.pop() {
                if !seen.insert(node) {
                    continue;
                }
                closure.insert((id, node));
                if let Some(children) = child_map.get(&node) {
                    stack.extend(children.iter().copied());
                }
            }
        }
        self.closure = closure;
    }

    /// Re-attach `child_id` directly under the supremum if nothing else
    /// connects it any more.
    fn restore_supremum_path(&mut self, child_id: i64) {
        let Some(sup) = self.supremum_id() else {
            return;
        };
        if sup == child_id || self.closure.contains(&(sup, child_id)) {
            return;
        }
        self.edges.insert((sup, child_id), false);
        self.extend_closure(sup, child_id);
    }
}

#[derive(Debug, Default)]
struct MemState {
    next_id: i64,
    subjects: KindState,
    objects: KindState,
    privileges: KindState,
    /// (subject, object, privilege) -> rule
    rules: BTreeMap<(i64, i64, i64), Rule>,
}

impl MemState {
    fn kind(&self, kind: EntityKind) -> &KindState {
        match kind {
            EntityKind::Subject => &self.subjects,
            EntityKind::Object => &self.objects,
            EntityKind::Privilege => &self.privileges,
        }
    }

    fn kind_mut(&mut self, kind: EntityKind) -> &mut KindState {
        match kind {
            EntityKind::Subject => &mut self.subjects,
            EntityKind::Object => &mut self.objects,
            EntityKind::Privilege => &mut self.privileges,
        }
    }
}

/// In-memory backend for tests and embedded use. A single `RwLock` keeps
/// multi-table mutations (edge + closure, entity + cascades) atomic.
#[derive(Debug, Default)]
pub struct InMemoryAccessRepository {
    state: RwLock<MemState>,
}

impl InMemoryAccessRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemState>> {
        self.state
            .read()
            .map_err(|_| LatticeError::Storage("state lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemState>> {
        self.state
            .write()
            .map_err(|_| LatticeError::Storage("state lock poisoned".to_string()))
    }
}

#[async_trait]
impl AccessRepository for InMemoryAccessRepository {
    async fn upsert_entity(
        &self,
        kind: EntityKind,
        ext_id: &str,
        description: &str,
        is_static: bool,
    ) -> Result<Entity> {
        let mut state = self.write()?;
        if let Some(&id) = state.kind(kind).by_ext.get(ext_id) {
            let ks = state.kind_mut(kind);
            let entity = ks
                .entities
                .get_mut(&id)
                .ok_or_else(|| LatticeError::Storage(format!("dangling ext index for {}", ext_id)))?;
            entity.description = description.to_string();
            entity.is_static = is_static;
            return Ok(entity.clone());
        }
        state.next_id += 1;
        let entity = Entity {
            id: state.next_id,
            ext_id: ext_id.to_string(),
            description: description.to_string(),
            is_static,
            created_at: Utc::now(),
        };
        let ks = state.kind_mut(kind);
        ks.by_ext.insert(entity.ext_id.clone(), entity.id);
        ks.closure.insert((entity.id, entity.id));
        ks.entities.insert(entity.id, entity.clone());
        Ok(entity)
    }

    async fn find_entity(&self, kind: EntityKind, ext_id: &str) -> Result<Option<Entity>> {
        let state = self.read()?;
        let ks = state.kind(kind);
        Ok(ks
            .by_ext
            .get(ext_id)
            .and_then(|id| ks.entities.get(id))
            .cloned())
    }

    async fn static_entities(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        let state = self.read()?;
        let ks = state.kind(kind);
        let ids: Vec<i64> = ks
            .entities
            .values()
            .filter(|e| e.is_static)
            .map(|e| e.id)
            .collect();
        Ok(ks.entity_list(ids))
    }

    async fn delete_entity(&self, kind: EntityKind, id: i64) -> Result<()> {
        let mut state = self.write()?;
        state.rules.retain(|_, rule| match kind {
            EntityKind::Subject => rule.subject_id != id,
            EntityKind::Object => rule.object_id != id,
            EntityKind::Privilege => rule.privilege_id != id,
        });
        let ks = state.kind_mut(kind);
        let Some(entity) = ks.entities.remove(&id) else {
            return Ok(());
        };
        ks.by_ext.remove(&entity.ext_id);
        let orphans: Vec<i64> = ks
            .edges
            .keys()
            .filter(|(parent, _)| *parent == id)
            .map(|(_, child)| *child)
            .collect();
        ks.edges.retain(|(parent, child), _| *parent != id && *child != id);
        ks.rebuild_closure();
        for child in orphans {
            ks.restore_supremum_path(child);
        }
        Ok(())
    }

    async fn edge_exists(&self, kind: EntityKind, parent_id: i64, child_id: i64) -> Result<bool> {
        let state = self.read()?;
        Ok(state.kind(kind).edges.contains_key(&(parent_id, child_id)))
    }

    async fn insert_edge(
        &self,
        kind: EntityKind,
        parent_id: i64,
        child_id: i64,
        is_static: bool,
    ) -> Result<()> {
        let mut state = self.write()?;
        let ks = state.kind_mut(kind);
        let fresh = ks.edges.insert((parent_id, child_id), is_static).is_none();
        if fresh {
            ks.extend_closure(parent_id, child_id);
        }
        Ok(())
    }

    async fn remove_edge(&self, kind: EntityKind, parent_id: i64, child_id: i64) -> Result<()> {
        let mut state = self.write()?;
        let ks = state.kind_mut(kind);
        if ks.edges.remove(&(parent_id, child_id)).is_none() {
            return Ok(());
        }
        ks.rebuild_closure();
        ks.restore_supremum_path(child_id);
        Ok(())
    }

    async fn parents(&self, kind: EntityKind, id: i64) -> Result<Vec<Entity>> {
        let state = self.read()?;
        let ks = state.kind(kind);
        let ids: Vec<i64> = ks
            .edges
            .keys()
            .filter(|(_, child)| *child == id)
            .map(|(parent, _)| *parent)
            .collect();
        Ok(ks.entity_list(ids))
    }

    async fn children(&self, kind: EntityKind, id: i64) -> Result<Vec<Entity>> {
        let state = self.read()?;
        let ks = state.kind(kind);
        let ids: Vec<i64> = ks
            .edges
            .keys()
            .filter(|(parent, _)| *parent == id)
            .map(|(_, child)| *child)
            .collect();
        Ok(ks.entity_list(ids))
    }

    async fn static_parents(&self, kind: EntityKind, child_id: i64) -> Result<Vec<Entity>> {
        let state = self.read()?;
        let ks = state.kind(kind);
        let ids: Vec<i64> = ks
            .edges
            .iter()
            .filter(|((_, child), is_static)| *child == child_id && **is_static)
            .map(|((parent, _), _)| *parent)
            .collect();
        Ok(ks.entity_list(ids))
    }

    async fn static_children(&self, kind: EntityKind, parent_id: i64) -> Result<Vec<Entity>> {
        let state = self.read()?;
        let ks = state.kind(kind);
        let ids: Vec<i64> = ks
            .edges
            .iter()
            .filter(|((parent, _), is_static)| *parent == parent_id && **is_static)
            .map(|((_, child), _)| *child)
            .collect();
        Ok(ks.entity_list(ids))
    }

    async fn is_reachable(
        &self,
        kind: EntityKind,
        ancestor_id: i64,
        descendant_id: i64,
    ) -> Result<bool> {
        let state = self.read()?;
        Ok(state.kind(kind).closure.contains(&(ancestor_id, descendant_id)))
    }

    async fn ancestors(&self, kind: EntityKind, id: i64) -> Result<Vec<Entity>> {
        let state = self.read()?;
        let ks = state.kind(kind);
        let ids: Vec<i64> = ks
            .closure
            .iter()
            .filter(|(_, d)| *d == id)
            .map(|(a, _)| *a)
            .collect();
        Ok(ks.entity_list(ids))
    }

    async fn descendants(&self, kind: EntityKind, id: i64) -> Result<Vec<Entity>> {
        let state = self.read()?;
        let ks = state.kind(kind);
        let ids: Vec<i64> = ks
            .closure
            .iter()
            .filter(|(a, _)| *a == id)
            .map(|(_, d)| *d)
            .collect();
        Ok(ks.entity_list(ids))
    }

    async fn find_rule(
        &self,
        subject_id: i64,
        object_id: i64,
        privilege_id: i64,
    ) -> Result<Option<Rule>> {
        let state = self.read()?;
        Ok(state.rules.get(&(subject_id, object_id, privilege_id)).cloned())
    }

    async fn insert_rule(
        &self,
        subject_id: i64,
        object_id: i64,
        privilege_id: i64,
        sign: RuleSign,
        is_static: bool,
    ) -> Result<()> {
        let mut state = self.write()?;
        state.rules.insert(
            (subject_id, object_id, privilege_id),
            Rule {
                subject_id,
                object_id,
                privilege_id,
                sign,
                is_static,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete_rule(
        &self,
        subject_id: i64,
        object_id: i64,
        privilege_id: i64,
        sign: RuleSign,
    ) -> Result<()> {
        let mut state = self.write()?;
        let key = (subject_id, object_id, privilege_id);
        if state.rules.get(&key).map(|r| r.sign) == Some(sign) {
            state.rules.remove(&key);
        }
        Ok(())
    }

    async fn rules_for(&self, side: RuleSide, id: i64) -> Result<Vec<RuleEntry>> {
        let state = self.read()?;
        let mut entries: Vec<RuleEntry> = state
            .rules
            .values()
            .filter(|rule| match side {
                RuleSide::Subject => rule.subject_id == id,
                RuleSide::Object => rule.object_id == id,
            })
            .filter_map(|rule| {
                let subject = state.subjects.entities.get(&rule.subject_id)?;
                let object = state.objects.entities.get(&rule.object_id)?;
                let privilege = state.privileges.entities.get(&rule.privilege_id)?;
                Some(RuleEntry {
                    subject_ext: subject.ext_id.clone(),
                    object_ext: object.ext_id.clone(),
                    privilege_ext: privilege.ext_id.clone(),
                    sign: rule.sign,
                })
            })
            .collect();
        entries.sort();
        Ok(entries)
    }

    async fn delete_static_rules(&self) -> Result<()> {
        let mut state = self.write()?;
        state.rules.retain(|_, rule| !rule.is_static);
        Ok(())
    }

    async fn denial_exists(
        &self,
        subject_id: i64,
        object_id: i64,
        privilege_id: i64,
        privilege_supremum_id: i64,
    ) -> Result<bool> {
        let state = self.read()?;
        Ok(state.rules.values().any(|rule| {
            rule.sign == RuleSign::Deny
                && state.subjects.closure.contains(&(rule.subject_id, subject_id))
                && state.objects.closure.contains(&(rule.object_id, object_id))
                && (rule.privilege_id == privilege_supremum_id
                    || state
                        .privileges
                        .closure
                        .contains(&(privilege_id, rule.privilege_id)))
        }))
    }

    async fn grant_exists(
        &self,
        subject_id: i64,
        object_id: i64,
        privilege_id: i64,
    ) -> Result<bool> {
        let state = self.read()?;
        Ok(state.rules.values().any(|rule| {
            rule.sign == RuleSign::Grant
                && state.subjects.closure.contains(&(rule.subject_id, subject_id))
                && state.objects.closure.contains(&(rule.object_id, object_id))
                && state
                    .privileges
                    .closure
                    .contains(&(rule.privilege_id, privilege_id))
        }))
    }

    async fn acquire_reconcile_lock(&self) -> Result<()> {
        Ok(())
    }

    async fn release_reconcile_lock(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(repo: &InMemoryAccessRepository, kind: EntityKind, ext: &str) -> Entity {
        repo.upsert_entity(kind, ext, ext, false).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_rewrites_description_and_flag() {
        let repo = InMemoryAccessRepository::new();
        let first = seed(&repo, EntityKind::Subject, "alice").await;
        let second = repo
            .upsert_entity(EntityKind::Subject, "alice", "Alice A.", true)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.description, "Alice A.");
        assert!(second.is_static);
    }

    #[tokio::test]
    async fn closure_tracks_diamond_merges() {
        let repo = InMemoryAccessRepository::new();
        let top = seed(&repo, EntityKind::Object, "top").await;
        let left = seed(&repo, EntityKind::Object, "left").await;
        let right = seed(&repo, EntityKind::Object, "right").await;
        let bottom = seed(&repo, EntityKind::Object, "bottom").await;

        for (p, c) in [
            (top.id, left.id),
            (top.id, right.id),
            (left.id, bottom.id),
            (right.id, bottom.id),
        ] {
            repo.insert_edge(EntityKind::Object, p, c, false).await.unwrap();
        }
        assert!(repo.is_reachable(EntityKind::Object, top.id, bottom.id).await.unwrap());

        // One arm of the diamond goes away; the other still carries the path.
        repo.remove_edge(EntityKind::Object, left.id, bottom.id).await.unwrap();
        assert!(repo.is_reachable(EntityKind::Object, top.id, bottom.id).await.unwrap());

        repo.remove_edge(EntityKind::Object, right.id, bottom.id).await.unwrap();
        assert!(!repo.is_reachable(EntityKind::Object, top.id, bottom.id).await.unwrap());
    }

    #[tokio::test]
    async fn removing_last_edge_restores_supremum_attachment() {
        let repo = InMemoryAccessRepository::new();
        let sup = repo
            .upsert_entity(EntityKind::Subject, SUPREMUM, "all subjects", true)
            .await
            .unwrap();
        let team = seed(&repo, EntityKind::Subject, "team").await;
        let alice = seed(&repo, EntityKind::Subject, "alice").await;
        repo.insert_edge(EntityKind::Subject, sup.id, team.id, false).await.unwrap();
        repo.insert_edge(EntityKind::Subject, team.id, alice.id, false).await.unwrap();

        repo.remove_edge(EntityKind::Subject, team.id, alice.id).await.unwrap();
        assert!(repo.is_reachable(EntityKind::Subject, sup.id, alice.id).await.unwrap());
        assert!(repo.edge_exists(EntityKind::Subject, sup.id, alice.id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_entity_cascades_rules_and_edges() {
        let repo = InMemoryAccessRepository::new();
        let s = seed(&repo, EntityKind::Subject, "alice").await;
        let o = seed(&repo, EntityKind::Object, "doc").await;
        let p = seed(&repo, EntityKind::Privilege, "read").await;
        repo.insert_rule(s.id, o.id, p.id, RuleSign::Grant, false).await.unwrap();

        repo.delete_entity(EntityKind::Subject, s.id).await.unwrap();
        assert!(repo.find_rule(s.id, o.id, p.id).await.unwrap().is_none());
        assert!(repo.find_entity(EntityKind::Subject, "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rules_list_deterministically() {
        let repo = InMemoryAccessRepository::new();
        let s = seed(&repo, EntityKind::Subject, "alice").await;
        let o1 = seed(&repo, EntityKind::Object, "beta").await;
        let o2 = seed(&repo, EntityKind::Object, "alpha").await;
        let p = seed(&repo, EntityKind::Privilege, "read").await;
        repo.insert_rule(s.id, o1.id, p.id, RuleSign::Grant, false).await.unwrap();
        repo.insert_rule(s.id, o2.id, p.id, RuleSign::Deny, false).await.unwrap();

        let entries = repo.rules_for(RuleSide::Subject, s.id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].object_ext, "alpha");
        assert_eq!(entries[1].object_ext, "beta");
    }
}
