//! DAG maintenance for one entity kind at a time: supremum bootstrap and
//! attachment, cycle-checked edge mutation, and the closure-backed set
//! queries the decision engine leans on.

use crate::error::{LatticeError, Result};
use crate::models::{Entity, EntityKind, SUPREMUM};
use crate::repository::AccessRepository;
use std::sync::Arc;
use tracing::debug;

fn supremum_description(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Subject => "all subjects",
        EntityKind::Object => "all objects",
        EntityKind::Privilege => "all privileges",
    }
}

pub struct Hierarchy {
    repository: Arc<dyn AccessRepository>,
}

impl Hierarchy {
    pub fn new(repository: Arc<dyn AccessRepository>) -> Self {
        Self { repository }
    }

    /// Upsert the `"*"` row for a kind. Run once per kind at engine
    /// construction and again by the reconciler's first phase.
    pub async fn ensure_supremum(&self, kind: EntityKind) -> Result<Entity> {
        self.repository
            .upsert_entity(kind, SUPREMUM, supremum_description(kind), true)
            .await
    }

    /// Give `node` a direct supremum edge unless some parent path already
    /// reaches the supremum.
    pub async fn attach_to_supremum(
        &self,
        kind: EntityKind,
        supremum: &Entity,
        node: &Entity,
        is_static: bool,
    ) -> Result<()> {
        if node.id == supremum.id
            || self.repository.is_reachable(kind, supremum.id, node.id).await?
        {
            return Ok(());
        }
        debug!(kind = %kind, node = %node.ext_id, "attaching node under supremum");
        self.repository
            .insert_edge(kind, supremum.id, node.id, is_static)
            .await
    }

    /// Insert a parent -> child edge. Self-loops and edges that would close
    /// a cycle are rejected; since the supremum is an ancestor of every
    /// node, no edge with the supremum as child can ever pass the check.
    /// Idempotent: an existing edge is left alone, except that a static
    /// insert claims a dynamic edge for the declaration.
    pub async fn add_edge(
        &self,
        kind: EntityKind,
        parent: &Entity,
        child: &Entity,
        is_static: bool,
    ) -> Result<()> {
        if parent.id == child.id || self.repository.is_reachable(kind, child.id, parent.id).await? {
            return Err(LatticeError::CyclicEdge {
                parent: parent.ext_id.clone(),
                child: child.ext_id.clone(),
            });
        }
        if self.repository.edge_exists(kind, parent.id, child.id).await? {
            if is_static {
                self.repository
                    .insert_edge(kind, parent.id, child.id, true)
                    .await?;
            }
            return Ok(());
        }
        debug!(kind = %kind, parent = %parent.ext_id, child = %child.ext_id, "adding edge");
        self.repository
            .insert_edge(kind, parent.id, child.id, is_static)
            .await
    }

    /// Remove a parent -> child edge; absence is success.
    pub async fn remove_edge(&self, kind: EntityKind, parent: &Entity, child: &Entity) -> Result<()> {
        debug!(kind = %kind, parent = %parent.ext_id, child = %child.ext_id, "removing edge");
        self.repository.remove_edge(kind, parent.id, child.id).await
    }

    pub async fn ancestors(&self, kind: EntityKind, node: &Entity) -> Result<Vec<Entity>> {
        self.repository.ancestors(kind, node.id).await
    }

    pub async fn descendants(&self, kind: EntityKind, node: &Entity) -> Result<Vec<Entity>> {
        self.repository.descendants(kind, node.id).await
    }

    pub async fn parents(&self, kind: EntityKind, node: &Entity) -> Result<Vec<Entity>> {
        self.repository.parents(kind, node.id).await
    }

    pub async fn children(&self, kind: EntityKind, node: &Entity) -> Result<Vec<Entity>> {
        self.repository.children(kind, node.id).await
    }

    /// External ids of every proper descendant, ordered.
    pub async fn members(&self, kind: EntityKind, node: &Entity) -> Result<Vec<String>> {
        let descendants = self.repository.descendants(kind, node.id).await?;
        Ok(descendants
            .into_iter()
            .filter(|e| e.id != node.id)
            .map(|e| e.ext_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryAccessRepository;

    async fn fixture() -> (Hierarchy, Entity) {
        let repo: Arc<dyn AccessRepository> = Arc::new(InMemoryAccessRepository::new());
        let hierarchy = Hierarchy::new(repo);
        let sup = hierarchy.ensure_supremum(EntityKind::Subject).await.unwrap();
        (hierarchy, sup)
    }

    async fn node(h: &Hierarchy, sup: &Entity, ext: &str) -> Entity {
        let entity = h
            .repository
            .upsert_entity(EntityKind::Subject, ext, ext, false)
            .await
            .unwrap();
        h.attach_to_supremum(EntityKind::Subject, sup, &entity, false)
            .await
            .unwrap();
        entity
    }

    #[tokio::test]
    async fn supremum_is_ancestor_of_every_node() {
        let (h, sup) = fixture().await;
        let a = node(&h, &sup, "a").await;
        let b = node(&h, &sup, "b").await;
        h.add_edge(EntityKind::Subject, &a, &b, false).await.unwrap();

        let ancestors = h.ancestors(EntityKind::Subject, &b).await.unwrap();
        let exts: Vec<&str> = ancestors.iter().map(|e| e.ext_id.as_str()).collect();
        assert!(exts.contains(&SUPREMUM));
        assert!(exts.contains(&"a"));
        assert!(exts.contains(&"b"));
    }

    #[tokio::test]
    async fn self_loops_and_cycles_are_rejected() {
        let (h, sup) = fixture().await;
        let a = node(&h, &sup, "a").await;
        let b = node(&h, &sup, "b").await;
        let c = node(&h, &sup, "c").await;
        h.add_edge(EntityKind::Subject, &a, &b, false).await.unwrap();
        h.add_edge(EntityKind::Subject, &b, &c, false).await.unwrap();

        assert!(matches!(
            h.add_edge(EntityKind::Subject, &a, &a, false).await,
            Err(LatticeError::CyclicEdge { .. })
        ));
        assert!(matches!(
            h.add_edge(EntityKind::Subject, &c, &a, false).await,
            Err(LatticeError::CyclicEdge { .. })
        ));
    }

    #[tokio::test]
    async fn no_edge_can_point_at_the_supremum() {
        let (h, sup) = fixture().await;
        let a = node(&h, &sup, "a").await;
        assert!(matches!(
            h.add_edge(EntityKind::Subject, &a, &sup, false).await,
            Err(LatticeError::CyclicEdge { .. })
        ));
    }

    #[tokio::test]
    async fn members_excludes_the_node_itself() {
        let (h, sup) = fixture().await;
        let a = node(&h, &sup, "a").await;
        let b = node(&h, &sup, "b").await;
        let c = node(&h, &sup, "c").await;
        h.add_edge(EntityKind::Subject, &a, &b, false).await.unwrap();
        h.add_edge(EntityKind::Subject, &a, &c, false).await.unwrap();

        assert_eq!(h.members(EntityKind::Subject, &a).await.unwrap(), vec!["b", "c"]);
        let all = h.members(EntityKind::Subject, &sup).await.unwrap();
        assert_eq!(all, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn existing_edges_insert_idempotently() {
        let (h, sup) = fixture().await;
        let a = node(&h, &sup, "a").await;
        let b = node(&h, &sup, "b").await;
        h.add_edge(EntityKind::Subject, &a, &b, false).await.unwrap();
        h.add_edge(EntityKind::Subject, &a, &b, false).await.unwrap();
        assert_eq!(h.parents(EntityKind::Subject, &b).await.unwrap().len(), 2);
    }
}
