//! Declarative seeding.
//!
//! Applications describe their baseline privileges, roles, collections,
//! and rules as data; on each start-up [`AuthorizationEngine::initialize`]
//! converges the persisted static rows to that declaration without
//! disturbing anything created at runtime.
//!
//! [`AuthorizationEngine::initialize`]: crate::engine::AuthorizationEngine::initialize

use crate::engine::AuthorizationEngine;
use crate::error::Result;
use crate::models::{Entity, EntityKind, RuleSign, SUPREMUM};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

/// `permission(ext_id, description, implies: [...])` — an edge runs from
/// the declared privilege to each implied privilege, so a grant on the
/// declared privilege carries down to the implied ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDecl {
    pub ext_id: String,
    pub description: String,
    #[serde(default)]
    pub implies: Vec<String>,
}

/// `role(ext_id, description, implies: [...])` — creates both a subject
/// and an object row; an edge runs from each implied role to the declared
/// role, making the declared role a descendant that inherits the implied
/// roles' grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleDecl {
    pub ext_id: String,
    pub description: String,
    #[serde(default)]
    pub implies: Vec<String>,
}

/// `collection(ext_id, description, in: [...])` — creates an object row;
/// an edge runs from each containing collection to the declared one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDecl {
    pub ext_id: String,
    pub description: String,
    #[serde(default, rename = "in")]
    pub within: Vec<String>,
}

/// A baseline signed rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDecl {
    pub subject: String,
    pub object: String,
    pub privilege: String,
    pub sign: RuleSign,
}

/// A full declaration set. Buildable in code or deserializable from a
/// configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Declarations {
    #[serde(default)]
    pub permissions: Vec<PermissionDecl>,
    #[serde(default)]
    pub roles: Vec<RoleDecl>,
    #[serde(default)]
    pub collections: Vec<CollectionDecl>,
    #[serde(default)]
    pub rules: Vec<RuleDecl>,
}

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permission(mut self, ext_id: &str, description: &str, implies: &[&str]) -> Self {
        self.permissions.push(PermissionDecl {
            ext_id: ext_id.to_string(),
            description: description.to_string(),
            implies: implies.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn role(mut self, ext_id: &str, description: &str, implies: &[&str]) -> Self {
        self.roles.push(RoleDecl {
            ext_id: ext_id.to_string(),
            description: description.to_string(),
            implies: implies.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn collection(mut self, ext_id: &str, description: &str, within: &[&str]) -> Self {
        self.collections.push(CollectionDecl {
            ext_id: ext_id.to_string(),
            description: description.to_string(),
            within: within.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Grant `privilege` on `object` to `subject`.
    pub fn grant(mut self, privilege: &str, object: &str, subject: &str) -> Self {
        self.rules.push(RuleDecl {
            subject: subject.to_string(),
            object: object.to_string(),
            privilege: privilege.to_string(),
            sign: RuleSign::Grant,
        });
        self
    }

    /// Deny `privilege` on `object` to `subject`.
    pub fn deny(mut self, privilege: &str, object: &str, subject: &str) -> Self {
        self.rules.push(RuleDecl {
            subject: subject.to_string(),
            object: object.to_string(),
            privilege: privilege.to_string(),
            sign: RuleSign::Deny,
        });
        self
    }
}

/// Converges persisted static state to a declaration set in five phases,
/// serialized against concurrent runs through the backend's reconcile
/// lock. Each phase is idempotent, so a crashed run is repaired by the
/// next one.
pub struct Reconciler<'a> {
    engine: &'a AuthorizationEngine,
}

impl<'a> Reconciler<'a> {
    pub fn new(engine: &'a AuthorizationEngine) -> Self {
        Self { engine }
    }

    pub async fn run(&self, declarations: &Declarations) -> Result<()> {
        let repository = self.engine.repository();
        repository.acquire_reconcile_lock().await?;
        let outcome = self.run_phases(declarations).await;
        let unlock = repository.release_reconcile_lock().await;
        outcome.and(unlock)
    }

    async fn run_phases(&self, declarations: &Declarations) -> Result<()> {
        info!(
            permissions = declarations.permissions.len(),
            roles = declarations.roles.len(),
            collections = declarations.collections.len(),
            rules = declarations.rules.len(),
            "reconciling static state"
        );
        self.ensure_suprema().await?;
        self.sweep_orphans(declarations).await?;
        self.register_declared(declarations).await?;
        self.rebuild_rules(declarations).await?;
        self.reconcile_edges(declarations).await?;
        Ok(())
    }

    async fn ensure_suprema(&self) -> Result<()> {
        for kind in EntityKind::ALL {
            self.engine.hierarchy().ensure_supremum(kind).await?;
        }
        Ok(())
    }

    /// Static rules go first so that entity deletion never trips a
    /// dangling reference; static entities that fell out of the
    /// declaration cascade their remaining (dynamic) rules and edges.
    async fn sweep_orphans(&self, declarations: &Declarations) -> Result<()> {
        let repository = self.engine.repository();
        repository.delete_static_rules().await?;

        let roles: HashSet<&str> = declarations.roles.iter().map(|r| r.ext_id.as_str()).collect();
        let mut objects: HashSet<&str> = roles.clone();
        objects.extend(declarations.collections.iter().map(|c| c.ext_id.as_str()));
        let privileges: HashSet<&str> = declarations
            .permissions
            .iter()
            .map(|p| p.ext_id.as_str())
            .collect();

        for (kind, declared) in [
            (EntityKind::Subject, &roles),
            (EntityKind::Object, &objects),
            (EntityKind::Privilege, &privileges),
        ] {
            for entity in repository.static_entities(kind).await? {
                if entity.is_supremum() || declared.contains(entity.ext_id.as_str()) {
                    continue;
                }
                debug!(kind = %kind, ext_id = %entity.ext_id, "sweeping undeclared static entity");
                repository.delete_entity(kind, entity.id).await?;
            }
        }
        Ok(())
    }

    async fn register_declared(&self, declarations: &Declarations) -> Result<()> {
        for decl in &declarations.permissions {
            self.engine
                .register(EntityKind::Privilege, &decl.ext_id, &decl.description, true)
                .await?;
        }
        for decl in &declarations.roles {
            self.engine
                .register(EntityKind::Subject, &decl.ext_id, &decl.description, true)
                .await?;
            self.engine
                .register(EntityKind::Object, &decl.ext_id, &decl.description, true)
                .await?;
        }
        for decl in &declarations.collections {
            self.engine
                .register(EntityKind::Object, &decl.ext_id, &decl.description, true)
                .await?;
        }
        Ok(())
    }

    async fn rebuild_rules(&self, declarations: &Declarations) -> Result<()> {
        for decl in &declarations.rules {
            let subject = self.engine.resolve_subject(&decl.subject).await?;
            let object = self.engine.resolve_object(&decl.object).await?;
            let privilege = self.engine.resolve_privilege(&decl.privilege).await?;
            self.engine
                .put_rule(&subject, &object, &privilege, decl.sign, true)
                .await?;
        }
        Ok(())
    }

    async fn reconcile_edges(&self, declarations: &Declarations) -> Result<()> {
        for decl in &declarations.roles {
            for kind in [EntityKind::Subject, EntityKind::Object] {
                self.converge_parents(kind, &decl.ext_id, &decl.implies).await?;
            }
        }
        for decl in &declarations.collections {
            self.converge_parents(EntityKind::Object, &decl.ext_id, &decl.within)
                .await?;
        }
        for decl in &declarations.permissions {
            self.converge_children(EntityKind::Privilege, &decl.ext_id, &decl.implies)
                .await?;
        }
        Ok(())
    }

    /// Drive the node's static parent edges to the declared set. An empty
    /// declaration keeps the node directly under the supremum; once
    /// declared parents exist they carry the supremum path themselves.
    async fn converge_parents(
        &self,
        kind: EntityKind,
        node_ext: &str,
        declared_parents: &[String],
    ) -> Result<()> {
        let node = self.resolve_declared(kind, node_ext).await?;
        let mut target: Vec<String> = declared_parents.to_vec();
        if target.is_empty() {
            target.push(SUPREMUM.to_string());
        }

        let hierarchy = self.engine.hierarchy();
        for parent_ext in &target {
            let parent = self.resolve_declared(kind, parent_ext).await?;
            hierarchy.add_edge(kind, &parent, &node, true).await?;
        }

        let target_set: HashSet<&str> = target.iter().map(|s| s.as_str()).collect();
        for stale in self
            .engine
            .repository()
            .static_parents(kind, node.id)
            .await?
            .into_iter()
            .filter(|p| !target_set.contains(p.ext_id.as_str()))
        {
            debug!(kind = %kind, parent = %stale.ext_id, child = %node.ext_id, "removing stale static edge");
            hierarchy.remove_edge(kind, &stale, &node).await?;
        }
        Ok(())
    }

    /// Privilege declarations point downward: drive the node's static
    /// child edges to the declared implication list.
    async fn converge_children(
        &self,
        kind: EntityKind,
        node_ext: &str,
        declared_children: &[String],
    ) -> Result<()> {
        let node = self.resolve_declared(kind, node_ext).await?;
        let hierarchy = self.engine.hierarchy();
        for child_ext in declared_children {
            let child = self.resolve_declared(kind, child_ext).await?;
            hierarchy.add_edge(kind, &node, &child, true).await?;
        }

        let target_set: HashSet<&str> = declared_children.iter().map(|s| s.as_str()).collect();
        for stale in self
            .engine
            .repository()
            .static_children(kind, node.id)
            .await?
            .into_iter()
            .filter(|c| !target_set.contains(c.ext_id.as_str()))
        {
            debug!(kind = %kind, parent = %node.ext_id, child = %stale.ext_id, "removing stale static edge");
            hierarchy.remove_edge(kind, &node, &stale).await?;
        }
        Ok(())
    }

    async fn resolve_declared(&self, kind: EntityKind, ext: &str) -> Result<Entity> {
        match kind {
            EntityKind::Subject => self.engine.resolve_subject(ext).await,
            EntityKind::Object => self.engine.resolve_object(ext).await,
            EntityKind::Privilege => self.engine.resolve_privilege(ext).await,
        }
    }
}
