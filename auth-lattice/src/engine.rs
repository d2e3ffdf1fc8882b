//! Public surface of the authorization engine.
//!
//! The engine owns one repository handle and composes the hierarchy
//! service, the rule store, and the decision evaluator over it. Every
//! caller-supplied identifier is normalized on entry; every mutation
//! invalidates the optional decision cache.

use crate::decision::DecisionEvaluator;
use crate::error::{LatticeError, Result};
use crate::hierarchy::Hierarchy;
use crate::ident::RawId;
use crate::models::{Decision, Entity, EntityKind, RuleEntry, RuleSide, RuleSign};
use crate::reconcile::{Declarations, Reconciler};
use crate::repository::postgres::PostgresAccessRepository;
use crate::repository::AccessRepository;
use crate::rules::RuleStore;
use crate::settings::EngineSettings;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

struct Suprema {
    subject: Entity,
    object: Entity,
    privilege: Entity,
}

pub struct AuthorizationEngine {
    repository: Arc<dyn AccessRepository>,
    hierarchy: Hierarchy,
    rules: RuleStore,
    evaluator: DecisionEvaluator,
    suprema: Suprema,
    cache: Option<DashMap<String, Decision>>,
}

impl AuthorizationEngine {
    /// Create an engine over the given repository, bootstrapping the
    /// supremum row of each kind.
    pub async fn new(repository: Arc<dyn AccessRepository>) -> Result<Self> {
        let hierarchy = Hierarchy::new(repository.clone());
        let suprema = Suprema {
            subject: hierarchy.ensure_supremum(EntityKind::Subject).await?,
            object: hierarchy.ensure_supremum(EntityKind::Object).await?,
            privilege: hierarchy.ensure_supremum(EntityKind::Privilege).await?,
        };
        Ok(Self {
            rules: RuleStore::new(repository.clone()),
            evaluator: DecisionEvaluator::new(repository.clone()),
            hierarchy,
            repository,
            suprema,
            cache: None,
        })
    }

    /// Connect to Postgres as described by the settings and build an
    /// engine over it.
    pub async fn from_settings(settings: &EngineSettings) -> Result<Self> {
        let pool = settings.connect().await?;
        let repository: Arc<dyn AccessRepository> = Arc::new(PostgresAccessRepository::new(pool));
        let engine = Self::new(repository).await?;
        Ok(if settings.decision_cache {
            engine.with_decision_cache()
        } else {
            engine
        })
    }

    /// Enable in-process memoization of decisions. The cache is cleared on
    /// every mutation.
    pub fn with_decision_cache(mut self) -> Self {
        self.cache = Some(DashMap::new());
        self
    }

    // -----------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------

    pub async fn register_subject(
        &self,
        id: impl Into<RawId>,
        description: &str,
    ) -> Result<Entity> {
        self.register(EntityKind::Subject, &id.into().canonical(), description, false)
            .await
    }

    pub async fn register_object(&self, id: impl Into<RawId>, description: &str) -> Result<Entity> {
        self.register(EntityKind::Object, &id.into().canonical(), description, false)
            .await
    }

    pub async fn register_permission(
        &self,
        id: impl Into<RawId>,
        description: &str,
    ) -> Result<Entity> {
        self.register(EntityKind::Privilege, &id.into().canonical(), description, false)
            .await
    }

    /// Shared registration path. The public wrappers always pass
    /// `is_static = false`; only the reconciler registers static rows.
    pub(crate) async fn register(
        &self,
        kind: EntityKind,
        ext_id: &str,
        description: &str,
        is_static: bool,
    ) -> Result<Entity> {
        if ext_id.is_empty() {
            return Err(LatticeError::IdIsRequired);
        }
        if description.trim().is_empty() {
            return Err(LatticeError::DescriptionIsRequired);
        }
        let entity = self
            .repository
            .upsert_entity(kind, ext_id, description, is_static)
            .await?;
        self.hierarchy
            .attach_to_supremum(kind, self.supremum(kind), &entity, is_static)
            .await?;
        self.invalidate_cache();
        info!(kind = %kind, ext_id = %entity.ext_id, is_static, "registered entity");
        Ok(entity)
    }

    pub async fn lookup(&self, kind: EntityKind, id: impl Into<RawId>) -> Result<Option<Entity>> {
        self.repository.find_entity(kind, &id.into().canonical()).await
    }

    pub async fn exists(&self, kind: EntityKind, id: impl Into<RawId>) -> Result<bool> {
        Ok(self.lookup(kind, id).await?.is_some())
    }

    /// Delete a dynamic entity together with its rules and edges. The
    /// supremum and declaration-owned rows are not reachable from this
    /// surface.
    pub async fn remove_entity(&self, kind: EntityKind, id: impl Into<RawId>) -> Result<()> {
        let ext = id.into().canonical();
        let entity = self.resolve(kind, &ext, || LatticeError::NotFound(ext.clone())).await?;
        if entity.is_supremum() || entity.is_static {
            return Err(LatticeError::NotFound(ext));
        }
        self.repository.delete_entity(kind, entity.id).await?;
        self.invalidate_cache();
        info!(kind = %kind, ext_id = %ext, "removed entity");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Rules
    // -----------------------------------------------------------------

    pub async fn grant(
        &self,
        subject: impl Into<RawId>,
        object: impl Into<RawId>,
        privilege: impl Into<RawId>,
    ) -> Result<()> {
        let (s, o, p) = self.resolve_triple(subject, object, privilege).await?;
        self.put_rule(&s, &o, &p, RuleSign::Grant, false).await
    }

    pub async fn deny(
        &self,
        subject: impl Into<RawId>,
        object: impl Into<RawId>,
        privilege: impl Into<RawId>,
    ) -> Result<()> {
        let (s, o, p) = self.resolve_triple(subject, object, privilege).await?;
        self.put_rule(&s, &o, &p, RuleSign::Deny, false).await
    }

    /// Remove a positive rule from the triple; absence is success.
    pub async fn revoke(
        &self,
        subject: impl Into<RawId>,
        object: impl Into<RawId>,
        privilege: impl Into<RawId>,
    ) -> Result<()> {
        let (s, o, p) = self.resolve_triple(subject, object, privilege).await?;
        self.rules.drop(&s, &o, &p, RuleSign::Grant).await?;
        self.invalidate_cache();
        Ok(())
    }

    /// Remove a negative rule from the triple; absence is success.
    pub async fn allow(
        &self,
        subject: impl Into<RawId>,
        object: impl Into<RawId>,
        privilege: impl Into<RawId>,
    ) -> Result<()> {
        let (s, o, p) = self.resolve_triple(subject, object, privilege).await?;
        self.rules.drop(&s, &o, &p, RuleSign::Deny).await?;
        self.invalidate_cache();
        Ok(())
    }

    pub(crate) async fn put_rule(
        &self,
        subject: &Entity,
        object: &Entity,
        privilege: &Entity,
        sign: RuleSign,
        is_static: bool,
    ) -> Result<()> {
        self.rules.put(subject, object, privilege, sign, is_static).await?;
        self.invalidate_cache();
        Ok(())
    }

    /// Rules the entity participates in, on the subject or object side,
    /// ordered by `(subject, object, privilege, sign)`. Unknown ids yield
    /// an empty list.
    pub async fn list_rules(&self, id: impl Into<RawId>, side: RuleSide) -> Result<Vec<RuleEntry>> {
        let kind = match side {
            RuleSide::Subject => EntityKind::Subject,
            RuleSide::Object => EntityKind::Object,
        };
        match self.repository.find_entity(kind, &id.into().canonical()).await? {
            Some(entity) => self.rules.list(side, &entity).await,
            None => Ok(Vec::new()),
        }
    }

    // -----------------------------------------------------------------
    // Hierarchy
    // -----------------------------------------------------------------

    pub async fn add_child(
        &self,
        parent: impl Into<RawId>,
        child: impl Into<RawId>,
        kind: EntityKind,
    ) -> Result<()> {
        let (parent, child) = self.resolve_edge(kind, parent, child).await?;
        self.hierarchy.add_edge(kind, &parent, &child, false).await?;
        self.invalidate_cache();
        Ok(())
    }

    pub async fn remove_child(
        &self,
        parent: impl Into<RawId>,
        child: impl Into<RawId>,
        kind: EntityKind,
    ) -> Result<()> {
        let (parent, child) = self.resolve_edge(kind, parent, child).await?;
        self.hierarchy.remove_edge(kind, &parent, &child).await?;
        self.invalidate_cache();
        Ok(())
    }

    /// External ids of every proper descendant of the node, ordered.
    pub async fn members(&self, kind: EntityKind, id: impl Into<RawId>) -> Result<Vec<String>> {
        let ext = id.into().canonical();
        let entity = self.resolve(kind, &ext, || LatticeError::NotFound(ext.clone())).await?;
        self.hierarchy.members(kind, &entity).await
    }

    pub async fn parents_of(&self, kind: EntityKind, id: impl Into<RawId>) -> Result<Vec<Entity>> {
        let ext = id.into().canonical();
        let entity = self.resolve(kind, &ext, || LatticeError::NotFound(ext.clone())).await?;
        self.hierarchy.parents(kind, &entity).await
    }

    pub async fn children_of(&self, kind: EntityKind, id: impl Into<RawId>) -> Result<Vec<Entity>> {
        let ext = id.into().canonical();
        let entity = self.resolve(kind, &ext, || LatticeError::NotFound(ext.clone())).await?;
        self.hierarchy.children(kind, &entity).await
    }

    pub async fn ancestors_of(&self, kind: EntityKind, id: impl Into<RawId>) -> Result<Vec<Entity>> {
        let ext = id.into().canonical();
        let entity = self.resolve(kind, &ext, || LatticeError::NotFound(ext.clone())).await?;
        self.hierarchy.ancestors(kind, &entity).await
    }

    pub async fn descendants_of(
        &self,
        kind: EntityKind,
        id: impl Into<RawId>,
    ) -> Result<Vec<Entity>> {
        let ext = id.into().canonical();
        let entity = self.resolve(kind, &ext, || LatticeError::NotFound(ext.clone())).await?;
        self.hierarchy.descendants(kind, &entity).await
    }

    // -----------------------------------------------------------------
    // Decisions
    // -----------------------------------------------------------------

    /// Decide whether the subject may exercise the privilege on the
    /// object. Unknown identifiers surface as `invalid_*` errors, so
    /// enforcement points compose with `?` while callers that want the
    /// decision as data match on the `Ok` value.
    pub async fn check(
        &self,
        subject: impl Into<RawId>,
        object: impl Into<RawId>,
        privilege: impl Into<RawId>,
    ) -> Result<Decision> {
        let (s, o, p) = self.resolve_triple(subject, object, privilege).await?;

        let cache_key = format!("{}\u{1f}{}\u{1f}{}", s.ext_id, o.ext_id, p.ext_id);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&cache_key) {
                debug!(key = %cache_key, "decision cache hit");
                return Ok(*hit);
            }
        }

        let decision = self
            .evaluator
            .evaluate(&s, &o, &p, &self.suprema.privilege)
            .await?;

        if let Some(cache) = &self.cache {
            cache.insert(cache_key, decision);
        }
        Ok(decision)
    }

    /// Convenience form of [`check`](Self::check).
    pub async fn is_granted(
        &self,
        subject: impl Into<RawId>,
        object: impl Into<RawId>,
        privilege: impl Into<RawId>,
    ) -> Result<bool> {
        Ok(self.check(subject, object, privilege).await?.is_granted())
    }

    // -----------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------

    /// Converge persisted static state to the declaration set. Dynamic
    /// rows, rules, and edges are left untouched. Idempotent; typically
    /// run at process start.
    pub async fn initialize(&self, declarations: &Declarations) -> Result<()> {
        Reconciler::new(self).run(declarations).await?;
        self.invalidate_cache();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Internals shared with the reconciler
    // -----------------------------------------------------------------

    pub(crate) fn repository(&self) -> &Arc<dyn AccessRepository> {
        &self.repository
    }

    pub(crate) fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    pub(crate) fn supremum(&self, kind: EntityKind) -> &Entity {
        match kind {
            EntityKind::Subject => &self.suprema.subject,
            EntityKind::Object => &self.suprema.object,
            EntityKind::Privilege => &self.suprema.privilege,
        }
    }

    pub(crate) fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    async fn resolve(
        &self,
        kind: EntityKind,
        ext: &str,
        missing: impl FnOnce() -> LatticeError,
    ) -> Result<Entity> {
        self.repository
            .find_entity(kind, ext)
            .await?
            .ok_or_else(missing)
    }

    pub(crate) async fn resolve_subject(&self, ext: &str) -> Result<Entity> {
        self.resolve(EntityKind::Subject, ext, || {
            LatticeError::InvalidSubject(ext.to_string())
        })
        .await
    }

    pub(crate) async fn resolve_object(&self, ext: &str) -> Result<Entity> {
        self.resolve(EntityKind::Object, ext, || {
            LatticeError::InvalidObject(ext.to_string())
        })
        .await
    }

    pub(crate) async fn resolve_privilege(&self, ext: &str) -> Result<Entity> {
        self.resolve(EntityKind::Privilege, ext, || {
            LatticeError::InvalidPermission(ext.to_string())
        })
        .await
    }

    async fn resolve_triple(
        &self,
        subject: impl Into<RawId>,
        object: impl Into<RawId>,
        privilege: impl Into<RawId>,
    ) -> Result<(Entity, Entity, Entity)> {
        let s = self.resolve_subject(&subject.into().canonical()).await?;
        let o = self.resolve_object(&object.into().canonical()).await?;
        let p = self.resolve_privilege(&privilege.into().canonical()).await?;
        Ok((s, o, p))
    }

    async fn resolve_edge(
        &self,
        kind: EntityKind,
        parent: impl Into<RawId>,
        child: impl Into<RawId>,
    ) -> Result<(Entity, Entity)> {
        let parent_ext = parent.into().canonical();
        let child_ext = child.into().canonical();
        let parent = self
            .resolve(kind, &parent_ext, || LatticeError::InvalidParent(parent_ext.clone()))
            .await?;
        let child = self
            .resolve(kind, &child_ext, || LatticeError::InvalidChild(child_ext.clone()))
            .await?;
        Ok((parent, child))
    }
}
