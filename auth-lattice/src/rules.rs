//! Rule persistence: signed grants keyed by the (subject, object,
//! privilege) triple, with at most one sign per triple at any moment.

use crate::error::{LatticeError, Result};
use crate::models::{Entity, RuleEntry, RuleSide, RuleSign};
use crate::repository::AccessRepository;
use std::sync::Arc;
use tracing::{debug, info};

pub struct RuleStore {
    repository: Arc<dyn AccessRepository>,
}

impl RuleStore {
    pub fn new(repository: Arc<dyn AccessRepository>) -> Self {
        Self { repository }
    }

    /// Persist a signed rule for the triple. Re-putting the same sign is a
    /// silent no-op; the opposite sign on an existing triple is a conflict
    /// and the caller must drop the old rule first.
    pub async fn put(
        &self,
        subject: &Entity,
        object: &Entity,
        privilege: &Entity,
        sign: RuleSign,
        is_static: bool,
    ) -> Result<()> {
        match self
            .repository
            .find_rule(subject.id, object.id, privilege.id)
            .await?
        {
            Some(existing) if existing.sign == sign => {
                debug!(
                    subject = %subject.ext_id,
                    object = %object.ext_id,
                    privilege = %privilege.ext_id,
                    %sign,
                    "rule already present"
                );
                Ok(())
            }
            Some(_) => Err(LatticeError::ConflictingRuleType {
                subject: subject.ext_id.clone(),
                object: object.ext_id.clone(),
                privilege: privilege.ext_id.clone(),
            }),
            None => {
                info!(
                    subject = %subject.ext_id,
                    object = %object.ext_id,
                    privilege = %privilege.ext_id,
                    %sign,
                    "writing rule"
                );
                self.repository
                    .insert_rule(subject.id, object.id, privilege.id, sign, is_static)
                    .await
            }
        }
    }

    /// Remove the rule with the given sign from the triple; a missing rule
    /// or one with the other sign is left alone and reported as success.
    pub async fn drop(
        &self,
        subject: &Entity,
        object: &Entity,
        privilege: &Entity,
        sign: RuleSign,
    ) -> Result<()> {
        debug!(
            subject = %subject.ext_id,
            object = %object.ext_id,
            privilege = %privilege.ext_id,
            %sign,
            "dropping rule"
        );
        self.repository
            .delete_rule(subject.id, object.id, privilege.id, sign)
            .await
    }

    /// All rules the entity participates in on the given side, ordered by
    /// `(subject, object, privilege, sign)`.
    pub async fn list(&self, side: RuleSide, entity: &Entity) -> Result<Vec<RuleEntry>> {
        self.repository.rules_for(side, entity.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;
    use crate::repository::InMemoryAccessRepository;

    async fn fixture() -> (RuleStore, Entity, Entity, Entity) {
        let repo: Arc<dyn AccessRepository> = Arc::new(InMemoryAccessRepository::new());
        let s = repo
            .upsert_entity(EntityKind::Subject, "alice", "alice", false)
            .await
            .unwrap();
        let o = repo
            .upsert_entity(EntityKind::Object, "doc", "doc", false)
            .await
            .unwrap();
        let p = repo
            .upsert_entity(EntityKind::Privilege, "edit", "edit", false)
            .await
            .unwrap();
        (RuleStore::new(repo), s, o, p)
    }

    #[tokio::test]
    async fn same_sign_is_idempotent() {
        let (store, s, o, p) = fixture().await;
        store.put(&s, &o, &p, RuleSign::Grant, false).await.unwrap();
        store.put(&s, &o, &p, RuleSign::Grant, false).await.unwrap();
        let rules = store.list(RuleSide::Subject, &s).await.unwrap();
        assert_eq!(rules.len(), 1);
    }

    #[tokio::test]
    async fn opposite_sign_conflicts() {
        let (store, s, o, p) = fixture().await;
        store.put(&s, &o, &p, RuleSign::Grant, false).await.unwrap();
        assert!(matches!(
            store.put(&s, &o, &p, RuleSign::Deny, false).await,
            Err(LatticeError::ConflictingRuleType { .. })
        ));
    }

    #[tokio::test]
    async fn drop_is_sign_exact_and_tolerates_absence() {
        let (store, s, o, p) = fixture().await;
        store.drop(&s, &o, &p, RuleSign::Grant).await.unwrap();

        store.put(&s, &o, &p, RuleSign::Deny, false).await.unwrap();
        store.drop(&s, &o, &p, RuleSign::Grant).await.unwrap();
        assert_eq!(store.list(RuleSide::Subject, &s).await.unwrap().len(), 1);

        store.drop(&s, &o, &p, RuleSign::Deny).await.unwrap();
        assert!(store.list(RuleSide::Subject, &s).await.unwrap().is_empty());
    }
}
