//! Authorization decisions.
//!
//! The evaluator asks two existence questions against the closure-joined
//! rule table, always negative first:
//!
//! 1. A `-` rule anywhere above the subject and object whose privilege is
//!    implied by the query privilege (or is the privilege supremum) vetoes
//!    the query, unconditionally — no positive rule can undo it.
//! 2. Otherwise a `+` rule above the subject, object, and privilege grants
//!    the query.
//! 3. Otherwise the answer is denied: nothing is permitted by default.
//!
//! The privilege direction is asymmetric on purpose: a grant on a stronger
//! privilege implies the weaker ones below it, while a veto on a weaker
//! privilege must also take down every stronger privilege that implies it.
//! Denying `read` on a document therefore denies `edit` on it too.

use crate::error::Result;
use crate::models::{Decision, Entity};
use crate::repository::AccessRepository;
use std::sync::Arc;
use tracing::debug;

pub struct DecisionEvaluator {
    repository: Arc<dyn AccessRepository>,
}

impl DecisionEvaluator {
    pub fn new(repository: Arc<dyn AccessRepository>) -> Self {
        Self { repository }
    }

    /// Decide a resolved `(subject, object, privilege)` query.
    pub async fn evaluate(
        &self,
        subject: &Entity,
        object: &Entity,
        privilege: &Entity,
        privilege_supremum: &Entity,
    ) -> Result<Decision> {
        if self
            .repository
            .denial_exists(subject.id, object.id, privilege.id, privilege_supremum.id)
            .await?
        {
            debug!(
                subject = %subject.ext_id,
                object = %object.ext_id,
                privilege = %privilege.ext_id,
                "denied by negative rule"
            );
            return Ok(Decision::Denied);
        }

        if self
            .repository
            .grant_exists(subject.id, object.id, privilege.id)
            .await?
        {
            debug!(
                subject = %subject.ext_id,
                object = %object.ext_id,
                privilege = %privilege.ext_id,
                "granted by positive rule"
            );
            return Ok(Decision::Granted);
        }

        debug!(
            subject = %subject.ext_id,
            object = %object.ext_id,
            privilege = %privilege.ext_id,
            "no applicable rule, denied by default"
        );
        Ok(Decision::Denied)
    }
}
