//! PostgreSQL-backed repository.
//!
//! Every mutation runs in a single transaction so edge rows, closure rows,
//! and rule rows can never be observed out of step. The closure tables are
//! extended incrementally on edge insert and rebuilt from the edge tables
//! (recursive CTE) on removal, where incremental pair deletion would be
//! wrong under diamond merges. The decision probes are single EXISTS
//! queries over the closure-joined rule table.
//!
//! Schema lives in `migrations/`; run `sqlx migrate run` before first use.

use crate::error::{LatticeError, Result};
use crate::models::{Entity, EntityKind, Rule, RuleEntry, RuleSide, RuleSign, SUPREMUM};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Advisory lock key serializing reconciliation runs.
const RECONCILE_LOCK_KEY: i64 = 0x6C61_7474_6963_65;

pub struct PostgresAccessRepository {
    pool: PgPool,
    /// Connection pinned while the reconcile advisory lock is held.
    reconcile_guard: Mutex<Option<sqlx::pool::PoolConnection<Postgres>>>,
}

impl PostgresAccessRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            reconcile_guard: Mutex::new(None),
        }
    }

    pub async fn from_connection_string(connection_string: &str) -> Result<Self> {
        let pool = PgPool::connect(connection_string)
            .await
            .map_err(|e| LatticeError::Storage(format!("failed to connect: {}", e)))?;
        Ok(Self::new(pool))
    }
}

fn entity_from_row(row: &PgRow) -> Result<Entity> {
    Ok(Entity {
        id: row.try_get("id")?,
        ext_id: row.try_get("ext_id")?,
        description: row.try_get("description")?,
        is_static: row.try_get("is_static")?,
        created_at: row.try_get("created_at")?,
    })
}

fn sign_from_wire(raw: &str) -> Result<RuleSign> {
    RuleSign::from_str(raw)
        .ok_or_else(|| LatticeError::Storage(format!("unexpected rule sign: {}", raw)))
}

/// Extend the closure for a fresh (parent, child) edge: every ancestor of
/// the parent now reaches every descendant of the child. Reflexive rows
/// make the endpoints themselves part of both sides.
async fn extend_closure(
    tx: &mut Transaction<'_, Postgres>,
    kind: EntityKind,
    parent_id: i64,
    child_id: i64,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {closure} (ancestor_id, descendant_id)
         SELECT a.ancestor_id, d.descendant_id
         FROM {closure} a, {closure} d
         WHERE a.descendant_id = $1 AND d.ancestor_id = $2
         ON CONFLICT DO NOTHING",
        closure = kind.closure_table()
    );
    sqlx::query(&sql)
        .bind(parent_id)
        .bind(child_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Recompute the kind's closure from its edge table.
async fn rebuild_closure(tx: &mut Transaction<'_, Postgres>, kind: EntityKind) -> Result<()> {
    let clear = format!("DELETE FROM {}", kind.closure_table());
    sqlx::query(&clear).execute(&mut **tx).await?;

    let refill = format!(
        "INSERT INTO {closure} (ancestor_id, descendant_id)
         WITH RECURSIVE reach(ancestor_id, descendant_id) AS (
             SELECT id, id FROM {table}
             UNION
             SELECT r.ancestor_id, e.child_id
             FROM reach r
             JOIN {edges} e ON e.parent_id = r.descendant_id
         )
         SELECT ancestor_id, descendant_id FROM reach",
        closure = kind.closure_table(),
        table = kind.table(),
        edges = kind.edge_table()
    );
    sqlx::query(&refill).execute(&mut **tx).await?;
    Ok(())
}

/// Re-attach the node directly under the supremum if nothing else connects
/// it any more. The restored edge is dynamic.
async fn restore_supremum_path(
    tx: &mut Transaction<'_, Postgres>,
    kind: EntityKind,
    child_id: i64,
) -> Result<()> {
    let sup_sql = format!("SELECT id FROM {} WHERE ext_id = $1", kind.table());
    let sup_id: Option<i64> = sqlx::query_scalar(&sup_sql)
        .bind(SUPREMUM)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(sup_id) = sup_id else {
        return Ok(());
    };
    if sup_id == child_id {
        return Ok(());
    }

    let reach_sql = format!(
        "SELECT EXISTS (SELECT 1 FROM {} WHERE ancestor_id = $1 AND descendant_id = $2)",
        kind.closure_table()
    );
    let reachable: bool = sqlx::query_scalar(&reach_sql)
        .bind(sup_id)
        .bind(child_id)
        .fetch_one(&mut **tx)
        .await?;
    if reachable {
        return Ok(());
    }

    debug!(kind = %kind, child_id, "re-attaching stranded node under supremum");
    let edge_sql = format!(
        "INSERT INTO {} (parent_id, child_id, is_static) VALUES ($1, $2, FALSE)
         ON CONFLICT DO NOTHING",
        kind.edge_table()
    );
    sqlx::query(&edge_sql)
        .bind(sup_id)
        .bind(child_id)
        .execute(&mut **tx)
        .await?;
    extend_closure(tx, kind, sup_id, child_id).await
}

#[async_trait]
impl super::AccessRepository for PostgresAccessRepository {
    async fn upsert_entity(
        &self,
        kind: EntityKind,
        ext_id: &str,
        description: &str,
        is_static: bool,
    ) -> Result<Entity> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "INSERT INTO {table} (ext_id, description, is_static) VALUES ($1, $2, $3)
             ON CONFLICT (ext_id) DO UPDATE
                 SET description = EXCLUDED.description, is_static = EXCLUDED.is_static
             RETURNING id, ext_id, description, is_static, created_at",
            table = kind.table()
        );
        let row = sqlx::query(&sql)
            .bind(ext_id)
            .bind(description)
            .bind(is_static)
            .fetch_one(&mut *tx)
            .await?;
        let entity = entity_from_row(&row)?;

        let reflexive = format!(
            "INSERT INTO {} (ancestor_id, descendant_id) VALUES ($1, $1) ON CONFLICT DO NOTHING",
            kind.closure_table()
        );
        sqlx::query(&reflexive).bind(entity.id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(entity)
    }

    async fn find_entity(&self, kind: EntityKind, ext_id: &str) -> Result<Option<Entity>> {
        let sql = format!(
            "SELECT id, ext_id, description, is_static, created_at FROM {} WHERE ext_id = $1",
            kind.table()
        );
        let row = sqlx::query(&sql)
            .bind(ext_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn static_entities(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        let sql = format!(
            "SELECT id, ext_id, description, is_static, created_at FROM {}
             WHERE is_static ORDER BY ext_id",
            kind.table()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn delete_entity(&self, kind: EntityKind, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let children_sql = format!(
            "SELECT child_id FROM {} WHERE parent_id = $1",
            kind.edge_table()
        );
        let children: Vec<i64> = sqlx::query_scalar(&children_sql)
            .bind(id)
            .fetch_all(&mut *tx)
            .await?;

        // Edges, closure rows, and rules referencing the entity go with it
        // through the cascade constraints.
        let delete_sql = format!("DELETE FROM {} WHERE id = $1", kind.table());
        sqlx::query(&delete_sql).bind(id).execute(&mut *tx).await?;

        rebuild_closure(&mut tx, kind).await?;
        for child in children {
            restore_supremum_path(&mut tx, kind, child).await?;
        }
        tx.commit().await?;
        info!(kind = %kind, id, "deleted entity");
        Ok(())
    }

    async fn edge_exists(&self, kind: EntityKind, parent_id: i64, child_id: i64) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE parent_id = $1 AND child_id = $2)",
            kind.edge_table()
        );
        Ok(sqlx::query_scalar(&sql)
            .bind(parent_id)
            .bind(child_id)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn insert_edge(
        &self,
        kind: EntityKind,
        parent_id: i64,
        child_id: i64,
        is_static: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "INSERT INTO {} (parent_id, child_id, is_static) VALUES ($1, $2, $3)
             ON CONFLICT (parent_id, child_id) DO UPDATE SET is_static = EXCLUDED.is_static
             RETURNING (xmax = 0) AS fresh",
            kind.edge_table()
        );
        let fresh: bool = sqlx::query_scalar(&sql)
            .bind(parent_id)
            .bind(child_id)
            .bind(is_static)
            .fetch_one(&mut *tx)
            .await?;
        if fresh {
            extend_closure(&mut tx, kind, parent_id, child_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_edge(&self, kind: EntityKind, parent_id: i64, child_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "DELETE FROM {} WHERE parent_id = $1 AND child_id = $2",
            kind.edge_table()
        );
        let removed = sqlx::query(&sql)
            .bind(parent_id)
            .bind(child_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed > 0 {
            rebuild_closure(&mut tx, kind).await?;
            restore_supremum_path(&mut tx, kind, child_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn parents(&self, kind: EntityKind, id: i64) -> Result<Vec<Entity>> {
        let sql = format!(
            "SELECT e.id, e.ext_id, e.description, e.is_static, e.created_at
             FROM {edges} ed JOIN {table} e ON e.id = ed.parent_id
             WHERE ed.child_id = $1 ORDER BY e.ext_id",
            edges = kind.edge_table(),
            table = kind.table()
        );
        let rows = sqlx::query(&sql).bind(id).fetch_all(&self.pool).await?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn children(&self, kind: EntityKind, id: i64) -> Result<Vec<Entity>> {
        let sql = format!(
            "SELECT e.id, e.ext_id, e.description, e.is_static, e.created_at
             FROM {edges} ed JOIN {table} e ON e.id = ed.child_id
             WHERE ed.parent_id = $1 ORDER BY e.ext_id",
            edges = kind.edge_table(),
            table = kind.table()
        );
        let rows = sqlx::query(&sql).bind(id).fetch_all(&self.pool).await?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn static_parents(&self, kind: EntityKind, child_id: i64) -> Result<Vec<Entity>> {
        let sql = format!(
            "SELECT e.id, e.ext_id, e.description, e.is_static, e.created_at
             FROM {edges} ed JOIN {table} e ON e.id = ed.parent_id
             WHERE ed.child_id = $1 AND ed.is_static ORDER BY e.ext_id",
            edges = kind.edge_table(),
            table = kind.table()
        );
        let rows = sqlx::query(&sql).bind(child_id).fetch_all(&self.pool).await?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn static_children(&self, kind: EntityKind, parent_id: i64) -> Result<Vec<Entity>> {
        let sql = format!(
            "SELECT e.id, e.ext_id, e.description, e.is_static, e.created_at
             FROM {edges} ed JOIN {table} e ON e.id = ed.child_id
             WHERE ed.parent_id = $1 AND ed.is_static ORDER BY e.ext_id",
            edges = kind.edge_table(),
            table = kind.table()
        );
        let rows = sqlx::query(&sql).bind(parent_id).fetch_all(&self.pool).await?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn is_reachable(
        &self,
        kind: EntityKind,
        ancestor_id: i64,
        descendant_id: i64,
    ) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE ancestor_id = $1 AND descendant_id = $2)",
            kind.closure_table()
        );
        Ok(sqlx::query_scalar(&sql)
            .bind(ancestor_id)
            .bind(descendant_id)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn ancestors(&self, kind: EntityKind, id: i64) -> Result<Vec<Entity>> {
        let sql = format!(
            "SELECT e.id, e.ext_id, e.description, e.is_static, e.created_at
             FROM {closure} c JOIN {table} e ON e.id = c.ancestor_id
             WHERE c.descendant_id = $1 ORDER BY e.ext_id",
            closure = kind.closure_table(),
            table = kind.table()
        );
        let rows = sqlx::query(&sql).bind(id).fetch_all(&self.pool).await?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn descendants(&self, kind: EntityKind, id: i64) -> Result<Vec<Entity>> {
        let sql = format!(
            "SELECT e.id, e.ext_id, e.description, e.is_static, e.created_at
             FROM {closure} c JOIN {table} e ON e.id = c.descendant_id
             WHERE c.ancestor_id = $1 ORDER BY e.ext_id",
            closure = kind.closure_table(),
            table = kind.table()
        );
        let rows = sqlx::query(&sql).bind(id).fetch_all(&self.pool).await?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn find_rule(
        &self,
        subject_id: i64,
        object_id: i64,
        privilege_id: i64,
    ) -> Result<Option<Rule>> {
        let row = sqlx::query(
            "SELECT subject_id, object_id, privilege_id, sign, is_static, created_at
             FROM lattice_rules
             WHERE subject_id = $1 AND object_id = $2 AND privilege_id = $3",
        )
        .bind(subject_id)
        .bind(object_id)
        .bind(privilege_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let sign: String = row.try_get("sign")?;
            Ok(Rule {
                subject_id: row.try_get("subject_id")?,
                object_id: row.try_get("object_id")?,
                privilege_id: row.try_get("privilege_id")?,
                sign: sign_from_wire(&sign)?,
                is_static: row.try_get("is_static")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn insert_rule(
        &self,
        subject_id: i64,
        object_id: i64,
        privilege_id: i64,
        sign: RuleSign,
        is_static: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO lattice_rules (subject_id, object_id, privilege_id, sign, is_static)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(subject_id)
        .bind(object_id)
        .bind(privilege_id)
        .bind(sign.as_str())
        .bind(is_static)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_rule(
        &self,
        subject_id: i64,
        object_id: i64,
        privilege_id: i64,
        sign: RuleSign,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM lattice_rules
             WHERE subject_id = $1 AND object_id = $2 AND privilege_id = $3 AND sign = $4",
        )
        .bind(subject_id)
        .bind(object_id)
        .bind(privilege_id)
        .bind(sign.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rules_for(&self, side: RuleSide, id: i64) -> Result<Vec<RuleEntry>> {
        let column = match side {
            RuleSide::Subject => "r.subject_id",
            RuleSide::Object => "r.object_id",
        };
        let sql = format!(
            "SELECT s.ext_id AS subject_ext, o.ext_id AS object_ext,
                    p.ext_id AS privilege_ext, r.sign
             FROM lattice_rules r
             JOIN lattice_subjects s ON s.id = r.subject_id
             JOIN lattice_objects o ON o.id = r.object_id
             JOIN lattice_privileges p ON p.id = r.privilege_id
             WHERE {column} = $1
             ORDER BY s.ext_id, o.ext_id, p.ext_id, r.sign",
            column = column
        );
        let rows = sqlx::query(&sql).bind(id).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let sign: String = row.try_get("sign")?;
                Ok(RuleEntry {
                    subject_ext: row.try_get("subject_ext")?,
                    object_ext: row.try_get("object_ext")?,
                    privilege_ext: row.try_get("privilege_ext")?,
                    sign: sign_from_wire(&sign)?,
                })
            })
            .collect()
    }

    async fn delete_static_rules(&self) -> Result<()> {
        sqlx::query("DELETE FROM lattice_rules WHERE is_static")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn denial_exists(
        &self,
        subject_id: i64,
        object_id: i64,
        privilege_id: i64,
        privilege_supremum_id: i64,
    ) -> Result<bool> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM lattice_rules r
                 JOIN lattice_subject_closure sc
                      ON sc.ancestor_id = r.subject_id AND sc.descendant_id = $1
                 JOIN lattice_object_closure oc
                      ON oc.ancestor_id = r.object_id AND oc.descendant_id = $2
                 WHERE r.sign = '-'
                   AND (r.privilege_id = $4
                        OR EXISTS (SELECT 1 FROM lattice_privilege_closure pc
                                   WHERE pc.ancestor_id = $3
                                     AND pc.descendant_id = r.privilege_id))
             )",
        )
        .bind(subject_id)
        .bind(object_id)
        .bind(privilege_id)
        .bind(privilege_supremum_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn grant_exists(
        &self,
        subject_id: i64,
        object_id: i64,
        privilege_id: i64,
    ) -> Result<bool> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM lattice_rules r
                 JOIN lattice_subject_closure sc
                      ON sc.ancestor_id = r.subject_id AND sc.descendant_id = $1
                 JOIN lattice_object_closure oc
                      ON oc.ancestor_id = r.object_id AND oc.descendant_id = $2
                 JOIN lattice_privilege_closure pc
                      ON pc.ancestor_id = r.privilege_id AND pc.descendant_id = $3
                 WHERE r.sign = '+'
             )",
        )
        .bind(subject_id)
        .bind(object_id)
        .bind(privilege_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn acquire_reconcile_lock(&self) -> Result<()> {
        let mut guard = self.reconcile_guard.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(RECONCILE_LOCK_KEY)
            .execute(&mut *conn)
            .await?;
        *guard = Some(conn);
        debug!("acquired reconcile advisory lock");
        Ok(())
    }

    async fn release_reconcile_lock(&self) -> Result<()> {
        let mut guard = self.reconcile_guard.lock().await;
        if let Some(mut conn) = guard.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(RECONCILE_LOCK_KEY)
                .execute(&mut *conn)
                .await?;
            debug!("released reconcile advisory lock");
        }
        Ok(())
    }
}
