//! # Concurrency Limit Storage
//!
//! Per-flow running-execution counters shared by every executor process.
//!
//! Every admission decision is a read-modify-write under an exclusive row
//! lock (`SELECT ... FOR UPDATE`). The first admission of a flow races to
//! create the row: the store inserts with `ON CONFLICT DO NOTHING` and
//! re-reads under the lock, so concurrent first callers all end up locking the
//! same row.
//!
//! Queued executions live in `execution_queued` and are written through the
//! same transaction as the counter they were refused by.

use crate::error::{FlowlineError, FlowlineResult};
use crate::models::{ConcurrencyLimit, Execution, ExecutionQueued, FlowIdentity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::{debug, error, instrument, warn};

/// Writes scoped to the transaction of one
/// [`count_then_process`](ConcurrencyLimitStorage::count_then_process) call.
#[derive(Debug, Default)]
pub struct LimitTransaction {
    queued: Vec<ExecutionQueued>,
}

impl LimitTransaction {
    /// Enqueue an execution; committed together with the counter.
    pub fn queue(&mut self, queued: ExecutionQueued) {
        self.queued.push(queued);
    }

    pub fn queued(&self) -> &[ExecutionQueued] {
        &self.queued
    }

    pub(crate) fn into_queued(self) -> Vec<ExecutionQueued> {
        self.queued
    }
}

#[async_trait]
pub trait ConcurrencyLimitStorage: Send + Sync {
    /// Lock (creating it if needed) the counter of `flow`, hand it to `process`
    /// and persist the counter it returns, all in one transaction.
    ///
    /// `process` must not touch the store outside of the given handle.
    async fn count_then_process<F, T>(&self, flow: &FlowIdentity, process: F) -> FlowlineResult<T>
    where
        F: FnOnce(&mut LimitTransaction, ConcurrencyLimit) -> FlowlineResult<(T, ConcurrencyLimit)>
            + Send,
        T: Send;

    /// Release the slot of a terminated execution, floored at zero.
    async fn decrement(&self, flow: &FlowIdentity) -> FlowlineResult<i32>;

    /// Pop the oldest queued execution of `flow` and take a slot for it.
    async fn pop_queued(&self, flow: &FlowIdentity) -> FlowlineResult<Option<ExecutionQueued>>;

    /// [`decrement`](Self::decrement) then [`pop_queued`](Self::pop_queued) atomically.
    async fn release(&self, flow: &FlowIdentity) -> FlowlineResult<Option<ExecutionQueued>>;

    /// Drop a queued execution without touching the counter.
    async fn remove_queued(&self, execution_id: &str) -> FlowlineResult<bool>;

    async fn find(&self, tenant_id: Option<&str>) -> FlowlineResult<Vec<ConcurrencyLimit>>;

    async fn find_by_id(
        &self,
        tenant_id: Option<&str>,
        namespace: &str,
        flow_id: &str,
    ) -> FlowlineResult<Option<ConcurrencyLimit>>;

    /// Operator override of a counter; bypasses every admission invariant.
    async fn update(&self, limit: ConcurrencyLimit) -> FlowlineResult<ConcurrencyLimit>;
}

/// Rejects a counter that `process` drove below zero.
pub(crate) fn check_counter(flow: &FlowIdentity, limit: &ConcurrencyLimit) -> FlowlineResult<()> {
    if limit.running < 0 {
        error!(
            flow = %flow,
            running = limit.running,
            "Concurrency counter would become negative"
        );
        return Err(FlowlineError::ConsistencyViolation(format!(
            "concurrency counter of {flow} would become {}",
            limit.running
        )));
    }
    Ok(())
}

const SELECT_LIMIT: &str = r#"
    SELECT NULLIF(tenant_id, '') AS tenant_id, namespace, flow_id, running
    FROM concurrency_limit
"#;

#[derive(Debug, FromRow)]
struct ExecutionQueuedRow {
    tenant_id: Option<String>,
    namespace: String,
    flow_id: String,
    date: DateTime<Utc>,
    execution: Json<Execution>,
}

impl From<ExecutionQueuedRow> for ExecutionQueued {
    fn from(row: ExecutionQueuedRow) -> Self {
        Self {
            tenant_id: row.tenant_id,
            namespace: row.namespace,
            flow_id: row.flow_id,
            date: row.date,
            execution: row.execution.0,
        }
    }
}

/// PostgreSQL-backed counters and queue.
#[derive(Debug, Clone)]
pub struct PgConcurrencyLimitStorage {
    pool: PgPool,
}

impl PgConcurrencyLimitStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock(
        conn: &mut PgConnection,
        flow: &FlowIdentity,
    ) -> FlowlineResult<Option<ConcurrencyLimit>> {
        let query = format!(
            "{SELECT_LIMIT} WHERE tenant_id = $1 AND namespace = $2 AND flow_id = $3 FOR UPDATE"
        );
        let limit = sqlx::query_as::<_, ConcurrencyLimit>(&query)
            .bind(flow.tenant_key())
            .bind(&flow.namespace)
            .bind(&flow.flow_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(limit)
    }

    /// Lock the counter row, creating it first if the flow was never seen.
    async fn lock_or_create(
        conn: &mut PgConnection,
        flow: &FlowIdentity,
    ) -> FlowlineResult<ConcurrencyLimit> {
        if let Some(limit) = Self::lock(conn, flow).await? {
            return Ok(limit);
        }

        sqlx::query(
            r#"
            INSERT INTO concurrency_limit (tenant_id, namespace, flow_id, running)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (tenant_id, namespace, flow_id) DO NOTHING
            "#,
        )
        .bind(flow.tenant_key())
        .bind(&flow.namespace)
        .bind(&flow.flow_id)
        .execute(&mut *conn)
        .await?;

        debug!(flow = %flow, "Materialized concurrency counter");

        Self::lock(conn, flow).await?.ok_or_else(|| {
            FlowlineError::ConsistencyViolation(format!(
                "concurrency counter of {flow} missing right after its creation"
            ))
        })
    }

    async fn write_running(
        conn: &mut PgConnection,
        flow: &FlowIdentity,
        running: i32,
    ) -> FlowlineResult<()> {
        sqlx::query(
            r#"
            UPDATE concurrency_limit SET running = $4
            WHERE tenant_id = $1 AND namespace = $2 AND flow_id = $3
            "#,
        )
        .bind(flow.tenant_key())
        .bind(&flow.namespace)
        .bind(&flow.flow_id)
        .bind(running)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn insert_queued(conn: &mut PgConnection, queued: &ExecutionQueued) -> FlowlineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_queued (tenant_id, namespace, flow_id, execution_id, execution, date)
            VALUES (COALESCE($1, ''), $2, $3, $4, $5, $6)
            ON CONFLICT (execution_id) DO NOTHING
            "#,
        )
        .bind(queued.tenant_id.as_deref())
        .bind(&queued.namespace)
        .bind(&queued.flow_id)
        .bind(&queued.execution.id)
        .bind(Json(&queued.execution))
        .bind(queued.date)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn take_oldest_queued(
        conn: &mut PgConnection,
        flow: &FlowIdentity,
    ) -> FlowlineResult<Option<ExecutionQueued>> {
        let row = sqlx::query_as::<_, ExecutionQueuedRow>(
            r#"
            DELETE FROM execution_queued
            WHERE id = (
                SELECT id FROM execution_queued
                WHERE tenant_id = $1 AND namespace = $2 AND flow_id = $3
                ORDER BY date, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING NULLIF(tenant_id, '') AS tenant_id, namespace, flow_id, date, execution
            "#,
        )
        .bind(flow.tenant_key())
        .bind(&flow.namespace)
        .bind(&flow.flow_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(ExecutionQueued::from))
    }
}

/// Take a slot for a popped execution. No-op when the flow has no counter row.
pub async fn increment(conn: &mut PgConnection, flow: &FlowIdentity) -> FlowlineResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE concurrency_limit SET running = running + 1
        WHERE tenant_id = $1 AND namespace = $2 AND flow_id = $3
        "#,
    )
    .bind(flow.tenant_key())
    .bind(&flow.namespace)
    .bind(&flow.flow_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        warn!(flow = %flow, "Increment on a flow without concurrency counter");
    }
    Ok(())
}

#[async_trait]
impl ConcurrencyLimitStorage for PgConcurrencyLimitStorage {
    #[instrument(skip(self, flow, process), fields(flow = %flow))]
    async fn count_then_process<F, T>(&self, flow: &FlowIdentity, process: F) -> FlowlineResult<T>
    where
        F: FnOnce(&mut LimitTransaction, ConcurrencyLimit) -> FlowlineResult<(T, ConcurrencyLimit)>
            + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_or_create(&mut tx, flow).await?;

        let mut scope = LimitTransaction::default();
        let (result, updated) = process(&mut scope, current)?;
        check_counter(flow, &updated)?;

        Self::write_running(&mut tx, flow, updated.running).await?;
        for queued in scope.into_queued() {
            Self::insert_queued(&mut tx, &queued).await?;
        }

        tx.commit().await?;
        Ok(result)
    }

    #[instrument(skip(self, flow), fields(flow = %flow))]
    async fn decrement(&self, flow: &FlowIdentity) -> FlowlineResult<i32> {
        let mut tx = self.pool.begin().await?;
        let Some(current) = Self::lock(&mut tx, flow).await? else {
            warn!("Decrement on a flow without concurrency counter");
            return Ok(0);
        };

        if current.running == 0 {
            warn!("Decrement on a zero concurrency counter, keeping it at zero");
        }
        let running = (current.running - 1).max(0);
        Self::write_running(&mut tx, flow, running).await?;
        tx.commit().await?;
        Ok(running)
    }

    #[instrument(skip(self, flow), fields(flow = %flow))]
    async fn pop_queued(&self, flow: &FlowIdentity) -> FlowlineResult<Option<ExecutionQueued>> {
        let mut tx = self.pool.begin().await?;
        if Self::lock(&mut tx, flow).await?.is_none() {
            return Ok(None);
        }

        let popped = Self::take_oldest_queued(&mut tx, flow).await?;
        if popped.is_some() {
            increment(&mut tx, flow).await?;
        }
        tx.commit().await?;
        Ok(popped)
    }

    #[instrument(skip(self, flow), fields(flow = %flow))]
    async fn release(&self, flow: &FlowIdentity) -> FlowlineResult<Option<ExecutionQueued>> {
        let mut tx = self.pool.begin().await?;
        let Some(current) = Self::lock(&mut tx, flow).await? else {
            warn!("Release on a flow without concurrency counter");
            return Ok(None);
        };

        if current.running == 0 {
            warn!("Release on a zero concurrency counter, keeping it at zero");
        }
        let mut running = (current.running - 1).max(0);
        let popped = Self::take_oldest_queued(&mut tx, flow).await?;
        if popped.is_some() {
            running += 1;
        }

        Self::write_running(&mut tx, flow, running).await?;
        tx.commit().await?;
        Ok(popped)
    }

    async fn remove_queued(&self, execution_id: &str) -> FlowlineResult<bool> {
        let result = sqlx::query("DELETE FROM execution_queued WHERE execution_id = $1")
            .bind(execution_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, tenant_id: Option<&str>) -> FlowlineResult<Vec<ConcurrencyLimit>> {
        let query = format!("{SELECT_LIMIT} WHERE tenant_id = $1 ORDER BY namespace, flow_id");
        let limits = sqlx::query_as::<_, ConcurrencyLimit>(&query)
            .bind(tenant_id.unwrap_or(""))
            .fetch_all(&self.pool)
            .await?;
        Ok(limits)
    }

    async fn find_by_id(
        &self,
        tenant_id: Option<&str>,
        namespace: &str,
        flow_id: &str,
    ) -> FlowlineResult<Option<ConcurrencyLimit>> {
        let query =
            format!("{SELECT_LIMIT} WHERE tenant_id = $1 AND namespace = $2 AND flow_id = $3");
        let limit = sqlx::query_as::<_, ConcurrencyLimit>(&query)
            .bind(tenant_id.unwrap_or(""))
            .bind(namespace)
            .bind(flow_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(limit)
    }

    #[instrument(skip(self, limit), fields(namespace = %limit.namespace, flow_id = %limit.flow_id))]
    async fn update(&self, limit: ConcurrencyLimit) -> FlowlineResult<ConcurrencyLimit> {
        warn!(running = limit.running, "Overriding concurrency counter");
        let updated = sqlx::query_as::<_, ConcurrencyLimit>(
            r#"
            INSERT INTO concurrency_limit (tenant_id, namespace, flow_id, running)
            VALUES (COALESCE($1, ''), $2, $3, $4)
            ON CONFLICT (tenant_id, namespace, flow_id) DO UPDATE SET running = EXCLUDED.running
            RETURNING NULLIF(tenant_id, '') AS tenant_id, namespace, flow_id, running
            "#,
        )
        .bind(limit.tenant_id.as_deref())
        .bind(&limit.namespace)
        .bind(&limit.flow_id)
        .bind(limit.running)
        .fetch_one(&self.pool)
        .await?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_counter_is_a_consistency_violation() {
        let flow = FlowIdentity::new(None, "company.team", "limited");
        let limit = ConcurrencyLimit::empty(&flow).with_running(-1);

        assert!(matches!(
            check_counter(&flow, &limit),
            Err(FlowlineError::ConsistencyViolation(_))
        ));
        assert!(check_counter(&flow, &limit.with_running(0)).is_ok());
    }

    #[test]
    fn test_limit_transaction_buffers_queued_executions() {
        let flow = crate::models::Flow::new("company.team", "limited", vec![crate::models::Task::runnable("a")]);
        let mut scope = LimitTransaction::default();
        scope.queue(ExecutionQueued::of(Execution::new_for(&flow)));

        assert_eq!(scope.queued().len(), 1);
        assert_eq!(scope.into_queued()[0].flow_id, "limited");
    }
}
