//! # Execution Delay Storage
//!
//! Wake-up markers polled by every executor process. A due marker is handed
//! to exactly one poller at a time: the poll selects with `FOR UPDATE SKIP
//! LOCKED`, so rows already held by a concurrent poller are skipped rather
//! than waited on. The consumer runs inside that transaction and a row is
//! only deleted once its consumer succeeded; a failed row is delivered again
//! by a later poll.

use crate::error::{FlowlineError, FlowlineResult};
use crate::models::{DelayType, ExecutionDelay};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::future::Future;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[async_trait]
pub trait ExecutionDelayStorage: Send + Sync {
    /// Persist a marker; duplicates are tolerated by consumers.
    async fn save(&self, delay: ExecutionDelay) -> FlowlineResult<()>;

    /// Hand every due marker to `consumer`, deleting the ones it accepted.
    ///
    /// A marker whose consumer returns an error is kept for the next poll.
    /// Returns the number of consumed markers.
    async fn get<F, Fut>(&self, consumer: F) -> FlowlineResult<usize>
    where
        F: FnMut(ExecutionDelay) -> Fut + Send,
        Fut: Future<Output = FlowlineResult<()>> + Send;

    /// Drop the pending markers of a terminated execution.
    ///
    /// Markers currently held by a poller are left to it.
    async fn delete_by_execution(&self, execution_id: &str) -> FlowlineResult<u64>;
}

#[derive(Debug, FromRow)]
struct ExecutionDelayRow {
    id: Uuid,
    tenant_id: Option<String>,
    namespace: String,
    flow_id: String,
    execution_id: String,
    task_run_id: Option<Uuid>,
    delay_type: String,
    date: DateTime<Utc>,
}

impl TryFrom<ExecutionDelayRow> for ExecutionDelay {
    type Error = FlowlineError;

    fn try_from(row: ExecutionDelayRow) -> Result<Self, Self::Error> {
        let delay_type: DelayType = row
            .delay_type
            .parse()
            .map_err(FlowlineError::DatabaseError)?;

        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            namespace: row.namespace,
            flow_id: row.flow_id,
            execution_id: row.execution_id,
            task_run_id: row.task_run_id,
            delay_type,
            date: row.date,
        })
    }
}

/// PostgreSQL-backed delay markers.
#[derive(Debug, Clone)]
pub struct PgExecutionDelayStorage {
    pool: PgPool,
}

impl PgExecutionDelayStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionDelayStorage for PgExecutionDelayStorage {
    #[instrument(skip(self, delay), fields(execution_id = %delay.execution_id, delay_type = %delay.delay_type))]
    async fn save(&self, delay: ExecutionDelay) -> FlowlineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_delay
                (id, tenant_id, namespace, flow_id, execution_id, task_run_id, delay_type, date)
            VALUES ($1, COALESCE($2, ''), $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(delay.id)
        .bind(delay.tenant_id.as_deref())
        .bind(&delay.namespace)
        .bind(&delay.flow_id)
        .bind(&delay.execution_id)
        .bind(delay.task_run_id)
        .bind(delay.delay_type.to_string())
        .bind(delay.date)
        .execute(&self.pool)
        .await?;

        debug!(date = %delay.date, "Saved execution delay");
        Ok(())
    }

    #[instrument(skip(self, consumer))]
    async fn get<F, Fut>(&self, mut consumer: F) -> FlowlineResult<usize>
    where
        F: FnMut(ExecutionDelay) -> Fut + Send,
        Fut: Future<Output = FlowlineResult<()>> + Send,
    {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, ExecutionDelayRow>(
            r#"
            SELECT id, NULLIF(tenant_id, '') AS tenant_id, namespace, flow_id, execution_id,
                   task_run_id, delay_type, date
            FROM execution_delay
            WHERE date <= now()
            ORDER BY date
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut delivered = 0;
        for row in rows {
            let delay = ExecutionDelay::try_from(row)?;
            let id = delay.id;
            if let Err(e) = consumer(delay).await {
                warn!(delay_id = %id, error = %e, "Execution delay not consumed, keeping it");
                continue;
            }

            sqlx::query("DELETE FROM execution_delay WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            delivered += 1;
        }

        tx.commit().await?;
        if delivered > 0 {
            debug!(delivered, "Delivered due execution delays");
        }
        Ok(delivered)
    }

    #[instrument(skip(self))]
    async fn delete_by_execution(&self, execution_id: &str) -> FlowlineResult<u64> {
        // Rows locked by a poller are skipped: its consumer sees the
        // terminated execution and deletes them itself.
        let result = sqlx::query(
            r#"
            DELETE FROM execution_delay
            WHERE id IN (
                SELECT id FROM execution_delay
                WHERE execution_id = $1
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
