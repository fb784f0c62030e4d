use crate::error::FlowlineResult;
use sqlx::migrate::Migrator;
use sqlx::PgPool;
use tracing::info;

/// Embedded schema of the shared stores.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn run_migrations(pool: &PgPool) -> FlowlineResult<()> {
    MIGRATOR.run(pool).await?;
    info!(migrations = MIGRATOR.iter().count(), "Database migrations applied");
    Ok(())
}
