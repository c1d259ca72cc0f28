use anyhow::{Context, Result};
use sqlx::PgPool;

pub async fn count_by_environment(pool: &PgPool, environment_id: i64) -> Result<i64> {
    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM templates WHERE environment_id = $1")
            .bind(environment_id)
            .fetch_one(pool)
            .await
            .context("Failed to count templates by environment")?;

    Ok(count.0)
}
