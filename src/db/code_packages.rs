use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::db::models::CodePackage;

pub async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<CodePackage>> {
    let package =
        sqlx::query_as::<_, CodePackage>("SELECT * FROM code_packages WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("Failed to find code package by id")?;

    Ok(package)
}
