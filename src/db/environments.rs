use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::db::models::Environment;

pub async fn find_by_id(pool: &PgPool, id: i64) -> Result<Option<Environment>> {
    let environment =
        sqlx::query_as::<_, Environment>("SELECT * FROM environments WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("Failed to find environment by id")?;

    Ok(environment)
}

pub async fn list(pool: &PgPool) -> Result<Vec<Environment>> {
    let environments =
        sqlx::query_as::<_, Environment>("SELECT * FROM environments ORDER BY id")
            .fetch_all(pool)
            .await
            .context("Failed to list environments")?;

    Ok(environments)
}

pub async fn insert(pool: &PgPool, environment: &Environment) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO environments (name, env_type, namespace, config)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(&environment.name)
    .bind(environment.env_type)
    .bind(&environment.namespace)
    .bind(&environment.config)
    .fetch_one(pool)
    .await
    .context("Failed to insert environment")?;

    Ok(row.0)
}

pub async fn delete(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM environments WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to delete environment")?;

    Ok(())
}
