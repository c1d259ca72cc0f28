use anyhow::{Context, Result};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::db::models::{AccessType, Instance};

/// Find an instance by its opaque id
pub async fn find_by_id(pool: &PgPool, instance_id: &str) -> Result<Option<Instance>> {
    let instance = sqlx::query_as::<_, Instance>(
        r#"
        SELECT * FROM instances WHERE instance_id = $1
        "#,
    )
    .bind(instance_id)
    .fetch_optional(pool)
    .await
    .context("Failed to find instance by id")?;

    Ok(instance)
}

/// Find an instance by its unique display name
pub async fn find_by_name(pool: &PgPool, name: &str) -> Result<Option<Instance>> {
    let instance = sqlx::query_as::<_, Instance>(
        r#"
        SELECT * FROM instances WHERE name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("Failed to find instance by name")?;

    Ok(instance)
}

/// List all instances, newest first
pub async fn list(pool: &PgPool) -> Result<Vec<Instance>> {
    let instances = sqlx::query_as::<_, Instance>(
        r#"
        SELECT * FROM instances ORDER BY created_at DESC
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Failed to list instances")?;

    Ok(instances)
}

pub async fn list_by_environment(pool: &PgPool, environment_id: i64) -> Result<Vec<Instance>> {
    let instances = sqlx::query_as::<_, Instance>(
        r#"
        SELECT * FROM instances WHERE environment_id = $1 ORDER BY created_at DESC
        "#,
    )
    .bind(environment_id)
    .fetch_all(pool)
    .await
    .context("Failed to list instances by environment")?;

    Ok(instances)
}

pub async fn list_by_access_type(pool: &PgPool, access_type: AccessType) -> Result<Vec<Instance>> {
    let instances = sqlx::query_as::<_, Instance>(
        r#"
        SELECT * FROM instances WHERE access_type = $1 ORDER BY created_at DESC
        "#,
    )
    .bind(access_type)
    .fetch_all(pool)
    .await
    .context("Failed to list instances by access type")?;

    Ok(instances)
}

pub async fn count_by_environment(pool: &PgPool, environment_id: i64) -> Result<i64> {
    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM instances WHERE environment_id = $1")
            .bind(environment_id)
            .fetch_one(pool)
            .await
            .context("Failed to count instances by environment")?;

    Ok(count.0)
}

/// Insert a new instance row
pub async fn insert(pool: &PgPool, instance: &Instance) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO instances (
            instance_id, name, access_type, mcp_protocol, status,
            environment_id, image_address, port, init_script, command,
            package_id, env_vars, volume_mounts,
            startup_timeout_ms, running_timeout_ms,
            container_create_options, container_name, container_service_name,
            container_status, container_is_ready, container_last_message,
            source_config, target_config, public_proxy_config, service_path
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
            $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
            $21, $22, $23, $24, $25
        )
        "#,
    )
    .bind(&instance.instance_id)
    .bind(&instance.name)
    .bind(instance.access_type)
    .bind(instance.mcp_protocol)
    .bind(instance.status)
    .bind(instance.environment_id)
    .bind(&instance.image_address)
    .bind(instance.port)
    .bind(&instance.init_script)
    .bind(&instance.command)
    .bind(&instance.package_id)
    .bind(Json(&instance.env_vars))
    .bind(Json(&instance.volume_mounts))
    .bind(instance.startup_timeout_ms)
    .bind(instance.running_timeout_ms)
    .bind(Json(&instance.container_create_options))
    .bind(&instance.container_name)
    .bind(&instance.container_service_name)
    .bind(instance.container_status)
    .bind(instance.container_is_ready)
    .bind(&instance.container_last_message)
    .bind(Json(&instance.source_config))
    .bind(Json(&instance.target_config))
    .bind(Json(&instance.public_proxy_config))
    .bind(&instance.service_path)
    .execute(pool)
    .await
    .context("Failed to insert instance")?;

    Ok(())
}

/// Replace the full instance row. Concurrent writers race on a
/// last-writer-wins basis; there is no version column.
pub async fn update(pool: &PgPool, instance: &Instance) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE instances SET
            name = $2,
            access_type = $3,
            mcp_protocol = $4,
            status = $5,
            environment_id = $6,
            image_address = $7,
            port = $8,
            init_script = $9,
            command = $10,
            package_id = $11,
            env_vars = $12,
            volume_mounts = $13,
            startup_timeout_ms = $14,
            running_timeout_ms = $15,
            container_create_options = $16,
            container_name = $17,
            container_service_name = $18,
            container_status = $19,
            container_is_ready = $20,
            container_last_message = $21,
            source_config = $22,
            target_config = $23,
            public_proxy_config = $24,
            service_path = $25,
            updated_at = now()
        WHERE instance_id = $1
        "#,
    )
    .bind(&instance.instance_id)
    .bind(&instance.name)
    .bind(instance.access_type)
    .bind(instance.mcp_protocol)
    .bind(instance.status)
    .bind(instance.environment_id)
    .bind(&instance.image_address)
    .bind(instance.port)
    .bind(&instance.init_script)
    .bind(&instance.command)
    .bind(&instance.package_id)
    .bind(Json(&instance.env_vars))
    .bind(Json(&instance.volume_mounts))
    .bind(instance.startup_timeout_ms)
    .bind(instance.running_timeout_ms)
    .bind(Json(&instance.container_create_options))
    .bind(&instance.container_name)
    .bind(&instance.container_service_name)
    .bind(instance.container_status)
    .bind(instance.container_is_ready)
    .bind(&instance.container_last_message)
    .bind(Json(&instance.source_config))
    .bind(Json(&instance.target_config))
    .bind(Json(&instance.public_proxy_config))
    .bind(&instance.service_path)
    .execute(pool)
    .await
    .context("Failed to update instance")?;

    Ok(())
}

pub async fn delete(pool: &PgPool, instance_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM instances WHERE instance_id = $1")
        .bind(instance_id)
        .execute(pool)
        .await
        .context("Failed to delete instance")?;

    Ok(())
}
