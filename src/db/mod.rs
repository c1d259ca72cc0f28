pub mod code_packages;
pub mod environments;
pub mod instances;
pub mod models;
pub mod templates;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::models::{AccessType, CodePackage, Environment, Instance};

/// Lookup and mutation surface for instance rows.
///
/// Updates replace the whole row (last-writer-wins); callers read, modify
/// and write back the full record.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get(&self, instance_id: &str) -> Result<Option<Instance>>;
    async fn find_by_name(&self, name: &str) -> Result<Option<Instance>>;
    async fn list(&self) -> Result<Vec<Instance>>;
    async fn list_by_environment(&self, environment_id: i64) -> Result<Vec<Instance>>;
    async fn list_by_access_type(&self, access_type: AccessType) -> Result<Vec<Instance>>;
    async fn list_hosting(&self) -> Result<Vec<Instance>>;
    async fn count_by_environment(&self, environment_id: i64) -> Result<i64>;
    async fn insert(&self, instance: &Instance) -> Result<()>;
    async fn update(&self, instance: &Instance) -> Result<()>;
    async fn delete(&self, instance_id: &str) -> Result<()>;
}

#[async_trait]
pub trait EnvironmentStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<Environment>>;
    async fn list(&self) -> Result<Vec<Environment>>;
    async fn insert(&self, environment: &Environment) -> Result<i64>;
    async fn delete(&self, id: i64) -> Result<()>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn count_by_environment(&self, environment_id: i64) -> Result<i64>;
}

#[async_trait]
pub trait CodePackageStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<CodePackage>>;
}

/// Postgres-backed implementation of all store interfaces.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn get(&self, instance_id: &str) -> Result<Option<Instance>> {
        instances::find_by_id(&self.pool, instance_id).await
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Instance>> {
        instances::find_by_name(&self.pool, name).await
    }

    async fn list(&self) -> Result<Vec<Instance>> {
        instances::list(&self.pool).await
    }

    async fn list_by_environment(&self, environment_id: i64) -> Result<Vec<Instance>> {
        instances::list_by_environment(&self.pool, environment_id).await
    }

    async fn list_by_access_type(&self, access_type: AccessType) -> Result<Vec<Instance>> {
        instances::list_by_access_type(&self.pool, access_type).await
    }

    async fn list_hosting(&self) -> Result<Vec<Instance>> {
        instances::list_by_access_type(&self.pool, AccessType::Hosting).await
    }

    async fn count_by_environment(&self, environment_id: i64) -> Result<i64> {
        instances::count_by_environment(&self.pool, environment_id).await
    }

    async fn insert(&self, instance: &Instance) -> Result<()> {
        instances::insert(&self.pool, instance).await
    }

    async fn update(&self, instance: &Instance) -> Result<()> {
        instances::update(&self.pool, instance).await
    }

    async fn delete(&self, instance_id: &str) -> Result<()> {
        instances::delete(&self.pool, instance_id).await
    }
}

#[async_trait]
impl EnvironmentStore for PgStore {
    async fn get(&self, id: i64) -> Result<Option<Environment>> {
        environments::find_by_id(&self.pool, id).await
    }

    async fn list(&self) -> Result<Vec<Environment>> {
        environments::list(&self.pool).await
    }

    async fn insert(&self, environment: &Environment) -> Result<i64> {
        environments::insert(&self.pool, environment).await
    }

    async fn delete(&self, id: i64) -> Result<()> {
        environments::delete(&self.pool, id).await
    }
}

#[async_trait]
impl TemplateStore for PgStore {
    async fn count_by_environment(&self, environment_id: i64) -> Result<i64> {
        templates::count_by_environment(&self.pool, environment_id).await
    }
}

#[async_trait]
impl CodePackageStore for PgStore {
    async fn get(&self, id: &str) -> Result<Option<CodePackage>> {
        code_packages::find_by_id(&self.pool, id).await
    }
}
