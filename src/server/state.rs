use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

use crate::db::{
    CodePackageStore, EnvironmentStore, InstanceStore, PgStore, TemplateStore,
};
use crate::server::gateway::GatewayState;
use crate::server::instance::compiler::MarketEndpoint;
use crate::server::instance::monitor::ContainerMonitor;
use crate::server::instance::orchestrator::Orchestrator;
use crate::server::runtime::DefaultRuntimeFactory;
use crate::server::settings::Settings;

/// Everything the server process shares: the pool, the store interfaces,
/// the orchestrator and reconciler, and the gateway's dependencies.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub instances: Arc<dyn InstanceStore>,
    pub environments: Arc<dyn EnvironmentStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub monitor: Arc<ContainerMonitor>,
    pub gateway: Arc<GatewayState>,
}

impl AppState {
    async fn run_migrations(pool: &PgPool) -> Result<()> {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .context("Failed to run migrations")?;
        tracing::info!("Migrations completed successfully");
        Ok(())
    }

    pub async fn new(settings: &Settings) -> Result<Self> {
        // kube and reqwest both ride on rustls.
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();

        let db_pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&settings.database.url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        tracing::info!("Successfully connected to PostgreSQL");

        Self::run_migrations(&db_pool).await?;

        let store = Arc::new(PgStore::new(db_pool.clone()));
        let instances: Arc<dyn InstanceStore> = store.clone();
        let environments: Arc<dyn EnvironmentStore> = store.clone();
        let templates: Arc<dyn TemplateStore> = store.clone();
        let code_packages: Arc<dyn CodePackageStore> = store.clone();

        let runtime_factory = Arc::new(DefaultRuntimeFactory::new(
            settings.hosting.docker_network.clone(),
        ));

        let http_client = reqwest::Client::new();

        let market = MarketEndpoint {
            host: settings.market.host.clone(),
            port: settings.market.port,
            prefix: settings.market.prefix.clone(),
        };

        let orchestrator = Arc::new(Orchestrator::new(
            instances.clone(),
            environments.clone(),
            templates,
            code_packages,
            runtime_factory.clone(),
            http_client.clone(),
            market,
            settings.gateway.domain.clone(),
            settings.gateway.prefix.clone(),
        ));

        let monitor = Arc::new(ContainerMonitor::new(
            instances.clone(),
            environments.clone(),
            runtime_factory,
            settings.monitor.max_concurrency,
        ));

        let gateway = Arc::new(GatewayState {
            instances: instances.clone(),
            http_client,
            prefix: settings.gateway.prefix.clone(),
            default_hosting_image: settings.hosting.default_image.clone(),
        });

        Ok(Self {
            db_pool,
            instances,
            environments,
            orchestrator,
            monitor,
            gateway,
        })
    }
}
