use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::db::models::{ContainerStatus, Instance};
use crate::db::{EnvironmentStore, InstanceStore};
use crate::server::instance::state_machine::{self, CheckInput, Evaluation};
use crate::server::runtime::{InstanceRuntime, Readiness, RuntimeFactory};

/// Upper bound on concurrently checked instances within one sweep.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No container provisioned yet, nothing to supervise.
    Skipped,
    /// Workload was missing and has been recreated from the descriptor.
    Recreated,
    /// A timeout fired; workload cleaned up and a stop state persisted.
    Stopped(ContainerStatus),
    Transitioned(ContainerStatus),
    Unchanged,
}

#[derive(Debug, Default)]
pub struct SweepSummary {
    pub checked: usize,
    pub failed: usize,
}

/// Periodic supervisor for hosted instances. One sweep loads every hosting
/// instance and walks each through the container state machine; individual
/// failures are logged and counted but never abort the sweep.
#[derive(Clone)]
pub struct ContainerMonitor {
    instances: Arc<dyn InstanceStore>,
    environments: Arc<dyn EnvironmentStore>,
    runtime_factory: Arc<dyn RuntimeFactory>,
    max_concurrency: usize,
}

impl ContainerMonitor {
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        environments: Arc<dyn EnvironmentStore>,
        runtime_factory: Arc<dyn RuntimeFactory>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            instances,
            environments,
            runtime_factory,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Check every hosted instance, at most `max_concurrency` in flight.
    pub async fn run_sweep(&self) -> Result<SweepSummary> {
        let instances = self.instances.list_hosting().await?;
        if instances.is_empty() {
            return Ok(SweepSummary::default());
        }
        debug!(count = instances.len(), "reconcile sweep started");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set = JoinSet::new();
        for instance in instances {
            let monitor = self.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("sweep semaphore closed");
                let instance_id = instance.instance_id.clone();
                let outcome = monitor.check_instance(instance).await;
                (instance_id, outcome)
            });
        }

        let mut summary = SweepSummary::default();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((instance_id, Ok(outcome))) => {
                    summary.checked += 1;
                    debug!(instance_id, ?outcome, "instance checked");
                }
                Ok((instance_id, Err(err))) => {
                    summary.failed += 1;
                    warn!(instance_id, error = %err, "instance check failed");
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(error = %err, "instance check panicked");
                }
            }
        }

        if summary.failed > 0 {
            info!(
                checked = summary.checked,
                failed = summary.failed,
                "reconcile sweep finished with failures"
            );
        }
        Ok(summary)
    }

    /// Evaluate one instance: heal a missing workload, enforce the startup
    /// and running deadlines, track readiness transitions.
    pub async fn check_instance(&self, mut instance: Instance) -> Result<CheckOutcome> {
        if instance.container_name.is_empty() {
            return Ok(CheckOutcome::Skipped);
        }

        let environment = self
            .environments
            .get(instance.environment_id)
            .await?
            .with_context(|| format!("environment {} not found", instance.environment_id))?;
        let runtime = self.runtime_factory.for_environment(&environment).await?;

        let info = match runtime.container_info(&instance.container_name).await {
            Ok(info) => info,
            Err(err) => {
                debug!(
                    instance_id = instance.instance_id,
                    error = %err,
                    "workload missing, recreating"
                );
                return self.recreate(&mut instance, runtime.as_ref()).await;
            }
        };

        let readiness = match runtime.container_readiness(&instance.container_name).await {
            Ok(readiness) => readiness,
            Err(err) => Readiness {
                ready: false,
                message: err.to_string(),
            },
        };

        let input = CheckInput {
            current: instance.container_status,
            phase: info.phase,
            is_ready: readiness.ready,
            created_at_ms: info.created_at.timestamp_millis(),
            now_ms: Utc::now().timestamp_millis(),
            startup_timeout_ms: instance.startup_timeout_ms,
            running_timeout_ms: instance.running_timeout_ms,
        };

        match state_machine::evaluate(&input) {
            Evaluation::Stop(status) => {
                self.cleanup_workload(&instance, runtime.as_ref()).await;
                let message = match status {
                    ContainerStatus::InitTimeoutStop => format!(
                        "Startup timeout of {}ms exceeded",
                        instance.startup_timeout_ms
                    ),
                    _ => format!(
                        "Running timeout of {}ms exceeded",
                        instance.running_timeout_ms
                    ),
                };
                warn!(
                    instance_id = instance.instance_id,
                    status = %status,
                    "workload stopped by deadline"
                );
                self.persist(&mut instance, status, message).await?;
                Ok(CheckOutcome::Stopped(status))
            }
            Evaluation::Transition(status) => {
                let ready = state_machine::ready_for(status);
                let message = if ready {
                    String::new()
                } else {
                    readiness.message
                };
                if instance.container_status == status
                    && instance.container_is_ready == ready
                    && instance.container_last_message == message
                {
                    return Ok(CheckOutcome::Unchanged);
                }
                self.persist(&mut instance, status, message).await?;
                Ok(CheckOutcome::Transitioned(status))
            }
        }
    }

    /// Drift remediation: the persisted descriptor is the source of truth,
    /// so a missing workload is recreated together with its service.
    async fn recreate(
        &self,
        instance: &mut Instance,
        runtime: &dyn InstanceRuntime,
    ) -> Result<CheckOutcome> {
        let spec = instance
            .container_create_options
            .clone()
            .with_context(|| {
                format!(
                    "instance {} has no persisted descriptor to recreate from",
                    instance.instance_id
                )
            })?;

        self.cleanup_workload(instance, runtime).await;

        runtime
            .create_container(&spec)
            .await
            .context("Failed to recreate container")?;
        runtime
            .create_service(&spec)
            .await
            .context("Failed to recreate service")?;

        info!(
            instance_id = instance.instance_id,
            container = spec.name,
            "missing workload recreated"
        );
        self.persist(
            instance,
            ContainerStatus::Pending,
            "Container does not exist, recreating".to_string(),
        )
        .await?;
        Ok(CheckOutcome::Recreated)
    }

    async fn cleanup_workload(&self, instance: &Instance, runtime: &dyn InstanceRuntime) {
        if let Err(err) = runtime.delete_container(&instance.container_name).await {
            warn!(
                instance_id = instance.instance_id,
                error = %err,
                "container cleanup failed"
            );
        }
        if !instance.container_service_name.is_empty() {
            if let Err(err) = runtime
                .delete_service(&instance.container_service_name)
                .await
            {
                warn!(
                    instance_id = instance.instance_id,
                    error = %err,
                    "service cleanup failed"
                );
            }
        }
    }

    async fn persist(
        &self,
        instance: &mut Instance,
        status: ContainerStatus,
        message: String,
    ) -> Result<()> {
        instance.container_status = status;
        instance.container_is_ready = state_machine::ready_for(status);
        instance.container_last_message = message;
        self.instances.update(instance).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ContainerStatus;
    use crate::server::runtime::ContainerPhase;
    use crate::testutil::{
        hosting_instance, kubernetes_environment, FakeRuntime, FakeRuntimeFactory, MemoryStore,
    };
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn monitor_with(
        store: Arc<MemoryStore>,
        runtime: Arc<FakeRuntime>,
        max_concurrency: usize,
    ) -> ContainerMonitor {
        ContainerMonitor::new(
            store.clone(),
            store,
            Arc::new(FakeRuntimeFactory { runtime }),
            max_concurrency,
        )
    }

    #[tokio::test]
    async fn healthy_ready_container_is_a_no_op() {
        let store = MemoryStore::with_environment(kubernetes_environment(1));
        let mut instance = hosting_instance("a1b2c3d4", 1);
        instance.container_status = ContainerStatus::Running;
        instance.container_is_ready = true;
        store.put_instance(instance.clone());

        let runtime = Arc::new(FakeRuntime::running(&instance.container_name));
        let monitor = monitor_with(store.clone(), runtime, DEFAULT_MAX_CONCURRENCY);

        let outcome = monitor.check_instance(instance).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Unchanged);
        assert_eq!(store.update_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn instances_without_a_container_are_skipped() {
        let store = MemoryStore::with_environment(kubernetes_environment(1));
        let mut instance = hosting_instance("a1b2c3d4", 1);
        instance.container_name = String::new();

        let runtime = Arc::new(FakeRuntime::default());
        let monitor = monitor_with(store, runtime.clone(), DEFAULT_MAX_CONCURRENCY);

        let outcome = monitor.check_instance(instance).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Skipped);
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_workload_is_recreated_from_the_descriptor() {
        let store = MemoryStore::with_environment(kubernetes_environment(1));
        let instance = hosting_instance("a1b2c3d4", 1);
        store.put_instance(instance.clone());

        // No scripted info: container_info errors like a 404 would.
        let runtime = Arc::new(FakeRuntime::default());
        let monitor = monitor_with(store.clone(), runtime.clone(), DEFAULT_MAX_CONCURRENCY);

        let outcome = monitor.check_instance(instance).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Recreated);

        let calls = runtime.calls();
        assert!(calls.contains(&"create_container:mcp-instance-a1b2c3d4-container".to_string()));
        assert!(calls.contains(&"create_service:mcp-instance-a1b2c3d4-service".to_string()));

        let persisted = store.instance("a1b2c3d4").unwrap();
        assert_eq!(persisted.container_status, ContainerStatus::Pending);
        assert_eq!(
            persisted.container_last_message,
            "Container does not exist, recreating"
        );
    }

    #[tokio::test]
    async fn startup_timeout_cleans_up_and_stops() {
        let store = MemoryStore::with_environment(kubernetes_environment(1));
        let mut instance = hosting_instance("a1b2c3d4", 1);
        instance.startup_timeout_ms = 60_000;
        store.put_instance(instance.clone());

        let runtime = Arc::new(FakeRuntime::running(&instance.container_name));
        {
            let mut info = runtime.info.lock().unwrap();
            let info = info.as_mut().unwrap();
            info.phase = ContainerPhase::Pending;
            info.created_at = Utc::now() - ChronoDuration::milliseconds(61_000);
        }
        *runtime.readiness.lock().unwrap() = Some(Readiness {
            ready: false,
            message: "ready replicas 0/1".to_string(),
        });

        let monitor = monitor_with(store.clone(), runtime.clone(), DEFAULT_MAX_CONCURRENCY);
        let outcome = monitor.check_instance(instance).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Stopped(ContainerStatus::InitTimeoutStop));

        let calls = runtime.calls();
        assert!(calls.contains(&"delete_container:mcp-instance-a1b2c3d4-container".to_string()));
        assert!(calls.contains(&"delete_service:mcp-instance-a1b2c3d4-service".to_string()));

        let persisted = store.instance("a1b2c3d4").unwrap();
        assert_eq!(persisted.container_status, ContainerStatus::InitTimeoutStop);
        assert!(!persisted.container_is_ready);
        assert!(persisted.container_last_message.contains("60000ms"));
    }

    #[tokio::test]
    async fn running_container_degrades_when_readiness_drops() {
        let store = MemoryStore::with_environment(kubernetes_environment(1));
        let mut instance = hosting_instance("a1b2c3d4", 1);
        instance.container_status = ContainerStatus::Running;
        instance.container_is_ready = true;
        store.put_instance(instance.clone());

        let runtime = Arc::new(FakeRuntime::running(&instance.container_name));
        *runtime.readiness.lock().unwrap() = Some(Readiness {
            ready: false,
            message: "pod pod-1 container waiting: CrashLoopBackOff".to_string(),
        });

        let monitor = monitor_with(store.clone(), runtime, DEFAULT_MAX_CONCURRENCY);
        let outcome = monitor.check_instance(instance).await.unwrap();
        assert_eq!(
            outcome,
            CheckOutcome::Transitioned(ContainerStatus::RunningUnready)
        );

        let persisted = store.instance("a1b2c3d4").unwrap();
        assert!(!persisted.container_is_ready);
        assert!(persisted
            .container_last_message
            .contains("CrashLoopBackOff"));
    }

    #[tokio::test]
    async fn pending_container_promotes_to_running_when_ready() {
        let store = MemoryStore::with_environment(kubernetes_environment(1));
        let instance = hosting_instance("a1b2c3d4", 1);
        store.put_instance(instance.clone());

        let runtime = Arc::new(FakeRuntime::running(&instance.container_name));
        let monitor = monitor_with(store.clone(), runtime, DEFAULT_MAX_CONCURRENCY);

        let outcome = monitor.check_instance(instance).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Transitioned(ContainerStatus::Running));

        let persisted = store.instance("a1b2c3d4").unwrap();
        assert!(persisted.container_is_ready);
        assert_eq!(persisted.container_status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn sweep_checks_every_instance_with_bounded_concurrency() {
        let store = MemoryStore::with_environment(kubernetes_environment(1));
        for index in 0..15 {
            let mut instance = hosting_instance(&format!("instance{:02}", index), 1);
            instance.container_status = ContainerStatus::Running;
            instance.container_is_ready = true;
            store.put_instance(instance);
        }

        let runtime = Arc::new(FakeRuntime::running("shared"));
        *runtime.info_delay.lock().unwrap() = Duration::from_millis(25);

        let monitor = monitor_with(store, runtime.clone(), DEFAULT_MAX_CONCURRENCY);
        let summary = monitor.run_sweep().await.unwrap();

        assert_eq!(summary.checked, 15);
        assert_eq!(summary.failed, 0);
        assert!(
            runtime.max_active.load(Ordering::SeqCst) <= DEFAULT_MAX_CONCURRENCY,
            "no more than {} checks may run at once",
            DEFAULT_MAX_CONCURRENCY
        );
    }

    #[tokio::test]
    async fn per_instance_failures_do_not_abort_the_sweep() {
        let store = MemoryStore::with_environment(kubernetes_environment(1));
        // One healthy instance and one pointing at a missing environment.
        let mut healthy = hosting_instance("a1b2c3d4", 1);
        healthy.container_status = ContainerStatus::Running;
        healthy.container_is_ready = true;
        store.put_instance(healthy);
        store.put_instance(hosting_instance("ffffffff", 42));

        let runtime = Arc::new(FakeRuntime::running("shared"));
        let monitor = monitor_with(store, runtime, DEFAULT_MAX_CONCURRENCY);
        let summary = monitor.run_sweep().await.unwrap();

        assert_eq!(summary.checked, 1);
        assert_eq!(summary.failed, 1);
    }
}
