use anyhow::Result;
use chrono::Utc;
use cron::Schedule;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::instance::error::{InstanceError, InstanceResult};

/// A task body. The token is the scheduler's shutdown signal; long-running
/// ticks are expected to observe it and return early.
pub type TaskFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A registered cron task. Expressions use six fields with a leading
/// seconds column, e.g. `*/30 * * * * *`.
#[derive(Clone)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub kind: String,
    pub func: TaskFn,
}

struct RegisteredTask {
    task: Task,
    schedule: Schedule,
    /// Set while the scheduler runs; cancelling it stops this task alone.
    token: Option<CancellationToken>,
}

struct RunningState {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Cron-driven task registry. Each task gets its own dispatch loop; a tick
/// only starts after the previous tick of the same task has returned, so
/// two ticks never overlap.
#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<HashMap<String, RegisteredTask>>,
    running: Mutex<Option<RunningState>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Rejects duplicate ids and malformed expressions.
    /// When the scheduler is already running the task's loop starts
    /// immediately.
    pub fn add_task(&self, task: Task) -> InstanceResult<()> {
        let schedule = Schedule::from_str(&task.cron_expression).map_err(|err| {
            InstanceError::validation(format!(
                "invalid cron expression {:?}: {}",
                task.cron_expression, err
            ))
        })?;

        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(&task.id) {
            return Err(InstanceError::conflict(format!(
                "task id {} is already registered",
                task.id
            )));
        }

        let mut registered = RegisteredTask {
            task: task.clone(),
            schedule: schedule.clone(),
            token: None,
        };

        let mut running = self.running.lock().unwrap();
        if let Some(state) = running.as_mut() {
            let token = state.token.child_token();
            registered.token = Some(token.clone());
            state
                .handles
                .push(tokio::spawn(run_task_loop(task.clone(), schedule, token)));
        }
        tasks.insert(task.id.clone(), registered);
        Ok(())
    }

    /// Deregister a task, stopping its loop if the scheduler runs.
    /// Returns false when the id is unknown.
    pub fn remove_task(&self, id: &str) -> bool {
        let Some(registered) = self.tasks.lock().unwrap().remove(id) else {
            return false;
        };
        if let Some(token) = registered.token {
            token.cancel();
        }
        true
    }

    /// Start dispatch loops for every registered task. Idempotent.
    pub fn start(&self) {
        // Lock order matches add_task: tasks before running.
        let mut tasks = self.tasks.lock().unwrap();
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            debug!("scheduler already started");
            return;
        }

        let token = CancellationToken::new();
        let mut handles = Vec::new();
        for registered in tasks.values_mut() {
            let task_token = token.child_token();
            registered.token = Some(task_token.clone());
            handles.push(tokio::spawn(run_task_loop(
                registered.task.clone(),
                registered.schedule.clone(),
                task_token,
            )));
        }
        info!(tasks = tasks.len(), "scheduler started");
        *running = Some(RunningState { token, handles });
    }

    /// Signal shutdown and wait for in-flight task invocations to finish.
    pub async fn stop(&self) {
        let state = self.running.lock().unwrap().take();
        let Some(state) = state else {
            return;
        };
        state.token.cancel();
        for handle in state.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "task loop join failed");
            }
        }
        for registered in self.tasks.lock().unwrap().values_mut() {
            registered.token = None;
        }
        info!("scheduler stopped");
    }
}

async fn run_task_loop(task: Task, schedule: Schedule, token: CancellationToken) {
    info!(task = task.name, kind = task.kind, cron = task.cron_expression, "task loop started");
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!(task = task.name, "cron schedule yields no further fire times");
            return;
        };
        let delay = (next - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_millis(0));

        tokio::select! {
            _ = token.cancelled() => {
                debug!(task = task.name, "task loop cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        // The invocation is awaited to completion before the next fire time
        // is computed; the token lets the tick bail out early on shutdown.
        if let Err(err) = (task.func)(token.child_token()).await {
            warn!(task = task.name, error = %err, "task invocation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_task(id: &str, cron: &str, counter: Arc<AtomicUsize>) -> Task {
        Task {
            id: id.to_string(),
            name: format!("task-{}", id),
            cron_expression: cron.to_string(),
            kind: "test".to_string(),
            func: Arc::new(move |_token| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
        }
    }

    #[tokio::test]
    async fn duplicate_task_ids_are_rejected() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task(counting_task("monitor", "*/30 * * * * *", counter.clone()))
            .unwrap();
        let err = scheduler
            .add_task(counting_task("monitor", "*/30 * * * * *", counter))
            .unwrap_err();
        assert!(matches!(err, InstanceError::Conflict(_)));
    }

    #[tokio::test]
    async fn invalid_cron_expressions_are_rejected() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let err = scheduler
            .add_task(counting_task("monitor", "not a cron", counter))
            .unwrap_err();
        assert!(matches!(err, InstanceError::Validation(_)));
    }

    #[tokio::test]
    async fn remove_task_reports_whether_the_id_existed() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task(counting_task("monitor", "*/30 * * * * *", counter))
            .unwrap();
        assert!(scheduler.remove_task("monitor"));
        assert!(!scheduler.remove_task("monitor"));
    }

    #[tokio::test]
    async fn started_tasks_fire_and_stop_halts_them() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task(counting_task("every-second", "* * * * * *", counter.clone()))
            .unwrap();

        scheduler.start();
        // Idempotent second start.
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(2_300)).await;
        scheduler.stop().await;
        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 1, "task should have fired at least once, got {}", fired);

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), fired, "no fires after stop");
    }

    #[tokio::test]
    async fn tasks_added_while_running_start_immediately() {
        let scheduler = Scheduler::new();
        scheduler.start();

        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_task(counting_task("late", "* * * * * *", counter.clone()))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2_300)).await;
        scheduler.stop().await;
        assert!(counter.load(Ordering::SeqCst) >= 1);
    }
}
