use crate::db::models::ContainerStatus;
use crate::server::runtime::ContainerPhase;

/// Stop states a cleanup transition may land in.
pub fn is_stop_state(status: ContainerStatus) -> bool {
    matches!(
        status,
        ContainerStatus::InitTimeoutStop
            | ContainerStatus::RunTimeoutStop
            | ContainerStatus::ExceptionForceStop
            | ContainerStatus::ManualStop
            | ContainerStatus::CreateFailed
    )
}

/// `container_status = running` implies `container_is_ready = true`; every
/// other state implies false.
pub fn ready_for(status: ContainerStatus) -> bool {
    status == ContainerStatus::Running
}

/// Everything the per-tick evaluation needs, read once up front so the
/// decision itself is pure.
#[derive(Debug, Clone, Copy)]
pub struct CheckInput {
    pub current: ContainerStatus,
    pub phase: ContainerPhase,
    pub is_ready: bool,
    pub created_at_ms: i64,
    pub now_ms: i64,
    pub startup_timeout_ms: i64,
    pub running_timeout_ms: i64,
}

impl CheckInput {
    fn elapsed_ms(&self) -> i64 {
        self.now_ms - self.created_at_ms
    }

    fn startup_overdue(&self) -> bool {
        self.startup_timeout_ms > 0 && self.elapsed_ms() > self.startup_timeout_ms
    }

    fn running_overdue(&self) -> bool {
        self.running_timeout_ms > 0 && self.elapsed_ms() > self.running_timeout_ms
    }
}

/// Outcome of one evaluation. `Stop` carries a cleanup obligation: the
/// workload and its service are deleted before the state is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Stop(ContainerStatus),
    Transition(ContainerStatus),
}

impl Evaluation {
    pub fn status(&self) -> ContainerStatus {
        match self {
            Evaluation::Stop(status) | Evaluation::Transition(status) => *status,
        }
    }
}

/// Evaluate the container state machine for one instance. Rules are
/// ordered; the first match wins.
pub fn evaluate(input: &CheckInput) -> Evaluation {
    if input.phase != ContainerPhase::Running && input.startup_overdue() {
        return Evaluation::Stop(ContainerStatus::InitTimeoutStop);
    }

    if !input.is_ready {
        if input.startup_overdue() {
            return Evaluation::Stop(ContainerStatus::InitTimeoutStop);
        }
        if input.phase == ContainerPhase::Running && input.running_overdue() {
            return Evaluation::Stop(ContainerStatus::RunTimeoutStop);
        }
        // A previously running container degrades rather than resetting.
        return match input.current {
            ContainerStatus::Running | ContainerStatus::RunningUnready => {
                Evaluation::Transition(ContainerStatus::RunningUnready)
            }
            _ => Evaluation::Transition(ContainerStatus::Pending),
        };
    }

    if input.running_overdue() {
        return Evaluation::Stop(ContainerStatus::RunTimeoutStop);
    }

    Evaluation::Transition(ContainerStatus::Running)
}
