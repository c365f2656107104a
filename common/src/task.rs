use std::fmt;

use serde::{Deserialize, Serialize};

use crate::split::Split;
use crate::worker::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Map,
    Reduce,
}

/// Identificador de tarea: `m_000003` o `r_000001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub kind: TaskKind,
    pub index: u32,
}

impl TaskId {
    pub fn map(index: u32) -> Self {
        Self {
            kind: TaskKind::Map,
            index,
        }
    }

    pub fn reduce(index: u32) -> Self {
        Self {
            kind: TaskKind::Reduce,
            index,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind {
            TaskKind::Map => 'm',
            TaskKind::Reduce => 'r',
        };
        write!(f, "{}_{:06}", tag, self.index)
    }
}

/// Un intento concreto de una tarea: `m_000003_1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptId {
    pub task: TaskId,
    pub attempt: u32,
}

impl AttemptId {
    pub fn new(task: TaskId, attempt: u32) -> Self {
        Self { task, attempt }
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.task, self.attempt)
    }
}

/// Entrada de una tarea: un split (map) o un índice de partición (reduce).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskInput {
    Split(Split),
    Partition(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    PermanentlyFailed,
}

impl TaskState {
    pub fn name(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::PermanentlyFailed => "PERMANENTLY_FAILED",
        }
    }

    /// Transiciones válidas de la máquina de estados.
    /// `Pending -> Completed` cubre el éxito tardío de un intento que
    /// expiró por timeout mientras la tarea esperaba reasignación.
    pub fn can_move_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Pending, Completed)
                | (Failed, Pending)
                | (Failed, PermanentlyFailed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub input: TaskInput,
    pub state: TaskState,
    /// Worker del último intento lanzado.
    pub worker: Option<WorkerId>,
    /// Número del próximo intento (0 si nunca se lanzó).
    pub next_attempt: u32,
    pub failures: u32,
    pub started_at: Option<std::time::Instant>,
    pub committed: Option<AttemptId>,
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, input: TaskInput) -> Self {
        Self {
            id,
            input,
            state: TaskState::Pending,
            worker: None,
            next_attempt: 0,
            failures: 0,
            started_at: None,
            committed: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Attempt {
    pub id: AttemptId,
    pub worker: WorkerId,
    pub state: AttemptState,
    pub speculative: bool,
    pub started_at: std::time::Instant,
    pub last_heartbeat: std::time::Instant,
    /// Ubicaciones de salida una vez promovido.
    pub outputs: Vec<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_se_formatean_estilo_hadoop() {
        let t = TaskId::map(3);
        assert_eq!(t.to_string(), "m_000003");
        assert_eq!(AttemptId::new(TaskId::reduce(12), 2).to_string(), "r_000012_2");
    }

    #[test]
    fn transiciones_validas_e_invalidas() {
        assert!(TaskState::Pending.can_move_to(TaskState::Running));
        assert!(TaskState::Failed.can_move_to(TaskState::PermanentlyFailed));
        assert!(!TaskState::Completed.can_move_to(TaskState::Running));
        assert!(!TaskState::PermanentlyFailed.can_move_to(TaskState::Pending));
        assert!(!TaskState::Pending.can_move_to(TaskState::Failed));
    }
}
