use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::shuffle::ShuffleLocation;
use crate::split::Split;
use crate::task::AttemptId;

pub type WorkerId = String;

/// Todo lo que un worker sin estado necesita para ejecutar un intento.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub job_id: JobId,
    pub attempt: AttemptId,
    pub input: AssignmentInput,
    pub num_partitions: u32,
    /// Nombre en el registro de funciones.
    pub functions: String,
    /// Raíz del directorio de trabajo del job (compartido).
    pub work_dir: String,
    pub speculative: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AssignmentInput {
    Map {
        split: Split,
    },
    Reduce {
        partition: u32,
        sources: Vec<ShuffleLocation>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: WorkerId,
}

/// Un intento en vuelo, para el heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunningAttempt {
    pub job_id: JobId,
    pub attempt: AttemptId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: WorkerId,
    /// Intentos que este worker sigue ejecutando.
    #[serde(default)]
    pub attempts: Vec<RunningAttempt>,
    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatResponse {
    pub ok: bool,
    /// Intentos que el master ya no considera vivos: el worker puede
    /// abandonarlos.
    #[serde(default)]
    pub cancelled: Vec<RunningAttempt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentRequest {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentResponse {
    pub task: Option<Assignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteRequest {
    pub job_id: JobId,
    pub attempt: AttemptId,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteResponse {
    pub ok: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub dead: bool,
    pub max_concurrency: u32,
    pub last_heartbeat_secs_ago: u64,
    pub active_tasks: u32,
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub avg_task_ms: Option<f64>,
    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
}
