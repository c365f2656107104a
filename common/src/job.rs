use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::JobConfig;
use crate::error::MrError;
use crate::record::JobFunctions;
use crate::task::TaskId;

pub type JobId = String;

/// Petición de job por HTTP: las funciones viajan por nombre.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,

    /// Rutas o patrones glob de entrada, ej: "/data/input/*.txt"
    pub inputs: Vec<String>,

    /// Directorio de salida; no debe existir todavía.
    pub output_dir: String,

    /// Nombre en el registro de funciones, ej: "wordcount"
    pub functions: String,

    #[serde(default)]
    pub config: JobConfig,
}

/// Job en proceso: las funciones son valores.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub inputs: Vec<String>,
    pub output_dir: String,
    pub functions: JobFunctions,
    pub config: JobConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Accepted,
    Running,
    Failed,
    Succeeded,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Succeeded | JobStatus::Aborted)
    }
}

/// Contadores de tareas e intentos del job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub map_tasks: u32,
    pub reduce_tasks: u32,
    pub completed_tasks: u32,
    pub attempts_launched: u32,
    pub attempts_failed: u32,
    pub attempts_timed_out: u32,
    pub speculative_attempts: u32,
    /// Éxitos de intentos que llegaron tarde y se descartaron.
    pub duplicate_successes: u32,
}

/// Por qué falló un job: la tarea perdida (si la hay) y su último error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub task: Option<TaskId>,
    pub attempts: u32,
    pub last_error: String,
}

impl JobFailure {
    pub fn into_error(self) -> MrError {
        match self.task {
            Some(task) => MrError::TaskExhausted {
                task,
                attempts: self.attempts,
                last_error: self.last_error,
            },
            None => MrError::StoreUnavailable(self.last_error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub functions: String,
    pub inputs: Vec<String>,
    pub output_dir: String,
    pub config: JobConfig,

    /// -------- Métricas del job --------
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: JobCounters,
    pub failure: Option<JobFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: JobId,
    /// Directorio donde quedaron los outputs de este job
    pub output_dir: String,
    /// Nombres de archivos de salida dentro de output_dir
    pub files: Vec<String>,
}

/// Resultado de enviar un job: éxito o fallo más contadores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub counters: JobCounters,
    pub output_dir: String,
    pub files: Vec<String>,
    pub failure: Option<JobFailure>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    /// Convierte un job fallido en `TaskExhausted`.
    pub fn into_result(self) -> Result<JobReport, MrError> {
        match (&self.status, self.failure.clone()) {
            (JobStatus::Succeeded, _) => Ok(self),
            (JobStatus::Aborted, _) => Err(MrError::JobAborted),
            (_, Some(failure)) => Err(failure.into_error()),
            (_, None) => Err(MrError::JobAborted),
        }
    }
}
