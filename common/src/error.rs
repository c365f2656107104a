use thiserror::Error;

use crate::task::{AttemptId, TaskId};

pub type Result<T> = std::result::Result<T, MrError>;

/// Errores del motor. Sólo `Config` y `TaskExhausted` llegan a quien
/// envía el job; el resto se absorbe como fallo de intento.
#[derive(Error, Debug)]
pub enum MrError {
    /// Parámetros de job inválidos, se detecta antes de planificar.
    #[error("configuration error: {0}")]
    Config(String),

    /// Un intento falló; el scheduler lo reintenta.
    #[error("attempt {attempt} failed: {reason}")]
    TaskAttemptFailure { attempt: AttemptId, reason: String },

    /// Se agotó el presupuesto de intentos de una tarea: el job falla.
    #[error("task {task} failed {attempts} times, last error: {last_error}")]
    TaskExhausted {
        task: TaskId,
        attempts: u32,
        last_error: String,
    },

    /// Otra ejecución de la misma tarea ya fue promovida.
    #[error("task {task} already committed by attempt {winner}")]
    AlreadyCommitted { task: TaskId, winner: AttemptId },

    /// Fallo de E/S en shuffle u output.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: &'static str,
        to: &'static str,
    },

    #[error("unknown attempt {0}")]
    UnknownAttempt(AttemptId),

    #[error("job aborted")]
    JobAborted,
}

impl MrError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn store<E: std::fmt::Display>(err: E) -> Self {
        Self::StoreUnavailable(err.to_string())
    }

    /// `true` para los errores que sólo afectan a un intento.
    pub fn is_attempt_level(&self) -> bool {
        matches!(
            self,
            Self::TaskAttemptFailure { .. } | Self::StoreUnavailable(_)
        )
    }
}

impl From<std::io::Error> for MrError {
    fn from(err: std::io::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for MrError {
    fn from(err: serde_json::Error) -> Self {
        Self::StoreUnavailable(format!("serialization: {err}"))
    }
}
