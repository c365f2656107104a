use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::error::{MrError, Result};
use crate::job::{JobCounters, JobFailure};
use crate::split::Split;
use crate::task::{Attempt, AttemptId, AttemptState, Task, TaskId, TaskInput, TaskKind, TaskState};
use crate::worker::WorkerId;

/// Qué pasó con una tarea tras el fallo de uno de sus intentos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// La tarea vuelve a PENDING.
    Requeued,
    /// Otro intento de la misma tarea sigue corriendo.
    SiblingRunning,
    /// El intento ya no estaba corriendo o la tarea ya terminó: nada cambia.
    Ignored,
    /// Presupuesto agotado: la tarea queda PERMANENTLY_FAILED.
    Exhausted(JobFailure),
}

/// Qué hacer con el éxito reportado por un intento.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitCheck {
    /// Ningún intento promovido todavía: se puede intentar el promote.
    Proceed,
    /// Otro intento ya ganó.
    AlreadyCommitted(AttemptId),
    /// Este mismo intento ya reportó éxito antes.
    Duplicate,
    /// La tarea está perdida; el éxito no cuenta.
    Rejected,
}

/// Efecto de confirmar el intento ganador de una tarea.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitEffect {
    /// Se acaban de crear las tareas reduce (barrera de maps cumplida).
    pub reduce_tasks_created: bool,
    /// Todas las tareas reduce están COMPLETED: toca el commit del job.
    pub job_ready: bool,
}

/// Estado autoritativo de todas las tareas e intentos de un job.
///
/// No tiene locks propios: el `Scheduler` lo guarda detrás de un `Mutex` y
/// toda transición pasa por ahí.
pub struct TaskLedger {
    num_reducers: u32,
    max_attempts: u32,
    tasks: BTreeMap<TaskId, Task>,
    attempts: HashMap<AttemptId, Attempt>,
    map_runtimes: Vec<Duration>,
    reduce_runtimes: Vec<Duration>,
    counters: JobCounters,
}

impl TaskLedger {
    /// Crea una tarea map por split. Si no hay splits, la barrera ya está
    /// cumplida y se crean directamente las reduce.
    pub fn new(splits: Vec<Split>, num_reducers: u32, max_attempts: u32) -> Self {
        let mut tasks = BTreeMap::new();
        for split in splits {
            let id = TaskId::map(split.id);
            tasks.insert(id, Task::new(id, TaskInput::Split(split)));
        }

        let mut ledger = Self {
            num_reducers,
            max_attempts,
            counters: JobCounters {
                map_tasks: tasks.len() as u32,
                ..JobCounters::default()
            },
            tasks,
            attempts: HashMap::new(),
            map_runtimes: Vec::new(),
            reduce_runtimes: Vec::new(),
        };

        if ledger.counters.map_tasks == 0 {
            ledger.create_reduce_tasks();
        }
        ledger
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn attempt(&self, id: &AttemptId) -> Option<&Attempt> {
        self.attempts.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn attempts_of(&self, task: &TaskId) -> Vec<&Attempt> {
        let mut out: Vec<&Attempt> = self
            .attempts
            .values()
            .filter(|a| a.id.task == *task)
            .collect();
        out.sort_by_key(|a| a.id.attempt);
        out
    }

    pub fn counters(&self) -> &JobCounters {
        &self.counters
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| MrError::UnknownAttempt(AttemptId::new(*id, 0)))
    }

    /// Única puerta para cambiar el estado de una tarea.
    fn transition(&mut self, id: &TaskId, next: TaskState) -> Result<()> {
        let task = self.task_mut(id)?;
        if !task.state.can_move_to(next) {
            return Err(MrError::InvalidTransition {
                task: *id,
                from: task.state.name(),
                to: next.name(),
            });
        }
        debug!("tarea {}: {} -> {}", id, task.state.name(), next.name());
        task.state = next;
        Ok(())
    }

    pub fn all_maps_completed(&self) -> bool {
        self.tasks
            .values()
            .filter(|t| t.id.kind == TaskKind::Map)
            .all(|t| t.state == TaskState::Completed)
    }

    pub fn reduce_task_ids(&self) -> Vec<TaskId> {
        self.tasks
            .keys()
            .filter(|t| t.kind == TaskKind::Reduce)
            .copied()
            .collect()
    }

    fn create_reduce_tasks(&mut self) {
        for p in 0..self.num_reducers {
            let id = TaskId::reduce(p);
            self.tasks.insert(id, Task::new(id, TaskInput::Partition(p)));
        }
        self.counters.reduce_tasks = self.num_reducers;
        info!("barrera de maps cumplida: {} tareas reduce creadas", self.num_reducers);
    }

    /// Primera tarea PENDING en orden (maps por split, luego reduce por
    /// partición). Las reduce sólo existen tras la barrera.
    pub fn next_pending(&self) -> Option<TaskId> {
        self.tasks
            .values()
            .find(|t| t.state == TaskState::Pending)
            .map(|t| t.id)
    }

    /// Lanza un intento. Un intento normal saca a la tarea de PENDING; uno
    /// especulativo se suma a una tarea que ya está RUNNING.
    pub fn start_attempt(
        &mut self,
        id: &TaskId,
        worker: &WorkerId,
        now: Instant,
        speculative: bool,
    ) -> Result<AttemptId> {
        if speculative {
            let task = self.task_mut(id)?;
            if task.state != TaskState::Running {
                return Err(MrError::InvalidTransition {
                    task: *id,
                    from: task.state.name(),
                    to: "RUNNING (speculative)",
                });
            }
        } else {
            self.transition(id, TaskState::Running)?;
        }

        let task = self.task_mut(id)?;
        let attempt = AttemptId::new(*id, task.next_attempt);
        task.next_attempt += 1;
        task.worker = Some(worker.clone());
        if !speculative {
            task.started_at = Some(now);
        }

        self.attempts.insert(
            attempt,
            Attempt {
                id: attempt,
                worker: worker.clone(),
                state: AttemptState::Running,
                speculative,
                started_at: now,
                last_heartbeat: now,
                outputs: Vec::new(),
                error: None,
            },
        );

        self.counters.attempts_launched += 1;
        if speculative {
            self.counters.speculative_attempts += 1;
        }
        Ok(attempt)
    }

    /// Registra un heartbeat. Devuelve `false` si el intento ya no corre.
    pub fn heartbeat(&mut self, id: &AttemptId, now: Instant) -> Result<bool> {
        let attempt = self
            .attempts
            .get_mut(id)
            .ok_or(MrError::UnknownAttempt(*id))?;
        if attempt.state != AttemptState::Running {
            return Ok(false);
        }
        attempt.last_heartbeat = now;
        Ok(true)
    }

    pub fn live_attempts(&self, task: &TaskId) -> Vec<AttemptId> {
        self.attempts
            .values()
            .filter(|a| a.id.task == *task && a.state == AttemptState::Running)
            .map(|a| a.id)
            .collect()
    }

    /// Marca un intento como fallido y decide el destino de su tarea.
    pub fn record_failure(
        &mut self,
        id: &AttemptId,
        reason: &str,
        timed_out: bool,
    ) -> Result<FailureOutcome> {
        let attempt = self
            .attempts
            .get_mut(id)
            .ok_or(MrError::UnknownAttempt(*id))?;

        if attempt.state != AttemptState::Running {
            return Ok(FailureOutcome::Ignored);
        }
        attempt.state = AttemptState::Failed;
        attempt.error = Some(reason.to_string());

        self.counters.attempts_failed += 1;
        if timed_out {
            self.counters.attempts_timed_out += 1;
        }

        let max_attempts = self.max_attempts;
        let task = self.task_mut(&id.task)?;
        task.last_error = Some(reason.to_string());
        if task.state != TaskState::Running {
            return Ok(FailureOutcome::Ignored);
        }
        task.failures += 1;
        let failures = task.failures;

        if !self.live_attempts(&id.task).is_empty() {
            debug!("intento {} falló pero la tarea tiene otro intento vivo", id);
            return Ok(FailureOutcome::SiblingRunning);
        }

        self.transition(&id.task, TaskState::Failed)?;

        if failures >= max_attempts {
            self.transition(&id.task, TaskState::PermanentlyFailed)?;
            warn!(
                "tarea {} superó el máximo de intentos ({}), último error: {}",
                id.task, max_attempts, reason
            );
            return Ok(FailureOutcome::Exhausted(JobFailure {
                task: Some(id.task),
                attempts: failures,
                last_error: reason.to_string(),
            }));
        }

        self.transition(&id.task, TaskState::Pending)?;
        let task = self.task_mut(&id.task)?;
        task.worker = None;
        task.started_at = None;
        info!(
            "reencolando tarea {} tras fallo de {} ({}/{} fallos)",
            id.task, id, failures, max_attempts
        );
        Ok(FailureOutcome::Requeued)
    }

    /// Consulta previa al promote; no modifica nada.
    pub fn check_commit(&self, id: &AttemptId) -> Result<CommitCheck> {
        let attempt = self.attempts.get(id).ok_or(MrError::UnknownAttempt(*id))?;
        let task = self
            .tasks
            .get(&id.task)
            .ok_or(MrError::UnknownAttempt(*id))?;

        if let Some(winner) = task.committed {
            if winner == *id {
                return Ok(CommitCheck::Duplicate);
            }
            return Ok(CommitCheck::AlreadyCommitted(winner));
        }
        if attempt.state == AttemptState::Succeeded {
            return Ok(CommitCheck::Duplicate);
        }
        if task.state == TaskState::PermanentlyFailed {
            return Ok(CommitCheck::Rejected);
        }
        Ok(CommitCheck::Proceed)
    }

    /// El CommitCoordinator confirmó a `id` como ganador: única vía a
    /// COMPLETED.
    pub fn mark_committed(
        &mut self,
        id: &AttemptId,
        outputs: Vec<String>,
        now: Instant,
    ) -> Result<CommitEffect> {
        let attempt = self
            .attempts
            .get_mut(id)
            .ok_or(MrError::UnknownAttempt(*id))?;
        attempt.state = AttemptState::Succeeded;
        attempt.outputs = outputs;
        let runtime = now.saturating_duration_since(attempt.started_at);

        self.transition(&id.task, TaskState::Completed)?;
        let task = self.task_mut(&id.task)?;
        task.committed = Some(*id);
        self.counters.completed_tasks += 1;

        match id.task.kind {
            TaskKind::Map => self.map_runtimes.push(runtime),
            TaskKind::Reduce => self.reduce_runtimes.push(runtime),
        }

        let mut effect = CommitEffect::default();
        if id.task.kind == TaskKind::Map && self.all_maps_completed() {
            if self.reduce_task_ids().is_empty() {
                self.create_reduce_tasks();
                effect.reduce_tasks_created = true;
            }
        }
        if id.task.kind == TaskKind::Reduce {
            effect.job_ready = self
                .tasks
                .values()
                .filter(|t| t.id.kind == TaskKind::Reduce)
                .all(|t| t.state == TaskState::Completed);
        }
        Ok(effect)
    }

    /// Éxito tardío de un intento cuya tarea ya tiene ganador: se registra
    /// pero la tarea no cambia.
    pub fn mark_duplicate(&mut self, id: &AttemptId) -> Result<()> {
        let attempt = self
            .attempts
            .get_mut(id)
            .ok_or(MrError::UnknownAttempt(*id))?;
        if attempt.state != AttemptState::Succeeded {
            attempt.state = AttemptState::Succeeded;
            self.counters.duplicate_successes += 1;
        }
        Ok(())
    }

    /// Intentos vivos sin heartbeat desde hace más de `timeout`.
    pub fn expired_attempts(&self, now: Instant, timeout: Duration) -> Vec<AttemptId> {
        let mut out: Vec<AttemptId> = self
            .attempts
            .values()
            .filter(|a| a.state == AttemptState::Running)
            .filter(|a| now.saturating_duration_since(a.last_heartbeat) > timeout)
            .map(|a| a.id)
            .collect();
        out.sort();
        out
    }

    /// Tareas RUNNING con un solo intento vivo que corre más que
    /// `max(p95 * multiplier, min_runtime)` de las tareas de su tipo ya
    /// completadas.
    pub fn straggler_candidates(
        &self,
        now: Instant,
        min_samples: u32,
        multiplier: f64,
        min_runtime: Duration,
    ) -> Vec<TaskId> {
        let mut out = Vec::new();

        for task in self.tasks.values() {
            if task.state != TaskState::Running || task.next_attempt >= self.max_attempts {
                continue;
            }
            let samples = match task.id.kind {
                TaskKind::Map => &self.map_runtimes,
                TaskKind::Reduce => &self.reduce_runtimes,
            };
            if samples.len() < min_samples as usize {
                continue;
            }
            let Some(p95) = p95(samples) else {
                continue;
            };

            let live = self.live_attempts(&task.id);
            if live.len() != 1 {
                continue;
            }
            let Some(attempt) = self.attempts.get(&live[0]) else {
                continue;
            };

            let threshold = p95.mul_f64(multiplier.max(1.0)).max(min_runtime);
            if now.saturating_duration_since(attempt.started_at) >= threshold {
                out.push(task.id);
            }
        }

        out
    }

    /// Cancelación del job: todos los intentos vivos pasan a FAILED sin
    /// reencolar nada.
    pub fn abort_running(&mut self, reason: &str) -> Vec<AttemptId> {
        let mut aborted = Vec::new();
        for attempt in self.attempts.values_mut() {
            if attempt.state == AttemptState::Running {
                attempt.state = AttemptState::Failed;
                attempt.error = Some(reason.to_string());
                aborted.push(attempt.id);
            }
        }
        aborted.sort();
        aborted
    }
}

fn p95(samples: &[Duration]) -> Option<Duration> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort();
    let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
    Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
}
