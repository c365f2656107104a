use std::{
    collections::{HashSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::commit::CommitCoordinator;
use crate::config::JobConfig;
use crate::error::{MrError, Result};
use crate::job::{JobCounters, JobFailure, JobId, JobReport, JobRequest, JobStatus};
use crate::layout::JobLayout;
use crate::ledger::{CommitCheck, FailureOutcome, TaskLedger};
use crate::shuffle::ShuffleStore;
use crate::split::plan_files;
use crate::task::{AttemptId, TaskId, TaskInput, TaskState};
use crate::worker::{Assignment, AssignmentInput, WorkerId};

/// Resultado que reporta un worker para un intento.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed(String),
}

/// Qué hizo el scheduler con un reporte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// El intento ganó y su salida quedó promovida.
    Committed,
    /// Además era el último reduce: el job quedó publicado.
    JobCommitted,
    /// Otro intento ya había ganado; la salida se descartó.
    Duplicate,
    /// Fallo absorbido: la tarea se reintenta o tiene otro intento vivo.
    Retrying,
    /// Nada cambió (intento ya cerrado o job terminado).
    Ignored,
    /// El fallo agotó los intentos de la tarea y el job falló.
    JobFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: Vec<AttemptId>,
    pub speculated: Vec<TaskId>,
}

/// Foto del estado del job para la API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub status: JobStatus,
    pub counters: JobCounters,
    pub pending: u32,
    pub running: u32,
    pub completed: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output_files: Vec<String>,
    pub failure: Option<JobFailure>,
}

struct SchedulerState {
    ledger: TaskLedger,
    speculation_queue: VecDeque<TaskId>,
    speculated: HashSet<TaskId>,
    status: JobStatus,
    failure: Option<JobFailure>,
    output_files: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Coordina un job: reparte tareas, reacciona a heartbeats, fallos y
/// timeouts, y confirma intentos contra el `CommitCoordinator`.
///
/// Todo cambio del ledger ocurre con `state` tomado, incluido el promote,
/// así que check -> promote -> mark_committed es atómico respecto de
/// cualquier otro reporte.
pub struct Scheduler {
    job_id: JobId,
    config: JobConfig,
    functions: String,
    output_dir: PathBuf,
    commits: Arc<CommitCoordinator>,
    shuffle: ShuffleStore,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    /// Valida la configuración, planifica los splits y crea las tareas map.
    /// El directorio de salida no puede existir.
    pub fn new(job_id: JobId, request: &JobRequest, work_dir: &Path) -> Result<Self> {
        request.config.validate()?;

        let output_dir = PathBuf::from(&request.output_dir);
        if output_dir.exists() {
            return Err(MrError::config(format!(
                "el directorio de salida {} ya existe",
                output_dir.display()
            )));
        }

        let splits = plan_files(&request.inputs, request.config.split_size)?;
        info!(
            "job {} ({}): {} splits, {} reducers",
            job_id,
            request.name,
            splits.len(),
            request.config.num_reducers
        );

        let ledger = TaskLedger::new(
            splits,
            request.config.num_reducers,
            request.config.max_attempts,
        );
        let commits = Arc::new(CommitCoordinator::new(JobLayout::new(work_dir, &job_id)));

        Ok(Self {
            shuffle: ShuffleStore::new(commits.clone()),
            commits,
            job_id,
            config: request.config.clone(),
            functions: request.functions.clone(),
            output_dir,
            state: Mutex::new(SchedulerState {
                ledger,
                speculation_queue: VecDeque::new(),
                speculated: HashSet::new(),
                status: JobStatus::Accepted,
                failure: None,
                output_files: Vec::new(),
                started_at: None,
                finished_at: None,
            }),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn layout(&self) -> &JobLayout {
        self.commits.layout()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn lock(&self) -> Result<MutexGuard<'_, SchedulerState>> {
        self.state
            .lock()
            .map_err(|_| MrError::store("lock del scheduler envenenado"))
    }

    /* =========================
       Asignación
       ========================= */

    /// Próximo intento para `worker`: primero tareas PENDING (maps en orden
    /// de split, reduce tras la barrera), luego copias especulativas.
    pub fn assign_next(&self, worker: &WorkerId) -> Result<Option<Assignment>> {
        let mut guard = self.lock()?;
        let st = &mut *guard;

        if st.status.is_terminal() {
            return Ok(None);
        }

        let now = Instant::now();
        let (attempt, speculative) = if let Some(task) = st.ledger.next_pending() {
            (st.ledger.start_attempt(&task, worker, now, false)?, false)
        } else if let Some(task) = pick_speculative(st, worker) {
            (st.ledger.start_attempt(&task, worker, now, true)?, true)
        } else {
            return Ok(None);
        };

        if st.status == JobStatus::Accepted {
            st.status = JobStatus::Running;
            st.started_at = Some(Utc::now());
        }

        let assignment = self.build_assignment(&st.ledger, attempt, speculative)?;
        info!(
            "job {}: intento {}{} asignado a worker {}",
            self.job_id,
            attempt,
            if speculative { " (especulativo)" } else { "" },
            worker
        );
        Ok(Some(assignment))
    }

    fn build_assignment(
        &self,
        ledger: &TaskLedger,
        attempt: AttemptId,
        speculative: bool,
    ) -> Result<Assignment> {
        let task = ledger
            .task(&attempt.task)
            .ok_or(MrError::UnknownAttempt(attempt))?;

        let input = match &task.input {
            TaskInput::Split(split) => AssignmentInput::Map {
                split: split.clone(),
            },
            TaskInput::Partition(p) => AssignmentInput::Reduce {
                partition: *p,
                sources: self.shuffle.list_files_for_partition(*p),
            },
        };

        Ok(Assignment {
            job_id: self.job_id.clone(),
            attempt,
            input,
            num_partitions: self.config.num_reducers,
            functions: self.functions.clone(),
            work_dir: self.layout().root().to_string_lossy().to_string(),
            speculative,
        })
    }

    /* =========================
       Reportes de workers
       ========================= */

    /// `Ok(false)` si el intento ya no está vivo: el worker puede dejarlo.
    pub fn report_heartbeat(&self, attempt: &AttemptId) -> Result<bool> {
        let mut st = self.lock()?;
        if st.status.is_terminal() {
            return Ok(false);
        }
        st.ledger.heartbeat(attempt, Instant::now())
    }

    pub fn report_result(&self, attempt: &AttemptId, outcome: AttemptOutcome) -> Result<ReportOutcome> {
        let mut guard = self.lock()?;
        let st = &mut *guard;

        if st.ledger.attempt(attempt).is_none() {
            return Err(MrError::UnknownAttempt(*attempt));
        }

        if st.status.is_terminal() {
            debug!("job {} terminado: se ignora el reporte de {}", self.job_id, attempt);
            // lo que un intento tardío haya dejado en disco ya no se publica
            self.commits.cleanup();
            return Ok(ReportOutcome::Ignored);
        }

        match outcome {
            AttemptOutcome::Succeeded => self.commit_attempt(st, attempt),
            AttemptOutcome::Failed(reason) => self.fail_attempt(st, attempt, &reason, false),
        }
    }

    pub fn report_timeout(&self, attempt: &AttemptId) -> Result<ReportOutcome> {
        let mut guard = self.lock()?;
        let st = &mut *guard;
        if st.status.is_terminal() {
            return Ok(ReportOutcome::Ignored);
        }
        self.fail_attempt(st, attempt, "sin heartbeat dentro del timeout", true)
    }

    fn commit_attempt(&self, st: &mut SchedulerState, attempt: &AttemptId) -> Result<ReportOutcome> {
        match st.ledger.check_commit(attempt)? {
            CommitCheck::Duplicate => return Ok(ReportOutcome::Duplicate),
            CommitCheck::AlreadyCommitted(winner) => {
                info!("{} terminó pero {} ya ganó la tarea; se descarta", attempt, winner);
                st.ledger.mark_duplicate(attempt)?;
                self.commits.discard(attempt);
                return Ok(ReportOutcome::Duplicate);
            }
            CommitCheck::Rejected => {
                self.commits.discard(attempt);
                return Ok(ReportOutcome::Ignored);
            }
            CommitCheck::Proceed => {}
        }

        match self.commits.promote(attempt) {
            Ok(dir) => {
                let effect = st
                    .ledger
                    .mark_committed(attempt, file_names(&dir), Instant::now())?;
                if effect.reduce_tasks_created {
                    info!("job {}: todos los maps completos, arrancan los reduce", self.job_id);
                }
                if effect.job_ready {
                    return Ok(self.commit_job(st));
                }
                Ok(ReportOutcome::Committed)
            }
            Err(MrError::AlreadyCommitted { winner, .. }) => {
                warn!("{} perdió el promote contra {}", attempt, winner);
                st.ledger.mark_duplicate(attempt)?;
                self.commits.discard(attempt);
                Ok(ReportOutcome::Duplicate)
            }
            Err(e) if e.is_attempt_level() => {
                warn!("promote de {} falló: {}", attempt, e);
                self.fail_attempt(st, attempt, &e.to_string(), false)
            }
            Err(e) => Err(e),
        }
    }

    fn fail_attempt(
        &self,
        st: &mut SchedulerState,
        attempt: &AttemptId,
        reason: &str,
        timed_out: bool,
    ) -> Result<ReportOutcome> {
        let outcome = st.ledger.record_failure(attempt, reason, timed_out)?;

        // un intento que expiró puede seguir vivo y terminar bien más tarde
        if !timed_out {
            self.commits.discard(attempt);
        }

        match outcome {
            FailureOutcome::Requeued | FailureOutcome::SiblingRunning => {
                warn!("job {}: intento {} falló: {}", self.job_id, attempt, reason);
                Ok(ReportOutcome::Retrying)
            }
            FailureOutcome::Ignored => Ok(ReportOutcome::Ignored),
            FailureOutcome::Exhausted(failure) => {
                self.fail_job(st, failure);
                Ok(ReportOutcome::JobFailed)
            }
        }
    }

    fn commit_job(&self, st: &mut SchedulerState) -> ReportOutcome {
        let reduce_tasks = st.ledger.reduce_task_ids();
        match self.commits.commit_job(&self.output_dir, &reduce_tasks) {
            Ok(files) => {
                st.status = JobStatus::Succeeded;
                st.output_files = files;
                st.finished_at = Some(Utc::now());
                self.commits.cleanup();
                info!(
                    "job {} completado: {} archivos en {}",
                    self.job_id,
                    st.output_files.len(),
                    self.output_dir.display()
                );
                ReportOutcome::JobCommitted
            }
            Err(e) => {
                self.fail_job(
                    st,
                    JobFailure {
                        task: None,
                        attempts: 0,
                        last_error: e.to_string(),
                    },
                );
                ReportOutcome::JobFailed
            }
        }
    }

    fn fail_job(&self, st: &mut SchedulerState, failure: JobFailure) {
        warn!("job {} falló: {}", self.job_id, failure.last_error);
        st.ledger.abort_running("el job falló");
        st.status = JobStatus::Failed;
        st.failure = Some(failure);
        st.finished_at = Some(Utc::now());
        self.commits.abort_job();
        self.commits.cleanup();
    }

    /* =========================
       Timeouts y especulación
       ========================= */

    /// Expira intentos sin heartbeat y, si el job lo configura, encola
    /// copias especulativas de stragglers.
    pub fn sweep(&self, now: Instant) -> Result<SweepReport> {
        let mut guard = self.lock()?;
        let st = &mut *guard;
        let mut report = SweepReport::default();

        if st.status.is_terminal() {
            return Ok(report);
        }

        for attempt in st.ledger.expired_attempts(now, self.config.heartbeat_timeout()) {
            warn!("job {}: intento {} sin heartbeat, se da por caído", self.job_id, attempt);
            let outcome = self.fail_attempt(st, &attempt, "sin heartbeat dentro del timeout", true)?;
            report.timed_out.push(attempt);
            if outcome == ReportOutcome::JobFailed {
                return Ok(report);
            }
        }

        if let Some(spec) = &self.config.speculation {
            let candidates = st.ledger.straggler_candidates(
                now,
                spec.min_completed_samples,
                spec.runtime_multiplier,
                Duration::from_millis(spec.min_runtime_ms),
            );
            for task in candidates {
                if st.speculated.insert(task) {
                    info!("job {}: tarea {} es straggler, se lanza copia", self.job_id, task);
                    st.speculation_queue.push_back(task);
                    report.speculated.push(task);
                }
            }
        }

        Ok(report)
    }

    /* =========================
       Cancelación y estado
       ========================= */

    /// Cancela el job. `Ok(false)` si ya había terminado.
    pub fn abort(&self) -> Result<bool> {
        let mut st = self.lock()?;
        if st.status.is_terminal() {
            return Ok(false);
        }
        let aborted = st.ledger.abort_running("job abortado");
        st.status = JobStatus::Aborted;
        st.finished_at = Some(Utc::now());
        st.speculation_queue.clear();
        self.commits.abort_job();
        self.commits.cleanup();
        info!("job {} abortado ({} intentos en curso abandonados)", self.job_id, aborted.len());
        Ok(true)
    }

    pub fn is_finished(&self) -> bool {
        self.lock().map(|st| st.status.is_terminal()).unwrap_or(true)
    }

    pub fn progress(&self) -> Result<Progress> {
        let st = self.lock()?;
        let mut progress = Progress {
            status: st.status,
            counters: st.ledger.counters().clone(),
            pending: 0,
            running: 0,
            completed: 0,
            started_at: st.started_at,
            finished_at: st.finished_at,
            output_files: st.output_files.clone(),
            failure: st.failure.clone(),
        };
        for task in st.ledger.tasks() {
            match task.state {
                TaskState::Pending => progress.pending += 1,
                TaskState::Running => progress.running += 1,
                TaskState::Completed => progress.completed += 1,
                TaskState::Failed | TaskState::PermanentlyFailed => {}
            }
        }
        Ok(progress)
    }

    pub fn report(&self) -> Result<JobReport> {
        let p = self.progress()?;
        Ok(JobReport {
            job_id: self.job_id.clone(),
            status: p.status,
            counters: p.counters,
            output_dir: self.output_dir.to_string_lossy().to_string(),
            files: p.output_files,
            failure: p.failure,
        })
    }
}

/// Primera tarea encolada para especular que siga con un único intento
/// vivo y no lo esté corriendo ya `worker`.
fn pick_speculative(st: &mut SchedulerState, worker: &WorkerId) -> Option<TaskId> {
    let mut i = 0;
    while i < st.speculation_queue.len() {
        let task = st.speculation_queue[i];
        let running = st
            .ledger
            .task(&task)
            .map(|t| t.state == TaskState::Running)
            .unwrap_or(false);
        let live = st.ledger.live_attempts(&task);

        if !running || live.len() != 1 {
            st.speculation_queue.remove(i);
            continue;
        }
        let same_worker = live
            .iter()
            .filter_map(|a| st.ledger.attempt(a))
            .any(|a| a.worker == *worker);
        if same_worker {
            i += 1;
            continue;
        }

        st.speculation_queue.remove(i);
        return Some(task);
    }
    None
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpeculationConfig;
    use crate::layout::SUCCESS_MARKER;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("scheduler_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    /// Crea `n` archivos de 10 bytes: con split_size 10 da un split por archivo.
    fn scheduler(sub: &str, n: usize, config: JobConfig) -> (Scheduler, PathBuf) {
        let tmp = temp_dir(sub);
        let mut inputs = Vec::new();
        for i in 0..n {
            let path = tmp.join(format!("in-{i}.txt"));
            fs::write(&path, "aaaa bbbb\n").unwrap();
            inputs.push(path.to_string_lossy().to_string());
        }
        let request = JobRequest {
            name: sub.to_string(),
            inputs,
            output_dir: tmp.join("out").to_string_lossy().to_string(),
            functions: "wordcount".to_string(),
            config: JobConfig {
                split_size: 10,
                ..config
            },
        };
        let s = Scheduler::new("job".to_string(), &request, &tmp.join("work")).unwrap();
        (s, tmp)
    }

    fn stage(s: &Scheduler, a: &AttemptId, file: &str) {
        let dir = s.layout().staging_dir(a);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(file), a.to_string()).unwrap();
    }

    fn succeed(s: &Scheduler, a: &AttemptId) -> ReportOutcome {
        stage(s, a, "part-00000.jsonl");
        s.report_result(a, AttemptOutcome::Succeeded).unwrap()
    }

    fn w(name: &str) -> WorkerId {
        name.to_string()
    }

    #[test]
    fn reduce_espera_a_todos_los_maps() {
        let (s, _) = scheduler("barrera", 2, JobConfig { num_reducers: 2, ..JobConfig::default() });

        let m0 = s.assign_next(&w("w1")).unwrap().unwrap();
        let m1 = s.assign_next(&w("w2")).unwrap().unwrap();
        assert_eq!(m0.attempt.to_string(), "m_000000_0");
        assert_eq!(m1.attempt.to_string(), "m_000001_0");
        assert!(matches!(m0.input, AssignmentInput::Map { .. }));
        assert!(s.assign_next(&w("w3")).unwrap().is_none());

        assert_eq!(succeed(&s, &m0.attempt), ReportOutcome::Committed);
        assert!(s.assign_next(&w("w3")).unwrap().is_none());

        assert_eq!(succeed(&s, &m1.attempt), ReportOutcome::Committed);
        let r0 = s.assign_next(&w("w3")).unwrap().unwrap();
        assert_eq!(r0.attempt.task, TaskId::reduce(0));
        match r0.input {
            AssignmentInput::Reduce { partition, sources } => {
                assert_eq!(partition, 0);
                assert_eq!(sources.len(), 2);
                assert_eq!(sources[0].attempt, m0.attempt);
            }
            other => panic!("esperaba reduce: {:?}", other),
        }
    }

    #[test]
    fn job_completo_publica_salida_y_success() {
        let (s, tmp) = scheduler("completo", 1, JobConfig::default());

        let m = s.assign_next(&w("w")).unwrap().unwrap();
        succeed(&s, &m.attempt);
        let r = s.assign_next(&w("w")).unwrap().unwrap();
        stage(&s, &r.attempt, "part-r-00000");
        assert_eq!(
            s.report_result(&r.attempt, AttemptOutcome::Succeeded).unwrap(),
            ReportOutcome::JobCommitted
        );

        let out = tmp.join("out");
        assert!(out.join(SUCCESS_MARKER).exists());
        assert!(out.join("part-r-00000").exists());
        assert!(!s.layout().root().exists());

        let report = s.report().unwrap();
        assert!(report.succeeded());
        assert_eq!(report.files, vec!["part-r-00000".to_string()]);
        assert_eq!(report.counters.completed_tasks, 2);
        assert!(s.assign_next(&w("w")).unwrap().is_none());
    }

    #[test]
    fn exito_repetido_se_cuenta_una_sola_vez() {
        let (s, _) = scheduler("repetido", 2, JobConfig::default());
        let m0 = s.assign_next(&w("w")).unwrap().unwrap();

        assert_eq!(succeed(&s, &m0.attempt), ReportOutcome::Committed);
        assert_eq!(
            s.report_result(&m0.attempt, AttemptOutcome::Succeeded).unwrap(),
            ReportOutcome::Duplicate
        );
        assert_eq!(s.progress().unwrap().completed, 1);
    }

    #[test]
    fn timeout_de_t5_se_reencola_una_sola_vez() {
        let (s, _) = scheduler(
            "timeout",
            6,
            JobConfig {
                heartbeat_timeout_ms: 1_000,
                ..JobConfig::default()
            },
        );

        let assigned: Vec<Assignment> = (0..6)
            .map(|i| s.assign_next(&w(&format!("w{i}"))).unwrap().unwrap())
            .collect();
        for a in &assigned[..5] {
            assert_eq!(succeed(&s, &a.attempt), ReportOutcome::Committed);
        }
        let t5 = assigned[5].attempt;
        // el intento caído llegó a escribir su salida
        stage(&s, &t5, "part-00000.jsonl");

        let later = Instant::now() + Duration::from_secs(2);
        assert_eq!(s.sweep(later).unwrap().timed_out, vec![t5]);
        assert!(s.sweep(later + Duration::from_secs(1)).unwrap().timed_out.is_empty());
        assert_eq!(s.report_timeout(&t5).unwrap(), ReportOutcome::Ignored);

        let p = s.progress().unwrap();
        assert_eq!(p.pending, 1);
        assert_eq!(p.counters.attempts_timed_out, 1);

        let retry = s.assign_next(&w("w9")).unwrap().unwrap();
        assert_eq!(retry.attempt, AttemptId::new(TaskId::map(5), 1));
        assert!(s.assign_next(&w("w9")).unwrap().is_none());

        // el primer intento termina tarde y gana; el reintento queda como duplicado
        assert_eq!(
            s.report_result(&t5, AttemptOutcome::Succeeded).unwrap(),
            ReportOutcome::Committed
        );
        assert_eq!(succeed(&s, &retry.attempt), ReportOutcome::Duplicate);
        assert!(!s.layout().staging_dir(&retry.attempt).exists());
        assert_eq!(s.progress().unwrap().counters.duplicate_successes, 1);
    }

    #[test]
    fn especulacion_doble_exito_un_solo_commit() {
        let (s, _) = scheduler(
            "especulacion",
            2,
            JobConfig {
                speculation: Some(SpeculationConfig {
                    min_completed_samples: 1,
                    runtime_multiplier: 1.0,
                    min_runtime_ms: 0,
                }),
                ..JobConfig::default()
            },
        );

        let m0 = s.assign_next(&w("w1")).unwrap().unwrap();
        let m1 = s.assign_next(&w("lento")).unwrap().unwrap();
        succeed(&s, &m0.attempt);

        let report = s.sweep(Instant::now() + Duration::from_secs(5)).unwrap();
        assert_eq!(report.speculated, vec![TaskId::map(1)]);
        // una sola copia por tarea
        assert!(s
            .sweep(Instant::now() + Duration::from_secs(6))
            .unwrap()
            .speculated
            .is_empty());

        // nunca al worker que ya corre la tarea
        assert!(s.assign_next(&w("lento")).unwrap().is_none());
        let copy = s.assign_next(&w("w2")).unwrap().unwrap();
        assert!(copy.speculative);
        assert_eq!(copy.attempt, AttemptId::new(TaskId::map(1), 1));

        assert_eq!(succeed(&s, &copy.attempt), ReportOutcome::Committed);
        assert_eq!(succeed(&s, &m1.attempt), ReportOutcome::Duplicate);

        let committed = s.layout().committed_dir(&TaskId::map(1));
        assert_eq!(
            fs::read_to_string(committed.join("part-00000.jsonl")).unwrap(),
            copy.attempt.to_string()
        );
        let c = s.progress().unwrap().counters;
        assert_eq!(c.speculative_attempts, 1);
        assert_eq!(c.duplicate_successes, 1);
    }

    #[test]
    fn agotar_intentos_falla_el_job() {
        let (s, tmp) = scheduler(
            "agotado",
            1,
            JobConfig {
                max_attempts: 2,
                ..JobConfig::default()
            },
        );

        let a0 = s.assign_next(&w("w")).unwrap().unwrap();
        assert_eq!(
            s.report_result(&a0.attempt, AttemptOutcome::Failed("disco".into())).unwrap(),
            ReportOutcome::Retrying
        );
        let a1 = s.assign_next(&w("w")).unwrap().unwrap();
        assert_eq!(
            s.report_result(&a1.attempt, AttemptOutcome::Failed("disco".into())).unwrap(),
            ReportOutcome::JobFailed
        );

        assert!(s.is_finished());
        assert!(s.assign_next(&w("w")).unwrap().is_none());
        assert!(!tmp.join("out").exists());
        match s.report().unwrap().into_result() {
            Err(MrError::TaskExhausted { task, attempts, last_error }) => {
                assert_eq!(task, TaskId::map(0));
                assert_eq!(attempts, 2);
                assert_eq!(last_error, "disco");
            }
            other => panic!("esperaba TaskExhausted: {:?}", other),
        }
    }

    #[test]
    fn promote_sin_salida_cuenta_como_fallo_del_intento() {
        let (s, _) = scheduler("sin_salida", 1, JobConfig::default());
        let a0 = s.assign_next(&w("w")).unwrap().unwrap();
        assert_eq!(
            s.report_result(&a0.attempt, AttemptOutcome::Succeeded).unwrap(),
            ReportOutcome::Retrying
        );
        assert_eq!(s.progress().unwrap().pending, 1);
    }

    #[test]
    fn abort_no_publica_nada() {
        let (s, tmp) = scheduler("abort", 2, JobConfig::default());
        let a0 = s.assign_next(&w("w")).unwrap().unwrap();
        stage(&s, &a0.attempt, "part-00000.jsonl");

        assert!(s.abort().unwrap());
        assert!(!s.abort().unwrap());
        assert!(s.assign_next(&w("w")).unwrap().is_none());
        assert_eq!(
            s.report_result(&a0.attempt, AttemptOutcome::Succeeded).unwrap(),
            ReportOutcome::Ignored
        );
        assert!(!s.report_heartbeat(&a0.attempt).unwrap());
        assert!(!tmp.join("out").exists());
        assert!(!s.layout().staging_root().exists());
        assert!(!s.layout().root().exists());
        assert!(matches!(s.report().unwrap().into_result(), Err(MrError::JobAborted)));
    }

    #[test]
    fn job_fallido_borra_salidas_promovidas() {
        let (s, tmp) = scheduler(
            "fallido_limpia",
            2,
            JobConfig {
                max_attempts: 1,
                ..JobConfig::default()
            },
        );
        let m0 = s.assign_next(&w("w1")).unwrap().unwrap();
        let m1 = s.assign_next(&w("w2")).unwrap().unwrap();
        assert_eq!(succeed(&s, &m0.attempt), ReportOutcome::Committed);
        assert!(s.layout().committed_dir(&TaskId::map(0)).exists());

        assert_eq!(
            s.report_result(&m1.attempt, AttemptOutcome::Failed("disco".into())).unwrap(),
            ReportOutcome::JobFailed
        );
        assert!(!s.layout().root().exists());

        // un intento tardío que escribe después del fallo tampoco deja rastro
        stage(&s, &m1.attempt, "part-00000.jsonl");
        assert_eq!(
            s.report_result(&m1.attempt, AttemptOutcome::Succeeded).unwrap(),
            ReportOutcome::Ignored
        );
        assert!(!s.layout().root().exists());
        assert!(!tmp.join("out").exists());
    }

    #[test]
    fn config_invalida_o_salida_existente_es_config_error() {
        let tmp = temp_dir("config");
        let input = tmp.join("in.txt");
        fs::write(&input, "x\n").unwrap();
        let mut request = JobRequest {
            name: "cfg".into(),
            inputs: vec![input.to_string_lossy().to_string()],
            output_dir: tmp.to_string_lossy().to_string(),
            functions: "wordcount".into(),
            config: JobConfig::default(),
        };
        assert!(matches!(
            Scheduler::new("j".into(), &request, &tmp.join("work")),
            Err(MrError::Config(_))
        ));

        request.output_dir = tmp.join("out").to_string_lossy().to_string();
        request.config.num_reducers = 0;
        assert!(matches!(
            Scheduler::new("j".into(), &request, &tmp.join("work")),
            Err(MrError::Config(_))
        ));
    }

    #[test]
    fn attempt_desconocido_es_error() {
        let (s, _) = scheduler("desconocido", 1, JobConfig::default());
        let ghost = AttemptId::new(TaskId::map(7), 0);
        assert!(matches!(
            s.report_result(&ghost, AttemptOutcome::Succeeded),
            Err(MrError::UnknownAttempt(_))
        ));
    }
}
