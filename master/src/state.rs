// master/src/state.rs

use chrono::{DateTime, Utc};
use common::{
    env_or, AttemptId, JobId, JobInfo, JobRequest, RunningAttempt, Scheduler, WorkerId,
};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

/// Parámetros del proceso master, leídos del entorno.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub bind_addr: String,
    /// Directorio de trabajo compartido con los workers.
    pub work_dir: PathBuf,
    pub sweep_interval: Duration,
    pub worker_dead_timeout: Duration,
}

impl MasterConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("MASTER_BIND_ADDR", "0.0.0.0:8080".to_string()),
            work_dir: PathBuf::from(env_or("MR_WORK_DIR", "/data/work".to_string())),
            sweep_interval: Duration::from_millis(env_or("FAILOVER_SWEEP_MS", 1_000u64)),
            worker_dead_timeout: Duration::from_millis(env_or("WORKER_DEAD_TIMEOUT_MS", 20_000u64)),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MasterConfig>,
    pub jobs: Arc<Mutex<HashMap<JobId, JobEntry>>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // intentos asignados y todavía sin reporte final
    pub in_flight: Arc<Mutex<HashMap<RunningAttempt, InFlight>>>,
}

impl AppState {
    pub fn new(config: MasterConfig) -> Self {
        Self {
            config: Arc::new(config),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn scheduler(&self, job_id: &str) -> Option<Arc<Scheduler>> {
        self.jobs
            .lock()
            .ok()
            .and_then(|jobs| jobs.get(job_id).map(|j| j.scheduler.clone()))
    }

    /// Schedulers de jobs sin terminar, en orden de llegada.
    pub fn active_schedulers(&self) -> Vec<Arc<Scheduler>> {
        let Ok(jobs) = self.jobs.lock() else {
            return Vec::new();
        };
        let mut active: Vec<&JobEntry> = jobs
            .values()
            .filter(|j| !j.scheduler.is_finished())
            .collect();
        active.sort_by_key(|j| j.submitted_at);
        let out: Vec<Arc<Scheduler>> = active.iter().map(|j| j.scheduler.clone()).collect();
        out
    }
}

/// Un job aceptado: su petición y el scheduler que lo coordina.
pub struct JobEntry {
    pub request: JobRequest,
    pub submitted_at: DateTime<Utc>,
    pub scheduler: Arc<Scheduler>,
}

impl JobEntry {
    /// Vista para la API, con el estado actual del scheduler.
    pub fn info(&self) -> common::Result<JobInfo> {
        let progress = self.scheduler.progress()?;
        Ok(JobInfo {
            id: self.scheduler.job_id().to_string(),
            name: self.request.name.clone(),
            status: progress.status,
            functions: self.request.functions.clone(),
            inputs: self.request.inputs.clone(),
            output_dir: self.request.output_dir.clone(),
            config: self.request.config.clone(),
            submitted_at: self.submitted_at,
            started_at: progress.started_at,
            finished_at: progress.finished_at,
            counters: progress.counters,
            failure: progress.failure,
        })
    }
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn new(hostname: String, max_concurrency: u32) -> Self {
        Self {
            hostname,
            last_heartbeat: SystemTime::now(),
            dead: false,
            max_concurrency: max_concurrency.max(1),
            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            total_task_time_ms: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub attempt: AttemptId,
    pub worker_id: WorkerId,
    pub started_at: SystemTime,
}
