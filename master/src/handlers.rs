use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::{
    functions_by_name, AttemptOutcome, JobInfo, JobRequest, JobResults, JobStatus, MrError,
    ReportOutcome, RunningAttempt, Scheduler, TaskAssignmentRequest, TaskAssignmentResponse,
    TaskCompleteRequest, TaskCompleteResponse, WorkerHeartbeatRequest, WorkerHeartbeatResponse,
    WorkerId, WorkerMetrics, WorkerRegisterRequest, WorkerRegisterResponse,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::state::{AppState, InFlight, JobEntry, WorkerMeta};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/results", get(get_job_results))
        .route("/api/v1/jobs/:id/abort", post(abort_job))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/complete", post(complete_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Config -> 400, ids desconocidos -> 404, el resto -> 500.
fn api_error(e: MrError) -> (StatusCode, String) {
    let status = match &e {
        MrError::Config(_) => StatusCode::BAD_REQUEST,
        MrError::UnknownAttempt(_) => StatusCode::NOT_FOUND,
        MrError::JobAborted => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn not_found(what: &str, id: &str) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("{} {} no existe", what, id))
}

fn lock_error() -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, "lock envenenado".to_string())
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Acepta un job: valida, planifica los splits y crea su scheduler
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> ApiResult<JobInfo> {
    if functions_by_name(&req.functions).is_none() {
        return Err(api_error(MrError::config(format!(
            "funciones desconocidas: {}",
            req.functions
        ))));
    }

    let job_id = uuid::Uuid::new_v4().to_string();
    let scheduler = Scheduler::new(job_id.clone(), &req, &state.config.work_dir).map_err(|e| {
        warn!("job {} rechazado: {}", req.name, e);
        api_error(e)
    })?;

    let entry = JobEntry {
        request: req,
        submitted_at: Utc::now(),
        scheduler: Arc::new(scheduler),
    };
    let info = entry.info().map_err(api_error)?;

    state
        .jobs
        .lock()
        .map_err(|_| lock_error())?
        .insert(job_id.clone(), entry);

    info!(
        "job {} aceptado: {} entradas, {} reducers",
        job_id,
        info.inputs.len(),
        info.config.num_reducers
    );
    Ok(Json(info))
}

// Devuelve info de un job con su progreso
async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<JobInfo> {
    let jobs = state.jobs.lock().map_err(|_| lock_error())?;
    let job = jobs.get(&id).ok_or_else(|| not_found("job", &id))?;
    job.info().map(Json).map_err(api_error)
}

// Lista archivos de salida de un job ya publicado
async fn get_job_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<JobResults> {
    let scheduler = state.scheduler(&id).ok_or_else(|| not_found("job", &id))?;
    let progress = scheduler.progress().map_err(api_error)?;

    if progress.status != JobStatus::Succeeded {
        return Err((
            StatusCode::CONFLICT,
            format!("el job {} está en estado {:?}", id, progress.status),
        ));
    }

    Ok(Json(JobResults {
        job_id: id,
        output_dir: scheduler.output_dir().to_string_lossy().to_string(),
        files: progress.output_files,
    }))
}

// Cancela un job en curso
async fn abort_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<JobInfo> {
    let scheduler = state.scheduler(&id).ok_or_else(|| not_found("job", &id))?;
    if scheduler.abort().map_err(api_error)? {
        let mut in_flight = state.in_flight.lock().map_err(|_| lock_error())?;
        in_flight.retain(|key, _| key.job_id != id);
    }

    let jobs = state.jobs.lock().map_err(|_| lock_error())?;
    let job = jobs.get(&id).ok_or_else(|| not_found("job", &id))?;
    job.info().map(Json).map_err(api_error)
}

// Registra un worker nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> ApiResult<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();

    state
        .workers
        .lock()
        .map_err(|_| lock_error())?
        .insert(worker_id.clone(), WorkerMeta::new(req.hostname, req.max_concurrency));

    info!(
        "worker registrado: {} (max_concurrency={})",
        worker_id, req.max_concurrency
    );
    Ok(Json(WorkerRegisterResponse { worker_id }))
}

// Heartbeat de worker: refresca sus intentos en curso y devuelve los que
// ya no están vivos para que los abandone
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> ApiResult<WorkerHeartbeatResponse> {
    {
        let mut workers = state.workers.lock().map_err(|_| lock_error())?;
        let meta = workers
            .get_mut(&req.worker_id)
            .ok_or_else(|| not_found("worker", &req.worker_id))?;
        if meta.dead {
            info!("worker {} volvió a dar señales de vida", req.worker_id);
            meta.dead = false;
        }
        meta.last_heartbeat = SystemTime::now();
        meta.last_cpu_percent = req.cpu_percent;
        meta.last_mem_bytes = req.mem_bytes;
    }

    let mut cancelled = Vec::new();
    for running in req.attempts {
        let alive = match state.scheduler(&running.job_id) {
            Some(s) => s.report_heartbeat(&running.attempt).unwrap_or(false),
            None => false,
        };
        if !alive {
            debug!("intento {} ya no está vivo, se cancela", running.attempt);
            cancelled.push(running);
        }
    }

    // el worker abandona los cancelados sin reportarlos: liberar su cupo
    if !cancelled.is_empty() {
        let mut in_flight = state.in_flight.lock().map_err(|_| lock_error())?;
        for running in &cancelled {
            in_flight.remove(running);
        }
    }

    Ok(Json(WorkerHeartbeatResponse {
        ok: true,
        cancelled,
    }))
}

// Asigna el próximo intento disponible (jobs en orden de llegada)
async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> ApiResult<TaskAssignmentResponse> {
    // 1) Capacidad del worker contra sus intentos en vuelo
    let max_for_worker = {
        let workers = state.workers.lock().map_err(|_| lock_error())?;
        workers
            .get(&req.worker_id)
            .map(|m| m.max_concurrency)
            .ok_or_else(|| not_found("worker", &req.worker_id))?
    };
    let active_for_worker = {
        let in_flight = state.in_flight.lock().map_err(|_| lock_error())?;
        in_flight
            .values()
            .filter(|f| f.worker_id == req.worker_id)
            .count() as u32
    };
    if active_for_worker >= max_for_worker {
        debug!(
            "worker {} pidió tarea pero ya tiene {}/{} en vuelo",
            req.worker_id, active_for_worker, max_for_worker
        );
        return Ok(Json(TaskAssignmentResponse { task: None }));
    }

    // 2) Primer job con algo para hacer
    for scheduler in state.active_schedulers() {
        let Some(assignment) = scheduler.assign_next(&req.worker_id).map_err(api_error)? else {
            continue;
        };

        state.in_flight.lock().map_err(|_| lock_error())?.insert(
            RunningAttempt {
                job_id: assignment.job_id.clone(),
                attempt: assignment.attempt,
            },
            InFlight {
                attempt: assignment.attempt,
                worker_id: req.worker_id.clone(),
                started_at: SystemTime::now(),
            },
        );
        if let Some(meta) = state
            .workers
            .lock()
            .map_err(|_| lock_error())?
            .get_mut(&req.worker_id)
        {
            meta.tasks_started += 1;
        }

        return Ok(Json(TaskAssignmentResponse {
            task: Some(assignment),
        }));
    }

    Ok(Json(TaskAssignmentResponse { task: None }))
}

// Worker reporta el resultado de un intento
async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> ApiResult<TaskCompleteResponse> {
    let scheduler = state
        .scheduler(&req.job_id)
        .ok_or_else(|| not_found("job", &req.job_id))?;

    let key = RunningAttempt {
        job_id: req.job_id.clone(),
        attempt: req.attempt,
    };
    let inflight = state
        .in_flight
        .lock()
        .map_err(|_| lock_error())?
        .remove(&key);

    // ---- Métricas de worker: duración del intento ----
    if let Some(inflight) = &inflight {
        let duration_ms = inflight
            .started_at
            .elapsed()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut workers = state.workers.lock().map_err(|_| lock_error())?;
        if let Some(meta) = workers.get_mut(&inflight.worker_id) {
            meta.total_task_time_ms += duration_ms;
            if req.success {
                meta.tasks_succeeded += 1;
            } else {
                meta.tasks_failed += 1;
            }
        }
    }

    let outcome = if req.success {
        AttemptOutcome::Succeeded
    } else {
        AttemptOutcome::Failed(req.error.unwrap_or_else(|| "error desconocido".to_string()))
    };

    let result = scheduler
        .report_result(&req.attempt, outcome)
        .map_err(api_error)?;
    match result {
        ReportOutcome::JobCommitted => info!("job {} publicado", req.job_id),
        ReportOutcome::JobFailed => warn!("job {} falló", req.job_id),
        other => debug!("reporte de {}: {:?}", req.attempt, other),
    }

    Ok(Json(TaskCompleteResponse { ok: true }))
}

async fn list_workers(State(state): State<AppState>) -> ApiResult<Vec<WorkerMetrics>> {
    let now = SystemTime::now();

    // Contar intentos activos por worker (desde in_flight)
    let mut active_by_worker: HashMap<WorkerId, u32> = HashMap::new();
    {
        let in_flight = state.in_flight.lock().map_err(|_| lock_error())?;
        for inf in in_flight.values() {
            *active_by_worker.entry(inf.worker_id.clone()).or_insert(0) += 1;
        }
    }

    let workers = state.workers.lock().map_err(|_| lock_error())?;
    let mut out = Vec::new();

    for (wid, meta) in workers.iter() {
        let age_secs = now
            .duration_since(meta.last_heartbeat)
            .unwrap_or_default()
            .as_secs();

        let avg_ms = if meta.tasks_succeeded > 0 {
            Some(meta.total_task_time_ms as f64 / meta.tasks_succeeded as f64)
        } else {
            None
        };

        out.push(WorkerMetrics {
            worker_id: wid.clone(),
            hostname: meta.hostname.clone(),
            dead: meta.dead,
            max_concurrency: meta.max_concurrency,
            last_heartbeat_secs_ago: age_secs,
            active_tasks: active_by_worker.get(wid).copied().unwrap_or(0),
            tasks_started: meta.tasks_started,
            tasks_succeeded: meta.tasks_succeeded,
            tasks_failed: meta.tasks_failed,
            avg_task_ms: avg_ms,
            cpu_percent: meta.last_cpu_percent,
            mem_bytes: meta.last_mem_bytes,
        });
    }
    out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

    Ok(Json(out))
}
