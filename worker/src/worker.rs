use anyhow::Result;
use common::{
    env_or, exec, Assignment, AttemptId, JobId, MrError, RunningAttempt, TaskAssignmentRequest,
    TaskAssignmentResponse, TaskCompleteRequest, WorkerHeartbeatRequest, WorkerHeartbeatResponse,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
use reqwest::Client;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;

/// Parámetros del proceso worker, leídos del entorno.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// En Docker: MASTER_URL=http://master:8080
    pub base_url: String,
    pub max_concurrency: u32,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    /// Tope por request al master (WORKER_REQUEST_TIMEOUT_MS).
    pub request_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_env() -> Self {
        Self {
            base_url: env_or("MASTER_URL", "http://localhost:8080".to_string()),
            max_concurrency: env_or("WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY).max(1),
            heartbeat_interval: Duration::from_millis(env_or("WORKER_HEARTBEAT_MS", 2_000u64)),
            poll_interval: Duration::from_millis(env_or("WORKER_POLL_MS", 500u64)),
            request_timeout: Duration::from_millis(
                env_or("WORKER_REQUEST_TIMEOUT_MS", 10_000u64).max(1),
            ),
        }
    }

    pub fn http_client(&self) -> reqwest::Result<Client> {
        Client::builder()
            .timeout(self.request_timeout)
            .connect_timeout(self.request_timeout)
            .build()
    }
}

/// Intentos en curso y los que el master ya dio por perdidos.
#[derive(Default)]
struct Running {
    attempts: HashSet<RunningAttempt>,
    cancelled: HashSet<RunningAttempt>,
}

/// Loop principal del worker.
/// - Se registra en el master.
/// - Hace heartbeats periódicos con sus intentos en curso.
/// - Pide tareas mientras tenga "slots" libres.
/// - Ejecuta cada intento en `spawn_blocking` (hasta WORKER_CONCURRENCY).
pub async fn run(settings: WorkerSettings) -> Result<()> {
    let client = settings.http_client()?;
    let base_url = settings.base_url.clone();

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    // Registro de worker (enviando max_concurrency)
    let register_url = format!("{}/api/v1/workers/register", base_url);
    let res = client
        .post(&register_url)
        .json(&WorkerRegisterRequest {
            hostname,
            max_concurrency: settings.max_concurrency,
        })
        .send()
        .await?
        .error_for_status()?;
    let WorkerRegisterResponse { worker_id } = res.json().await?;

    info!(
        "worker {} registrado con concurrency={} contra {}",
        worker_id, settings.max_concurrency, base_url
    );

    let running = Arc::new(Mutex::new(Running::default()));

    tokio::spawn(heartbeat_loop(
        client.clone(),
        base_url.clone(),
        worker_id.clone(),
        running.clone(),
        settings.heartbeat_interval,
    ));

    let sem = Arc::new(Semaphore::new(settings.max_concurrency as usize));

    loop {
        // --------- Control de concurrencia local ---------
        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                sleep(settings.poll_interval).await;
                continue;
            }
        };

        // Pedimos tarea al master
        let assign_url = format!("{}/api/v1/tasks/next", base_url);
        let assignment = match client
            .post(&assign_url)
            .json(&TaskAssignmentRequest {
                worker_id: worker_id.clone(),
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(resp) => resp.json::<TaskAssignmentResponse>().await.ok().and_then(|r| r.task),
            Err(e) => {
                warn!("error HTTP pidiendo tarea: {:?}", e);
                None
            }
        };

        let Some(assignment) = assignment else {
            // No hay tarea: devolvemos el permiso y dormimos
            drop(permit);
            debug!("worker {} pidió tarea pero no hay", worker_id);
            sleep(settings.poll_interval).await;
            continue;
        };

        info!(
            "tengo intento {} del job {}{}",
            assignment.attempt,
            assignment.job_id,
            if assignment.speculative { " (especulativo)" } else { "" }
        );

        let key = assignment_key(&assignment);
        if let Ok(mut r) = running.lock() {
            r.attempts.insert(key.clone());
        }

        let client_cloned = client.clone();
        let base_url_cloned = base_url.clone();
        let running_cloned = running.clone();

        tokio::spawn(async move {
            let job_id = assignment.job_id.clone();
            let attempt = assignment.attempt;

            // 1) Ejecutar el intento en un hilo de bloqueo
            let result = match tokio::task::spawn_blocking(move || exec::execute(&assignment)).await {
                Ok(r) => r,
                Err(e) => Err(MrError::TaskAttemptFailure {
                    attempt,
                    reason: format!("panic o join error: {e}"),
                }),
            };

            // 2) Si el master ya lo canceló, no hay nada que reportar
            let cancelled = match running_cloned.lock() {
                Ok(mut r) => {
                    r.attempts.remove(&key);
                    r.cancelled.remove(&key)
                }
                Err(_) => false,
            };
            if cancelled {
                info!("intento {} cancelado por el master, se descarta", attempt);
                drop(permit);
                return;
            }

            // 3) Reportar al master que terminamos
            let complete_url = format!("{}/api/v1/tasks/complete", base_url_cloned);
            let req = completion(job_id, attempt, result);
            if let Err(e) = client_cloned.post(&complete_url).json(&req).send().await {
                warn!("no se pudo reportar {}: {:?}", attempt, e);
            }

            // 4) Liberar el "slot" de concurrencia al terminar
            drop(permit);
        });
    }
}

/// Heartbeat al master con CPU/MEM y los intentos en curso. Los que el
/// master devuelve como cancelados se marcan para no reportarlos.
async fn heartbeat_loop(
    client: Client,
    base_url: String,
    worker_id: String,
    running: Arc<Mutex<Running>>,
    interval: Duration,
) {
    let hb_url = format!("{}/api/v1/workers/heartbeat", base_url);
    let mut sys = System::new_all();

    loop {
        sys.refresh_cpu();
        sys.refresh_memory();
        let cpu_percent = sys.global_cpu_info().cpu_usage();
        let mem_bytes = sys.used_memory();

        let attempts: Vec<RunningAttempt> = running
            .lock()
            .map(|r| r.attempts.iter().cloned().collect())
            .unwrap_or_default();

        let resp = client
            .post(&hb_url)
            .json(&WorkerHeartbeatRequest {
                worker_id: worker_id.clone(),
                attempts,
                cpu_percent: Some(cpu_percent),
                mem_bytes: Some(mem_bytes),
            })
            .send()
            .await;

        match resp {
            Ok(r) => {
                if let Ok(hb) = r.json::<WorkerHeartbeatResponse>().await {
                    if !hb.cancelled.is_empty() {
                        if let Ok(mut r) = running.lock() {
                            for c in hb.cancelled {
                                warn!("el master canceló el intento {}", c.attempt);
                                r.cancelled.insert(c);
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("heartbeat falló: {:?}", e),
        }

        sleep(interval).await;
    }
}

/// Arma el reporte final de un intento.
fn completion(job_id: JobId, attempt: AttemptId, result: common::Result<()>) -> TaskCompleteRequest {
    match result {
        Ok(()) => TaskCompleteRequest {
            job_id,
            attempt,
            success: true,
            error: None,
        },
        Err(e) => {
            warn!("error procesando intento {}: {}", attempt, e);
            TaskCompleteRequest {
                job_id,
                attempt,
                success: false,
                error: Some(e.to_string()),
            }
        }
    }
}

fn assignment_key(a: &Assignment) -> RunningAttempt {
    RunningAttempt {
        job_id: a.job_id.clone(),
        attempt: a.attempt,
    }
}
