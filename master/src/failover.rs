use std::collections::HashSet;
use std::time::{Instant, SystemTime};

use tokio::time::sleep;
use tracing::{info, warn};

use common::RunningAttempt;

use crate::state::AppState;

/// Loop principal de tolerancia a fallos:
/// - detecta workers muertos (sin heartbeat) y da por caídos sus intentos
/// - barre timeouts y especulación de cada job activo
pub async fn run_failover_loop(state: AppState) {
    loop {
        sleep(state.config.sweep_interval).await;

        if let Err(e) = sweep_once(&state) {
            warn!("error en failover sweep: {:?}", e);
        }
    }
}

/// Una pasada de chequeo:
/// 1. marca workers muertos
/// 2. reporta como timeout los intentos en vuelo de esos workers
/// 3. corre `sweep` en cada scheduler
/// 4. limpia in_flight de intentos expirados o de jobs terminados
pub fn sweep_once(state: &AppState) -> Result<(), String> {
    let now = SystemTime::now();

    // 1) Detectar qué workers están muertos
    let mut newly_dead: HashSet<String> = HashSet::new();
    {
        let mut workers = state.workers.lock().map_err(|_| "lock workers")?;

        for (worker_id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            let Ok(elapsed) = now.duration_since(meta.last_heartbeat) else {
                // last_heartbeat en el futuro? raro, lo ignoramos.
                continue;
            };
            if elapsed > state.config.worker_dead_timeout {
                meta.dead = true;
                newly_dead.insert(worker_id.clone());
                warn!(
                    "marcando worker {} como DEAD (sin heartbeat hace {:?})",
                    worker_id, elapsed
                );
            }
        }
    }

    // 2) Sacar de in_flight los intentos de esos workers
    let mut orphaned: Vec<RunningAttempt> = Vec::new();
    if !newly_dead.is_empty() {
        let mut in_flight = state.in_flight.lock().map_err(|_| "lock in_flight")?;
        in_flight.retain(|key, inflight| {
            if newly_dead.contains(&inflight.worker_id) {
                orphaned.push(key.clone());
                false
            } else {
                true
            }
        });
    }

    for key in orphaned {
        let Some(scheduler) = state.scheduler(&key.job_id) else {
            continue;
        };
        info!(
            "intento {} del job {} perdido por caída de su worker",
            key.attempt, key.job_id
        );
        if let Err(e) = scheduler.report_timeout(&key.attempt) {
            warn!("no se pudo reportar timeout de {}: {}", key.attempt, e);
        }
    }

    // 3) Timeouts por heartbeat de intento y especulación
    let mut expired: HashSet<RunningAttempt> = HashSet::new();
    for scheduler in state.active_schedulers() {
        match scheduler.sweep(Instant::now()) {
            Ok(report) => {
                for attempt in report.timed_out {
                    expired.insert(RunningAttempt {
                        job_id: scheduler.job_id().to_string(),
                        attempt,
                    });
                }
            }
            Err(e) => warn!("sweep del job {} falló: {}", scheduler.job_id(), e),
        }
    }

    // 4) Intentos de jobs ya terminados nunca van a reportar
    let finished: HashSet<String> = {
        let jobs = state.jobs.lock().map_err(|_| "lock jobs")?;
        jobs.iter()
            .filter(|(_, entry)| entry.scheduler.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    };

    if !expired.is_empty() || !finished.is_empty() {
        let mut in_flight = state.in_flight.lock().map_err(|_| "lock in_flight")?;
        in_flight.retain(|key, _| !expired.contains(key) && !finished.contains(&key.job_id));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InFlight, JobEntry, MasterConfig, WorkerMeta};
    use chrono::Utc;
    use common::{JobConfig, JobRequest, JobStatus, Scheduler};
    use std::{fs, path::PathBuf, sync::Arc, time::Duration};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("failover_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn worker_muerto_devuelve_su_tarea_a_pending() {
        let tmp = temp_dir("worker_muerto");
        let input = tmp.join("in.txt");
        fs::write(&input, "a b\n").unwrap();

        let state = AppState::new(MasterConfig {
            bind_addr: "127.0.0.1:0".into(),
            work_dir: tmp.join("work"),
            sweep_interval: Duration::from_millis(10),
            worker_dead_timeout: Duration::from_secs(5),
        });
        let request = JobRequest {
            name: "wc".into(),
            inputs: vec![input.to_string_lossy().to_string()],
            output_dir: tmp.join("out").to_string_lossy().to_string(),
            functions: "wordcount".into(),
            config: JobConfig::default(),
        };
        let scheduler = Arc::new(Scheduler::new("job".into(), &request, &tmp.join("work")).unwrap());
        state.jobs.lock().unwrap().insert(
            "job".into(),
            JobEntry {
                request,
                submitted_at: Utc::now(),
                scheduler: scheduler.clone(),
            },
        );

        let mut meta = WorkerMeta::new("host".into(), 1);
        meta.last_heartbeat = SystemTime::now() - Duration::from_secs(60);
        state.workers.lock().unwrap().insert("w1".into(), meta);

        let assignment = scheduler.assign_next(&"w1".to_string()).unwrap().unwrap();
        state.in_flight.lock().unwrap().insert(
            RunningAttempt {
                job_id: "job".into(),
                attempt: assignment.attempt,
            },
            InFlight {
                attempt: assignment.attempt,
                worker_id: "w1".into(),
                started_at: SystemTime::now(),
            },
        );

        sweep_once(&state).unwrap();

        assert!(state.workers.lock().unwrap()["w1"].dead);
        assert!(state.in_flight.lock().unwrap().is_empty());
        let progress = scheduler.progress().unwrap();
        assert_eq!(progress.status, JobStatus::Running);
        assert_eq!(progress.pending, 1);
        assert_eq!(progress.counters.attempts_timed_out, 1);

        // la tarea vuelve a asignarse con un intento nuevo
        let retry = scheduler.assign_next(&"w2".to_string()).unwrap().unwrap();
        assert_eq!(retry.attempt.attempt, 1);
    }

    #[test]
    fn sweep_libera_intentos_de_jobs_terminados() {
        let tmp = temp_dir("job_terminado");
        let input = tmp.join("in.txt");
        fs::write(&input, "a b\n").unwrap();

        let state = AppState::new(MasterConfig {
            bind_addr: "127.0.0.1:0".into(),
            work_dir: tmp.join("work"),
            sweep_interval: Duration::from_millis(10),
            worker_dead_timeout: Duration::from_secs(60),
        });
        let request = JobRequest {
            name: "wc".into(),
            inputs: vec![input.to_string_lossy().to_string()],
            output_dir: tmp.join("out").to_string_lossy().to_string(),
            functions: "wordcount".into(),
            config: JobConfig::default(),
        };
        let scheduler = Arc::new(Scheduler::new("job".into(), &request, &tmp.join("work")).unwrap());
        state.jobs.lock().unwrap().insert(
            "job".into(),
            JobEntry {
                request,
                submitted_at: Utc::now(),
                scheduler: scheduler.clone(),
            },
        );
        state
            .workers
            .lock()
            .unwrap()
            .insert("w1".into(), WorkerMeta::new("host".into(), 1));

        let assignment = scheduler.assign_next(&"w1".to_string()).unwrap().unwrap();
        state.in_flight.lock().unwrap().insert(
            RunningAttempt {
                job_id: "job".into(),
                attempt: assignment.attempt,
            },
            InFlight {
                attempt: assignment.attempt,
                worker_id: "w1".into(),
                started_at: SystemTime::now(),
            },
        );

        // el job termina sin que el worker reporte su intento
        assert!(scheduler.abort().unwrap());
        sweep_once(&state).unwrap();

        assert!(!state.workers.lock().unwrap()["w1"].dead);
        assert!(state.in_flight.lock().unwrap().is_empty());
    }
}
