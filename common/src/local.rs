use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::time::{interval, sleep};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::exec::execute_with;
use crate::job::{JobReport, JobRequest, JobSpec};
use crate::record::JobFunctions;
use crate::scheduler::{AttemptOutcome, Scheduler};
use crate::worker::WorkerId;

const DEFAULT_TICK: Duration = Duration::from_millis(20);

/// Ejecuta un job completo dentro del proceso con N workers simulados.
///
/// Cada worker es una tarea tokio que pide intentos al `Scheduler`, los
/// corre en `spawn_blocking` y manda heartbeats mientras tanto; otra tarea
/// hace el barrido de timeouts y especulación.
pub struct LocalRunner {
    work_dir: PathBuf,
    workers: usize,
    tick: Duration,
}

impl LocalRunner {
    pub fn new(work_dir: impl Into<PathBuf>, workers: usize) -> Self {
        Self {
            work_dir: work_dir.into(),
            workers: workers.max(1),
            tick: DEFAULT_TICK,
        }
    }

    /// Periodo de polling, heartbeats y barrido.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Corre el job hasta que termine. Sólo devuelve `Err` si el job no se
    /// pudo aceptar (configuración inválida, entradas inexistentes, salida
    /// ya existente); un job fallido es un `JobReport` con su causa.
    pub async fn run(&self, spec: JobSpec) -> Result<JobReport> {
        let job_id = Uuid::new_v4().to_string();
        let request = JobRequest {
            name: spec.name.clone(),
            inputs: spec.inputs.clone(),
            output_dir: spec.output_dir.clone(),
            functions: spec.functions.name.clone(),
            config: spec.config.clone(),
        };
        let scheduler = Arc::new(Scheduler::new(job_id.clone(), &request, &self.work_dir)?);
        let functions = Arc::new(spec.functions);

        info!("job local {} ({}) con {} workers", job_id, spec.name, self.workers);

        let mut handles = Vec::with_capacity(self.workers);
        for i in 0..self.workers {
            handles.push(tokio::spawn(worker_loop(
                scheduler.clone(),
                functions.clone(),
                format!("local-{i}"),
                self.tick,
            )));
        }

        let sweeper = tokio::spawn(sweep_loop(scheduler.clone(), self.tick));

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("worker local terminó con error: {:?}", e);
            }
        }
        sweeper.abort();

        let report = scheduler.report()?;
        info!("job local {} terminó: {:?}", job_id, report.status);
        Ok(report)
    }
}

async fn worker_loop(
    scheduler: Arc<Scheduler>,
    functions: Arc<JobFunctions>,
    worker_id: WorkerId,
    tick: Duration,
) {
    while !scheduler.is_finished() {
        let assignment = match scheduler.assign_next(&worker_id) {
            Ok(Some(a)) => a,
            Ok(None) => {
                sleep(tick).await;
                continue;
            }
            Err(e) => {
                warn!("{}: error pidiendo tarea: {}", worker_id, e);
                sleep(tick).await;
                continue;
            }
        };
        let attempt = assignment.attempt;

        // heartbeats mientras el intento corre
        let hb_scheduler = scheduler.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                ticker.tick().await;
                match hb_scheduler.report_heartbeat(&attempt) {
                    Ok(true) => {}
                    _ => break,
                }
            }
        });

        let f = functions.clone();
        let result = tokio::task::spawn_blocking(move || execute_with(&assignment, &f)).await;
        heartbeat.abort();

        let outcome = match result {
            Ok(Ok(())) => AttemptOutcome::Succeeded,
            Ok(Err(e)) => AttemptOutcome::Failed(e.to_string()),
            Err(e) => AttemptOutcome::Failed(format!("el intento entró en pánico: {e}")),
        };

        if let Err(e) = scheduler.report_result(&attempt, outcome) {
            warn!("{}: no se pudo reportar {}: {}", worker_id, attempt, e);
        }
    }
}

async fn sweep_loop(scheduler: Arc<Scheduler>, tick: Duration) {
    let mut ticker = interval(tick);
    loop {
        ticker.tick().await;
        if scheduler.is_finished() {
            break;
        }
        if let Err(e) = scheduler.sweep(Instant::now()) {
            warn!("barrido del job {} falló: {}", scheduler.job_id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use crate::error::MrError;
    use crate::job::JobStatus;
    use crate::layout::SUCCESS_MARKER;
    use crate::record::{KeyValue, MapFn, ReduceFn};
    use crate::wordcount::{int_sum_reduce, tokenize_map, wordcount_functions};
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("local_runner_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn write_inputs(dir: &PathBuf, texts: &[&str]) -> Vec<String> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let p = dir.join(format!("in-{i}.txt"));
                fs::write(&p, t).unwrap();
                p.to_string_lossy().to_string()
            })
            .collect()
    }

    fn read_counts(out: &PathBuf) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for entry in fs::read_dir(out).unwrap() {
            let path = entry.unwrap().path();
            if path.file_name().unwrap() == SUCCESS_MARKER {
                continue;
            }
            for line in fs::read_to_string(&path).unwrap().lines() {
                let (word, n) = line.split_once('\t').unwrap();
                assert!(
                    counts.insert(word.to_string(), n.parse().unwrap()).is_none(),
                    "clave {word} repetida en la salida"
                );
            }
        }
        counts
    }

    fn spec(tmp: &PathBuf, inputs: Vec<String>, functions: JobFunctions, config: JobConfig) -> JobSpec {
        JobSpec {
            name: "test".into(),
            inputs,
            output_dir: tmp.join("out").to_string_lossy().to_string(),
            functions,
            config,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wordcount_de_tres_splits() {
        let tmp = temp_dir("wordcount");
        let inputs = write_inputs(&tmp, &["a b a", "b c", "a c c"]);
        let config = JobConfig {
            num_reducers: 2,
            ..JobConfig::default()
        };

        let report = LocalRunner::new(tmp.join("work"), 3)
            .run(spec(&tmp, inputs, wordcount_functions(), config))
            .await
            .unwrap();

        assert!(report.succeeded(), "{:?}", report);
        assert_eq!(report.counters.map_tasks, 3);
        assert_eq!(report.counters.reduce_tasks, 2);
        assert_eq!(report.files, vec!["part-r-00000".to_string(), "part-r-00001".to_string()]);

        let out = tmp.join("out");
        assert!(out.join(SUCCESS_MARKER).exists());
        let expected: BTreeMap<String, u64> =
            [("a", 3), ("b", 2), ("c", 3)].iter().map(|(k, v)| (k.to_string(), *v)).collect();
        assert_eq!(read_counts(&out), expected);
        assert!(!tmp.join("work").join(&report.job_id).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fallo_transitorio_se_reintenta() {
        let tmp = temp_dir("reintento");
        let inputs = write_inputs(&tmp, &["x y x\n"]);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mapper: MapFn = Arc::new(move |k: &[u8], v: &[u8]| -> Vec<KeyValue> {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("fallo transitorio");
            }
            tokenize_map(k, v)
        });
        let sum: ReduceFn = Arc::new(int_sum_reduce);
        let functions = JobFunctions {
            name: "flaky".into(),
            mapper,
            reducer: sum,
            combiner: None,
        };

        let report = LocalRunner::new(tmp.join("work"), 1)
            .run(spec(&tmp, inputs, functions, JobConfig::default()))
            .await
            .unwrap();

        assert!(report.succeeded(), "{:?}", report);
        assert_eq!(report.counters.attempts_failed, 1);
        let counts = read_counts(&tmp.join("out"));
        assert_eq!(counts.get("x"), Some(&2));
        assert_eq!(counts.get("y"), Some(&1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reduce_que_siempre_falla_agota_intentos() {
        let tmp = temp_dir("agotado");
        let inputs = write_inputs(&tmp, &["a\n"]);
        let reducer: ReduceFn = Arc::new(|_: &[u8], _: &[Vec<u8>]| -> Vec<KeyValue> {
            panic!("reduce roto");
        });
        let functions = JobFunctions {
            name: "roto".into(),
            mapper: Arc::new(tokenize_map),
            reducer,
            combiner: None,
        };
        let config = JobConfig {
            max_attempts: 2,
            ..JobConfig::default()
        };

        let report = LocalRunner::new(tmp.join("work"), 2)
            .run(spec(&tmp, inputs, functions, config))
            .await
            .unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert!(!tmp.join("out").exists());
        match report.into_result() {
            Err(MrError::TaskExhausted { task, attempts, .. }) => {
                assert_eq!(task.to_string(), "r_000000");
                assert_eq!(attempts, 2);
            }
            other => panic!("esperaba TaskExhausted: {:?}", other),
        }
    }

    #[tokio::test]
    async fn salida_existente_es_config_error() {
        let tmp = temp_dir("salida_existente");
        let inputs = write_inputs(&tmp, &["a\n"]);
        fs::create_dir_all(tmp.join("out")).unwrap();

        let err = LocalRunner::new(tmp.join("work"), 1)
            .run(spec(&tmp, inputs, wordcount_functions(), JobConfig::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, MrError::Config(_)));
    }
}
