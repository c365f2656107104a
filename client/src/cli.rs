use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use common::{
    functions_by_name, env_or, JobConfig, JobInfo, JobReport, JobRequest, JobResults, JobSpec,
    LocalRunner, SpeculationConfig, WorkerMetrics,
};
use reqwest::Client;

/// Igual que en el worker:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env_or("MASTER_URL", "http://localhost:8080".to_string())
}

#[derive(Parser, Debug)]
#[command(name = "mr-client")]
#[command(about = "CLI para enviar y seguir jobs map-reduce")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Parámetros de job comunes a `submit` y `run`.
#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Archivos o patrones glob de entrada seguidos del directorio de salida
    #[arg(value_name = "ENTRADA... SALIDA", num_args = 2.., required = true)]
    pub paths: Vec<String>,

    /// Cantidad de particiones / tareas reduce
    #[arg(long, default_value_t = 1)]
    pub reducers: u32,

    /// Tamaño de split en bytes
    #[arg(long, default_value_t = common::config::DEFAULT_SPLIT_SIZE)]
    pub split_size: u64,

    /// Fallos permitidos por tarea
    #[arg(long, default_value_t = common::config::DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Activa la ejecución especulativa de stragglers
    #[arg(long)]
    pub speculate: bool,

    /// Funciones del registro
    #[arg(long, default_value = "wordcount")]
    pub functions: String,

    #[arg(long, default_value = "wordcount")]
    pub name: String,
}

impl JobArgs {
    /// Separa las entradas de la salida (el último path).
    pub fn split_paths(&self) -> Result<(Vec<String>, String)> {
        let Some((output, inputs)) = self.paths.split_last() else {
            bail!("faltan entradas y salida");
        };
        if inputs.is_empty() {
            bail!("se necesita al menos una entrada además de la salida");
        }
        Ok((inputs.to_vec(), output.clone()))
    }

    pub fn config(&self) -> JobConfig {
        JobConfig {
            split_size: self.split_size,
            num_reducers: self.reducers,
            max_attempts: self.max_attempts,
            speculation: self.speculate.then(SpeculationConfig::default),
            ..JobConfig::default()
        }
    }

    pub fn request(&self) -> Result<JobRequest> {
        let (inputs, output_dir) = self.split_paths()?;
        Ok(JobRequest {
            name: self.name.clone(),
            inputs,
            output_dir,
            functions: self.functions.clone(),
            config: self.config(),
        })
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Envía un job al master
    Submit(JobArgs),
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los archivos de salida de un job
    Results {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los workers y sus métricas
    Workers,
    /// Cancela un job en curso
    Abort {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Corre un job completo en este proceso, sin master
    Run {
        #[command(flatten)]
        job: JobArgs,

        /// Workers simulados
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Directorio de trabajo intermedio
        #[arg(long, default_value = "/tmp/mr-work")]
        work_dir: String,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit(args) => {
            let url = format!("{}/api/v1/jobs", base_url);
            let req = args.request()?;

            let resp = client.post(&url).json(&req).send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!("el master rechazó el job ({}): {}", status, body);
            }
            let job_info: JobInfo = resp.json().await?;

            println!("Job creado:");
            println!("  id: {}", job_info.id);
            println!("  nombre: {}", job_info.name);
            println!("  estado: {:?}", job_info.status);
            println!("  entradas: {}", job_info.inputs.join(", "));
            println!("  reducers: {}", job_info.config.num_reducers);
            println!("  output_dir: {}", job_info.output_dir);
            println!("  submitted_at: {}", job_info.submitted_at);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/jobs/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let job: JobInfo = resp.json().await?;
                print_job(&job);
            } else {
                println!("Error: job no encontrado (status {})", resp.status());
            }
        }

        Commands::Results { id } => {
            let url = format!("{}/api/v1/jobs/{id}/results", base_url);
            let resp = client.get(&url).send().await?;

            if resp.status().is_success() {
                let results: JobResults = resp.json().await?;
                println!("Resultados para job {}:", results.job_id);
                println!("  directorio de salida: {}", results.output_dir);
                if results.files.is_empty() {
                    println!("  (sin archivos de salida)");
                } else {
                    println!("  archivos:");
                    for f in results.files {
                        println!("    - {}", f);
                    }
                }
            } else {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                println!("No hay resultados para job {id} ({status}): {body}");
            }
        }

        Commands::Abort { id } => {
            let url = format!("{}/api/v1/jobs/{id}/abort", base_url);
            let resp = client.post(&url).send().await?;
            if resp.status().is_success() {
                let job: JobInfo = resp.json().await?;
                println!("Job {} -> {:?}", job.id, job.status);
            } else {
                println!("No se pudo abortar el job {id} (status {})", resp.status());
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let workers: Vec<WorkerMetrics> = resp.json().await?;
                if workers.is_empty() {
                    println!("No hay workers registrados.");
                }
                for w in workers {
                    print_worker(&w);
                }
            } else {
                println!(
                    "Error consultando /api/v1/workers (status {})",
                    resp.status()
                );
            }
        }

        Commands::Run {
            job,
            workers,
            work_dir,
        } => {
            let req = job.request()?;
            let functions = functions_by_name(&req.functions)
                .with_context(|| format!("funciones desconocidas: {}", req.functions))?;
            let spec = JobSpec {
                name: req.name,
                inputs: req.inputs,
                output_dir: req.output_dir,
                functions,
                config: req.config,
            };

            let report = LocalRunner::new(&work_dir, workers).run(spec).await?;
            print_report(&report);
            if !report.succeeded() {
                return Err(report.into_result().err().map(anyhow::Error::from).unwrap_or_else(
                    || anyhow::anyhow!("el job no terminó correctamente"),
                ));
            }
        }
    }

    Ok(())
}

fn print_job(job: &JobInfo) {
    println!("Job:");
    println!("  id: {}", job.id);
    println!("  nombre: {}", job.name);
    println!("  estado: {:?}", job.status);

    // métricas de tareas
    let c = &job.counters;
    println!(
        "  tareas: maps={}, reduces={}, completadas={}",
        c.map_tasks, c.reduce_tasks, c.completed_tasks
    );
    println!(
        "  intentos: lanzados={}, fallidos={}, timeouts={}, especulativos={}, duplicados={}",
        c.attempts_launched,
        c.attempts_failed,
        c.attempts_timed_out,
        c.speculative_attempts,
        c.duplicate_successes
    );

    // progreso calculado localmente
    let total = c.map_tasks + c.reduce_tasks;
    if total > 0 {
        let pct = (c.completed_tasks as f64 / total as f64) * 100.0;
        println!("  progreso: {:.1}%", pct);
    } else {
        println!("  progreso: (sin tareas)");
    }

    println!("  output_dir: {}", job.output_dir);
    println!("  submitted_at: {}", job.submitted_at);
    if let Some(ref started) = job.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(ref done) = job.finished_at {
        println!("  finalizado: {}", done);
    }
    if let Some(ref failure) = job.failure {
        match failure.task {
            Some(task) => println!(
                "  falló la tarea {} tras {} intentos: {}",
                task, failure.attempts, failure.last_error
            ),
            None => println!("  falló: {}", failure.last_error),
        }
    }
}

fn print_worker(w: &WorkerMetrics) {
    println!("Worker {}", w.worker_id);
    println!("  host           : {}", w.hostname);
    println!("  dead           : {}", w.dead);
    println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
    println!(
        "  concurrency    : max={}, activos={}",
        w.max_concurrency, w.active_tasks
    );
    println!(
        "  tareas         : started={}, ok={}, failed={}",
        w.tasks_started, w.tasks_succeeded, w.tasks_failed
    );
    match w.avg_task_ms {
        Some(avg) => println!("  avg_task_ms    : {:.1}", avg),
        None => println!("  avg_task_ms    : (sin datos)"),
    }
    match w.cpu_percent {
        Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
        None => println!("  cpu_percent    : (sin datos)"),
    }
    match w.mem_bytes {
        Some(mem) => println!("  mem_bytes      : {}", mem),
        None => println!("  mem_bytes      : (sin datos)"),
    }
    println!();
}

fn print_report(report: &JobReport) {
    println!("Job {} -> {:?}", report.job_id, report.status);
    println!(
        "  tareas: maps={}, reduces={}, intentos={}, fallidos={}",
        report.counters.map_tasks,
        report.counters.reduce_tasks,
        report.counters.attempts_launched,
        report.counters.attempts_failed
    );
    println!("  output_dir: {}", report.output_dir);
    for f in &report.files {
        println!("    - {}", f);
    }
}
