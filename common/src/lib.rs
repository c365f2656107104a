//! Núcleo del motor map-reduce: planificación de splits, particionado,
//! ledger de tareas, scheduler, shuffle y commit. También define los tipos
//! que viajan entre master, workers y cliente.

pub mod commit;
pub mod config;
pub mod error;
pub mod exec;
pub mod input;
pub mod job;
pub mod layout;
pub mod ledger;
pub mod local;
pub mod partition;
pub mod record;
pub mod scheduler;
pub mod shuffle;
pub mod split;
pub mod task;
pub mod wordcount;
pub mod worker;

pub use commit::CommitCoordinator;
pub use config::{env_or, JobConfig, SpeculationConfig};
pub use error::{MrError, Result};
pub use job::{
    JobCounters, JobFailure, JobId, JobInfo, JobReport, JobRequest, JobResults, JobSpec, JobStatus,
};
pub use layout::JobLayout;
pub use ledger::TaskLedger;
pub use local::LocalRunner;
pub use partition::{HashPartitioner, Partitioner};
pub use record::{JobFunctions, KeyValue, MapFn, ReduceFn};
pub use scheduler::{AttemptOutcome, Progress, ReportOutcome, Scheduler, SweepReport};
pub use shuffle::{ShuffleLocation, ShuffleStore};
pub use split::Split;
pub use task::{AttemptId, TaskId, TaskKind, TaskState};
pub use wordcount::functions_by_name;
pub use worker::{
    Assignment, AssignmentInput, RunningAttempt, TaskAssignmentRequest, TaskAssignmentResponse,
    TaskCompleteRequest, TaskCompleteResponse, WorkerHeartbeatRequest, WorkerHeartbeatResponse,
    WorkerId, WorkerMetrics, WorkerRegisterRequest, WorkerRegisterResponse,
};
