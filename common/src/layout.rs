use std::path::{Path, PathBuf};

use crate::task::{AttemptId, TaskId};

/// Rutas de un job dentro del directorio de trabajo compartido:
///
/// ```text
/// <work_dir>/<job_id>/_staging/<attempt>/part-00002.jsonl   salida privada de un map
/// <work_dir>/<job_id>/_staging/<attempt>/part-r-00001       salida privada de un reduce
/// <work_dir>/<job_id>/committed/<task>/...                  salida promovida
/// ```
#[derive(Debug, Clone)]
pub struct JobLayout {
    root: PathBuf,
}

impl JobLayout {
    pub fn new(work_dir: impl AsRef<Path>, job_id: &str) -> Self {
        Self {
            root: work_dir.as_ref().join(job_id),
        }
    }

    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join("_staging")
    }

    pub fn staging_dir(&self, attempt: &AttemptId) -> PathBuf {
        self.staging_root().join(attempt.to_string())
    }

    pub fn committed_root(&self) -> PathBuf {
        self.root.join("committed")
    }

    pub fn committed_dir(&self, task: &TaskId) -> PathBuf {
        self.committed_root().join(task.to_string())
    }
}

pub fn partition_file_name(partition: u32) -> String {
    format!("part-{:05}.jsonl", partition)
}

pub fn reduce_output_file_name(partition: u32) -> String {
    format!("part-r-{:05}", partition)
}

pub const SUCCESS_MARKER: &str = "_SUCCESS";
