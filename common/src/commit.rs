use std::{
    collections::HashMap,
    fs,
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, info, warn};

use crate::error::{MrError, Result};
use crate::layout::{JobLayout, SUCCESS_MARKER};
use crate::task::{AttemptId, TaskId, TaskKind};

#[derive(Default)]
struct CommitState {
    winners: HashMap<TaskId, AttemptId>,
    job_committed: bool,
}

/// Hace visible exactamente un intento por tarea.
///
/// Cada intento escribe en `_staging/<attempt>/`; `promote` renombra ese
/// directorio a `committed/<task>/` bajo el lock, así que si dos intentos
/// compiten sólo uno gana y el otro recibe `AlreadyCommitted`.
pub struct CommitCoordinator {
    layout: JobLayout,
    state: Mutex<CommitState>,
}

impl CommitCoordinator {
    pub fn new(layout: JobLayout) -> Self {
        Self {
            layout,
            state: Mutex::new(CommitState::default()),
        }
    }

    pub fn layout(&self) -> &JobLayout {
        &self.layout
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CommitState>> {
        self.state
            .lock()
            .map_err(|_| MrError::store("lock de commits envenenado"))
    }

    /// Promueve la salida en staging de `attempt`. Devuelve el directorio
    /// visible resultante.
    pub fn promote(&self, attempt: &AttemptId) -> Result<PathBuf> {
        let mut state = self.lock()?;

        if let Some(winner) = state.winners.get(&attempt.task) {
            return Err(MrError::AlreadyCommitted {
                task: attempt.task,
                winner: *winner,
            });
        }

        let staged = self.layout.staging_dir(attempt);
        if !staged.is_dir() {
            return Err(MrError::store(format!(
                "no hay salida en staging para {} ({})",
                attempt,
                staged.display()
            )));
        }

        let target = self.layout.committed_dir(&attempt.task);
        fs::create_dir_all(self.layout.committed_root())?;
        fs::rename(&staged, &target)?;

        state.winners.insert(attempt.task, *attempt);
        info!("intento {} promovido a {}", attempt, target.display());
        Ok(target)
    }

    /// Descarta la salida en staging de un intento perdedor o abandonado.
    pub fn discard(&self, attempt: &AttemptId) {
        let staged = self.layout.staging_dir(attempt);
        match fs::remove_dir_all(&staged) {
            Ok(()) => debug!("staging de {} descartado", attempt),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("no se pudo borrar staging de {}: {:?}", attempt, e),
        }
    }

    pub fn committed_attempt(&self, task: &TaskId) -> Option<AttemptId> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.winners.get(task).copied())
    }

    /// Tareas de un tipo ya promovidas, ordenadas por índice.
    pub fn committed_tasks(&self, kind: TaskKind) -> Vec<(TaskId, AttemptId)> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut out: Vec<(TaskId, AttemptId)> = state
            .winners
            .iter()
            .filter(|(t, _)| t.kind == kind)
            .map(|(t, a)| (*t, *a))
            .collect();
        out.sort();
        out
    }

    /// Commit del job: junta las salidas de todos los reduce en un
    /// directorio temporal oculto junto a `output_dir`, escribe `_SUCCESS`
    /// y lo renombra de una vez. Nunca queda salida parcial visible.
    pub fn commit_job(&self, output_dir: &Path, reduce_tasks: &[TaskId]) -> Result<Vec<String>> {
        let mut state = self.lock()?;

        if state.job_committed {
            return Err(MrError::store("el job ya fue publicado"));
        }
        for task in reduce_tasks {
            if !state.winners.contains_key(task) {
                return Err(MrError::store(format!(
                    "la tarea {} no tiene intento promovido",
                    task
                )));
            }
        }
        if output_dir.exists() {
            return Err(MrError::store(format!(
                "el directorio de salida {} ya existe",
                output_dir.display()
            )));
        }

        let parent = output_dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = output_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| MrError::config("output_dir sin nombre de directorio"))?;

        fs::create_dir_all(parent)?;
        let tmp = parent.join(format!(".{}._temporary", name));
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;

        let mut files = Vec::new();
        for task in reduce_tasks {
            let dir = self.layout.committed_dir(task);
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let file_name = entry.file_name();
                fs::rename(entry.path(), tmp.join(&file_name))?;
                files.push(file_name.to_string_lossy().to_string());
            }
        }

        fs::File::create(tmp.join(SUCCESS_MARKER))?;
        fs::rename(&tmp, output_dir)?;

        state.job_committed = true;
        files.sort();
        info!(
            "job publicado en {} ({} archivos)",
            output_dir.display(),
            files.len()
        );
        Ok(files)
    }

    /// Cancela: abandona todo lo que quedó en staging.
    pub fn abort_job(&self) {
        let staging = self.layout.staging_root();
        if let Err(e) = fs::remove_dir_all(&staging) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("no se pudo limpiar {}: {:?}", staging.display(), e);
            }
        }
    }

    /// Borra el directorio de trabajo del job (tras publicar).
    pub fn cleanup(&self) {
        if let Err(e) = fs::remove_dir_all(self.layout.root()) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("no se pudo limpiar {}: {:?}", self.layout.root().display(), e);
            }
        }
    }
}
