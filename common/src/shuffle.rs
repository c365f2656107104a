use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Lines, Write},
    iter::Peekable,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::commit::CommitCoordinator;
use crate::error::{MrError, Result};
use crate::layout::{partition_file_name, JobLayout};
use crate::partition::Partitioner;
use crate::record::{KeyValue, ReduceFn};
use crate::task::{AttemptId, TaskKind};

/// Archivo de partición ya finalizado por un intento de map.
#[derive(Debug, Clone)]
pub struct PartitionFile {
    pub attempt: AttemptId,
    pub partition: u32,
    pub path: PathBuf,
    pub records: u64,
}

/// Dónde leer una partición: salida promovida de un map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleLocation {
    pub attempt: AttemptId,
    pub path: String,
}

/* =========================
   Lado map: buckets + sort + escritura
   ========================= */

/// Reparte los registros del buffer de un map en R buckets, ordena cada uno
/// por clave y, si hay combiner, lo aplica por clave dentro del bucket.
pub fn bucket_and_sort(
    records: Vec<KeyValue>,
    partitioner: &dyn Partitioner,
    combiner: Option<&ReduceFn>,
) -> Vec<Vec<KeyValue>> {
    let mut buckets: Vec<Vec<KeyValue>> = (0..partitioner.num_partitions())
        .map(|_| Vec::new())
        .collect();

    for rec in records {
        let pid = partitioner.partition(&rec.key) as usize;
        buckets[pid].push(rec);
    }

    for bucket in buckets.iter_mut() {
        bucket.sort_by(|a, b| a.key.cmp(&b.key));

        if let Some(combine) = combiner {
            let taken = std::mem::take(bucket);
            let mut combined = Vec::with_capacity(taken.len());
            for group in GroupByKey::new(taken.into_iter().map(Ok)) {
                // el iterador de entrada nunca falla
                if let Ok((key, values)) = group {
                    combined.extend(combine(&key, &values));
                }
            }
            combined.sort_by(|a, b| a.key.cmp(&b.key));
            *bucket = combined;
        }
    }

    buckets
}

/// Escribe un archivo de partición (JSONL, un registro por línea) en el
/// staging del intento. Se escribe como `.tmp` y se renombra al final:
/// desde ese momento el archivo es inmutable.
pub fn write_partition_file(
    layout: &JobLayout,
    attempt: &AttemptId,
    partition: u32,
    sorted_records: &[KeyValue],
) -> Result<PartitionFile> {
    debug_assert!(sorted_records.windows(2).all(|w| w[0].key <= w[1].key));

    let dir = layout.staging_dir(attempt);
    fs::create_dir_all(&dir)?;

    let name = partition_file_name(partition);
    let final_path = dir.join(&name);
    let tmp_path = dir.join(format!("{}.tmp", name));

    let mut writer = BufWriter::new(File::create(&tmp_path)?);
    for rec in sorted_records {
        serde_json::to_writer(&mut writer, rec)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    drop(writer);

    fs::rename(&tmp_path, &final_path)?;
    debug!(
        "{} escribió {} ({} registros)",
        attempt,
        final_path.display(),
        sorted_records.len()
    );

    Ok(PartitionFile {
        attempt: *attempt,
        partition,
        path: final_path,
        records: sorted_records.len() as u64,
    })
}

/* =========================
   Índice de salidas promovidas
   ========================= */

/// Canal intermedio del job: sólo expone archivos de intentos promovidos.
pub struct ShuffleStore {
    commits: Arc<CommitCoordinator>,
}

impl ShuffleStore {
    pub fn new(commits: Arc<CommitCoordinator>) -> Self {
        Self { commits }
    }

    pub fn layout(&self) -> &JobLayout {
        self.commits.layout()
    }

    pub fn write_partition_file(
        &self,
        attempt: &AttemptId,
        partition: u32,
        sorted_records: &[KeyValue],
    ) -> Result<PartitionFile> {
        write_partition_file(self.layout(), attempt, partition, sorted_records)
    }

    /// Archivos de la partición `partition` de todos los maps promovidos,
    /// en orden de tarea. Los intentos no promovidos nunca aparecen.
    pub fn list_files_for_partition(&self, partition: u32) -> Vec<ShuffleLocation> {
        let name = partition_file_name(partition);
        self.commits
            .committed_tasks(TaskKind::Map)
            .into_iter()
            .map(|(task, attempt)| ShuffleLocation {
                attempt,
                path: self
                    .layout()
                    .committed_dir(&task)
                    .join(&name)
                    .to_string_lossy()
                    .to_string(),
            })
            .collect()
    }
}

/* =========================
   Lado reduce: lectura en streaming + merge k-way
   ========================= */

/// Lee un archivo de partición registro a registro.
pub struct PartitionReader {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
}

impl PartitionReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| MrError::store(format!("no se pudo abrir {}: {e}", path.display())))?;
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
        })
    }
}

impl Iterator for PartitionReader {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(l) => l,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(|e| {
                MrError::store(format!("registro inválido en {}: {e}", self.path.display()))
            }));
        }
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    key: Vec<u8>,
    source: usize,
    value: Vec<u8>,
}

/// Merge k-way de archivos ya ordenados: el heap guarda sólo la cabeza de
/// cada archivo, nunca el contenido completo. A igual clave sale primero el
/// archivo de menor índice.
pub struct MergeIter {
    readers: Vec<PartitionReader>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    pending_error: Option<MrError>,
    failed: bool,
}

impl MergeIter {
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut readers = Vec::with_capacity(paths.len());
        for p in paths {
            readers.push(PartitionReader::open(p)?);
        }

        let mut merge = Self {
            readers,
            heap: BinaryHeap::new(),
            pending_error: None,
            failed: false,
        };
        for source in 0..merge.readers.len() {
            merge.refill(source)?;
        }
        Ok(merge)
    }

    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some(rec) = self.readers[source].next() {
            let rec = rec?;
            self.heap.push(Reverse(HeapEntry {
                key: rec.key,
                source,
                value: rec.value,
            }));
        }
        Ok(())
    }
}

impl Iterator for MergeIter {
    type Item = Result<KeyValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(e) = self.pending_error.take() {
            self.failed = true;
            return Some(Err(e));
        }
        let Reverse(head) = self.heap.pop()?;
        if let Err(e) = self.refill(head.source) {
            self.pending_error = Some(e);
        }
        Some(Ok(KeyValue {
            key: head.key,
            value: head.value,
        }))
    }
}

/// Agrupa un stream ordenado por clave en `(clave, valores)`.
pub struct GroupByKey<I: Iterator<Item = Result<KeyValue>>> {
    inner: Peekable<I>,
}

impl<I: Iterator<Item = Result<KeyValue>>> GroupByKey<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner: inner.peekable(),
        }
    }
}

impl<I: Iterator<Item = Result<KeyValue>>> Iterator for GroupByKey<I> {
    type Item = Result<(Vec<u8>, Vec<Vec<u8>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.inner.next()? {
            Ok(kv) => kv,
            Err(e) => return Some(Err(e)),
        };

        let key = first.key;
        let mut values = vec![first.value];

        while let Some(Ok(peeked)) = self.inner.peek() {
            if peeked.key != key {
                break;
            }
            if let Some(Ok(kv)) = self.inner.next() {
                values.push(kv.value);
            }
        }

        Some(Ok((key, values)))
    }
}
