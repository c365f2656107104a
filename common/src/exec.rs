use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::PathBuf,
    time::Instant,
};

use tracing::{debug, info};

use crate::error::{MrError, Result};
use crate::input::LineRecordReader;
use crate::layout::{reduce_output_file_name, JobLayout};
use crate::partition::HashPartitioner;
use crate::record::JobFunctions;
use crate::shuffle::{bucket_and_sort, write_partition_file, GroupByKey, MergeIter, PartitionFile, ShuffleLocation};
use crate::split::Split;
use crate::task::AttemptId;
use crate::wordcount::functions_by_name;
use crate::worker::{Assignment, AssignmentInput};

/// Ejecuta un intento de map: lee las líneas del split, llama al mapper,
/// aplica el combiner por bucket y escribe las `num_partitions` particiones
/// (también las vacías) en el staging del intento.
pub fn run_map_attempt(
    layout: &JobLayout,
    attempt: &AttemptId,
    split: &Split,
    num_partitions: u32,
    functions: &JobFunctions,
) -> Result<Vec<PartitionFile>> {
    let partitioner = HashPartitioner::new(num_partitions)?;

    let mut buffer = Vec::new();
    let mut records = 0u64;
    let mut reader = LineRecordReader::open(split)?;
    while let Some((offset, line)) = reader.next_record()? {
        let key = offset.to_string();
        buffer.extend((functions.mapper)(key.as_bytes(), &line));
        records += 1;
    }
    debug!(
        "{}: {} líneas de {} [{}, {}) -> {} pares",
        attempt,
        records,
        split.resource,
        split.offset,
        split.end(),
        buffer.len()
    );

    let buckets = bucket_and_sort(buffer, &partitioner, functions.combiner.as_ref());

    buckets
        .iter()
        .enumerate()
        .map(|(p, bucket)| write_partition_file(layout, attempt, p as u32, bucket))
        .collect()
}

/// Ejecuta un intento de reduce: merge de la partición de cada map
/// promovido, agrupa por clave y escribe `part-r-NNNNN` (`clave\tvalor`)
/// secuencialmente en el staging del intento.
pub fn run_reduce_attempt(
    layout: &JobLayout,
    attempt: &AttemptId,
    partition: u32,
    sources: &[ShuffleLocation],
    functions: &JobFunctions,
) -> Result<PathBuf> {
    let paths: Vec<&str> = sources.iter().map(|s| s.path.as_str()).collect();
    let merged = MergeIter::open(&paths)?;

    let dir = layout.staging_dir(attempt);
    fs::create_dir_all(&dir)?;
    let name = reduce_output_file_name(partition);
    let final_path = dir.join(&name);
    let tmp_path = dir.join(format!("{}.tmp", name));

    let mut out = BufWriter::new(File::create(&tmp_path)?);
    let mut keys = 0u64;
    for group in GroupByKey::new(merged) {
        let (key, values) = group?;
        for kv in (functions.reducer)(&key, &values) {
            out.write_all(&kv.key)?;
            out.write_all(b"\t")?;
            out.write_all(&kv.value)?;
            out.write_all(b"\n")?;
        }
        keys += 1;
    }
    out.flush()?;
    drop(out);

    fs::rename(&tmp_path, &final_path)?;
    debug!("{}: {} claves de {} fuentes", attempt, keys, sources.len());
    Ok(final_path)
}

/// Ejecuta una asignación con funciones ya resueltas.
pub fn execute_with(assignment: &Assignment, functions: &JobFunctions) -> Result<()> {
    let layout = JobLayout::from_root(&assignment.work_dir);
    let started = Instant::now();

    match &assignment.input {
        AssignmentInput::Map { split } => {
            run_map_attempt(
                &layout,
                &assignment.attempt,
                split,
                assignment.num_partitions,
                functions,
            )?;
        }
        AssignmentInput::Reduce { partition, sources } => {
            run_reduce_attempt(&layout, &assignment.attempt, *partition, sources, functions)?;
        }
    }

    info!(
        "intento {} del job {} terminado en {} ms",
        assignment.attempt,
        assignment.job_id,
        started.elapsed().as_millis()
    );
    Ok(())
}

/// Ejecuta una asignación recibida por la red: resuelve las funciones por
/// nombre.
pub fn execute(assignment: &Assignment) -> Result<()> {
    let functions = functions_by_name(&assignment.functions).ok_or_else(|| {
        MrError::config(format!("funciones desconocidas: {}", assignment.functions))
    })?;
    execute_with(assignment, &functions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shuffle::PartitionReader;
    use crate::task::TaskId;
    use crate::wordcount::wordcount_functions;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("exec_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn whole_file(path: &PathBuf, id: u32) -> Split {
        Split {
            id,
            resource: path.to_string_lossy().to_string(),
            offset: 0,
            length: fs::metadata(path).unwrap().len(),
        }
    }

    #[test]
    fn map_escribe_todas_las_particiones_ordenadas_y_combinadas() {
        let tmp = temp_dir("map");
        let input = tmp.join("in.txt");
        fs::write(&input, "a b a\nc a\n").unwrap();
        let layout = JobLayout::new(&tmp, "job");
        let attempt = AttemptId::new(TaskId::map(0), 0);

        let files = run_map_attempt(&layout, &attempt, &whole_file(&input, 0), 3, &wordcount_functions())
            .unwrap();

        assert_eq!(files.len(), 3);
        let mut all = Vec::new();
        for f in &files {
            assert!(f.path.exists());
            let recs: Vec<_> = PartitionReader::open(&f.path)
                .unwrap()
                .map(|r| r.unwrap())
                .collect();
            assert!(recs.windows(2).all(|w| w[0].key < w[1].key));
            all.extend(recs);
        }
        all.sort();
        let pairs: Vec<(String, String)> = all
            .into_iter()
            .map(|kv| {
                (
                    String::from_utf8(kv.key).unwrap(),
                    String::from_utf8(kv.value).unwrap(),
                )
            })
            .collect();
        // el combiner ya sumó dentro del map
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "3".to_string()),
                ("b".to_string(), "1".to_string()),
                ("c".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn reduce_junta_fuentes_y_escribe_tsv() {
        let tmp = temp_dir("reduce");
        let layout = JobLayout::new(&tmp, "job");
        let functions = wordcount_functions();

        let mut sources = Vec::new();
        for (i, text) in ["a b a\n", "b c\n"].iter().enumerate() {
            let input = tmp.join(format!("in-{i}.txt"));
            fs::write(&input, text).unwrap();
            let attempt = AttemptId::new(TaskId::map(i as u32), 0);
            let files =
                run_map_attempt(&layout, &attempt, &whole_file(&input, i as u32), 1, &functions).unwrap();
            sources.push(ShuffleLocation {
                attempt,
                path: files[0].path.to_string_lossy().to_string(),
            });
        }

        let attempt = AttemptId::new(TaskId::reduce(0), 0);
        let out = run_reduce_attempt(&layout, &attempt, 0, &sources, &functions).unwrap();

        assert!(out.ends_with("part-r-00000"));
        assert_eq!(fs::read_to_string(out).unwrap(), "a\t2\nb\t2\nc\t1\n");
    }

    #[test]
    fn reduce_sin_fuentes_escribe_archivo_vacio() {
        let tmp = temp_dir("vacio");
        let layout = JobLayout::new(&tmp, "job");
        let attempt = AttemptId::new(TaskId::reduce(1), 0);
        let out = run_reduce_attempt(&layout, &attempt, 1, &[], &wordcount_functions()).unwrap();
        assert_eq!(fs::read_to_string(out).unwrap(), "");
    }

    #[test]
    fn reduce_con_fuente_perdida_es_store_unavailable() {
        let tmp = temp_dir("perdida");
        let layout = JobLayout::new(&tmp, "job");
        let sources = vec![ShuffleLocation {
            attempt: AttemptId::new(TaskId::map(0), 0),
            path: tmp.join("no-existe.jsonl").to_string_lossy().to_string(),
        }];
        let err = run_reduce_attempt(
            &layout,
            &AttemptId::new(TaskId::reduce(0), 0),
            0,
            &sources,
            &wordcount_functions(),
        )
        .unwrap_err();
        assert!(matches!(err, MrError::StoreUnavailable(_)));
    }

    #[test]
    fn execute_rechaza_funciones_desconocidas() {
        let assignment = Assignment {
            job_id: "j".into(),
            attempt: AttemptId::new(TaskId::reduce(0), 0),
            input: AssignmentInput::Reduce {
                partition: 0,
                sources: vec![],
            },
            num_partitions: 1,
            functions: "grep".into(),
            work_dir: temp_dir("desconocidas").to_string_lossy().to_string(),
            speculative: false,
        };
        assert!(matches!(execute(&assignment), Err(MrError::Config(_))));
    }
}
