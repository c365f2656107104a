use std::fs;

use glob::glob;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MrError, Result};

/// Rango contiguo de bytes de un recurso de entrada, procesado por un map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub id: u32,
    pub resource: String,
    pub offset: u64,
    pub length: u64,
}

impl Split {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Divide cada recurso en splits de `split_size` bytes (el último puede ser
/// más corto). Los ids siguen el orden de recursos y luego de offset.
pub fn plan(resources: &[(String, u64)], split_size: u64) -> Result<Vec<Split>> {
    if split_size == 0 {
        return Err(MrError::config("split_size debe ser > 0"));
    }

    let mut splits = Vec::new();
    let mut next_id: u32 = 0;

    for (resource, size) in resources {
        let mut offset = 0;
        while offset < *size {
            let length = split_size.min(size - offset);
            splits.push(Split {
                id: next_id,
                resource: resource.clone(),
                offset,
                length,
            });
            next_id += 1;
            offset += length;
        }
    }

    Ok(splits)
}

/// Expande patrones glob (o rutas simples), toma el tamaño de cada archivo y
/// planifica los splits. Rutas ordenadas para que el plan sea determinista.
pub fn plan_files(patterns: &[String], split_size: u64) -> Result<Vec<Split>> {
    let mut paths = Vec::new();

    for pattern in patterns {
        let entries = glob(pattern)
            .map_err(|e| MrError::config(format!("patrón de entrada inválido {pattern}: {e}")))?;
        for entry in entries.flatten() {
            if entry.is_file() {
                paths.push(entry.to_string_lossy().to_string());
            }
        }
    }

    paths.sort();
    paths.dedup();

    if paths.is_empty() {
        return Err(MrError::config(format!(
            "ningún archivo de entrada coincide con {:?}",
            patterns
        )));
    }

    let mut resources = Vec::with_capacity(paths.len());
    for path in paths {
        let size = fs::metadata(&path)?.len();
        debug!("recurso de entrada {} ({} bytes)", path, size);
        resources.push((path, size));
    }

    plan(&resources, split_size)
}
