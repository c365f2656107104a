use std::sync::Arc;

use crate::record::{JobFunctions, KeyValue, ReduceFn};

/// map: una línea -> (palabra, "1") por cada token separado por espacios,
/// tabuladores o saltos de línea.
pub fn tokenize_map(_offset: &[u8], line: &[u8]) -> Vec<KeyValue> {
    line.split(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0c))
        .filter(|tok| !tok.is_empty())
        .map(|tok| KeyValue::new(tok, b"1".to_vec()))
        .collect()
}

/// reduce (y combiner): suma los conteos de una palabra.
/// Valores que no son enteros decimales se ignoran.
pub fn int_sum_reduce(word: &[u8], counts: &[Vec<u8>]) -> Vec<KeyValue> {
    let total: u64 = counts
        .iter()
        .filter_map(|v| std::str::from_utf8(v).ok())
        .filter_map(|s| s.trim().parse::<u64>().ok())
        .sum();

    vec![KeyValue::new(word, total.to_string().into_bytes())]
}

pub fn wordcount_functions() -> JobFunctions {
    let sum: ReduceFn = Arc::new(int_sum_reduce);
    JobFunctions {
        name: "wordcount".to_string(),
        mapper: Arc::new(tokenize_map),
        reducer: sum.clone(),
        combiner: Some(sum),
    }
}

/// Registro de funciones por nombre: los workers no pueden recibir closures
/// por la red, así que el job sólo viaja con el nombre.
pub fn functions_by_name(name: &str) -> Option<JobFunctions> {
    match name {
        "wordcount" => Some(wordcount_functions()),
        _ => None,
    }
}
