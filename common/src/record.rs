use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Par (clave, valor) intermedio que emite un map y consume un reduce.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Callback de map: se invoca una vez por registro de entrada.
pub type MapFn = Arc<dyn Fn(&[u8], &[u8]) -> Vec<KeyValue> + Send + Sync>;

/// Callback de reduce: una vez por clave distinta dentro de una partición,
/// con todos los valores de esa clave.
pub type ReduceFn = Arc<dyn Fn(&[u8], &[Vec<u8>]) -> Vec<KeyValue> + Send + Sync>;

/// Funciones de usuario de un job. El combiner, si existe, se aplica en el
/// lado map antes de escribir las particiones y no debe cambiar el resultado.
#[derive(Clone)]
pub struct JobFunctions {
    pub name: String,
    pub mapper: MapFn,
    pub reducer: ReduceFn,
    pub combiner: Option<ReduceFn>,
}

impl std::fmt::Debug for JobFunctions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobFunctions")
            .field("name", &self.name)
            .field("combiner", &self.combiner.is_some())
            .finish()
    }
}
