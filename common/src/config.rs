use std::{env, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{MrError, Result};

pub const DEFAULT_SPLIT_SIZE: u64 = 32 * 1024 * 1024;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 30_000;

/// Ejecución especulativa de stragglers. Desactivada salvo que el job la
/// configure explícitamente.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeculationConfig {
    /// Intentos completados del mismo tipo (map/reduce) antes de especular.
    #[serde(default = "default_min_samples")]
    pub min_completed_samples: u32,
    /// Un intento es straggler si corre más que p95 * este factor.
    #[serde(default = "default_runtime_multiplier")]
    pub runtime_multiplier: f64,
    /// Piso del umbral, en milisegundos.
    #[serde(default = "default_min_runtime_ms")]
    pub min_runtime_ms: u64,
}

fn default_min_samples() -> u32 {
    3
}

fn default_runtime_multiplier() -> f64 {
    1.5
}

fn default_min_runtime_ms() -> u64 {
    1_000
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            min_completed_samples: default_min_samples(),
            runtime_multiplier: default_runtime_multiplier(),
            min_runtime_ms: default_min_runtime_ms(),
        }
    }
}

/// Configuración inmutable de un job; se pasa a cada componente al crearlo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    #[serde(default = "default_split_size")]
    pub split_size: u64,
    #[serde(default = "default_num_reducers")]
    pub num_reducers: u32,
    /// Fallos permitidos por tarea antes de declararla perdida.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Sin heartbeat durante este tiempo el intento se da por fallido.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default)]
    pub speculation: Option<SpeculationConfig>,
}

fn default_split_size() -> u64 {
    DEFAULT_SPLIT_SIZE
}

fn default_num_reducers() -> u32 {
    1
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_heartbeat_timeout_ms() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT_MS
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            split_size: default_split_size(),
            num_reducers: default_num_reducers(),
            max_attempts: default_max_attempts(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            speculation: None,
        }
    }
}

impl JobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.split_size == 0 {
            return Err(MrError::config("split_size debe ser > 0"));
        }
        if self.num_reducers == 0 {
            return Err(MrError::config("num_reducers debe ser > 0"));
        }
        if self.max_attempts == 0 {
            return Err(MrError::config("max_attempts debe ser > 0"));
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(MrError::config("heartbeat_timeout_ms debe ser > 0"));
        }
        if let Some(spec) = &self.speculation {
            if !(spec.runtime_multiplier.is_finite() && spec.runtime_multiplier >= 1.0) {
                return Err(MrError::config("runtime_multiplier debe ser >= 1.0"));
            }
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Lee una variable de entorno parseable, con valor por defecto.
pub fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_son_validos_y_sin_especulacion() {
        let cfg = JobConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.speculation.is_none());
        assert_eq!(cfg.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn json_parcial_usa_defaults() {
        let cfg: JobConfig = serde_json::from_str(r#"{"num_reducers": 3}"#).unwrap();
        assert_eq!(cfg.num_reducers, 3);
        assert_eq!(cfg.split_size, DEFAULT_SPLIT_SIZE);

        let cfg: JobConfig = serde_json::from_str(r#"{"speculation": {}}"#).unwrap();
        assert_eq!(cfg.speculation, Some(SpeculationConfig::default()));
    }

    #[test]
    fn validate_rechaza_parametros_invalidos() {
        let bad = [
            JobConfig { split_size: 0, ..JobConfig::default() },
            JobConfig { num_reducers: 0, ..JobConfig::default() },
            JobConfig { max_attempts: 0, ..JobConfig::default() },
            JobConfig {
                speculation: Some(SpeculationConfig {
                    runtime_multiplier: 0.5,
                    ..SpeculationConfig::default()
                }),
                ..JobConfig::default()
            },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(MrError::Config(_))), "{:?}", cfg);
        }
    }

    #[test]
    fn env_or_respeta_env_var() {
        env::set_var("MR_TEST_ENV_OR", "1234");
        assert_eq!(env_or("MR_TEST_ENV_OR", 1u64), 1234);
        env::remove_var("MR_TEST_ENV_OR");
        assert_eq!(env_or("MR_TEST_ENV_OR", 7u64), 7);
    }
}
