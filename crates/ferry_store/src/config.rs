use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ferry_core::{FerryError, FerryResult};

const DEFAULT_CONFIG_NAME: &str = "ferry.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Postgres { url: String },
    Mysql { url: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Rows per INSERT statement when a job is created.
    pub max_create_batch: Option<usize>,
    /// How long a claimed row stays reserved for its worker.
    pub claim_lease_ms: Option<u64>,
}

impl LimitsConfig {
    pub fn with_defaults() -> Self {
        Self {
            max_create_batch: Some(500),
            claim_lease_ms: Some(120_000),
        }
    }
}

/// Defaults for the import executor; CLI flags override each field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportConfig {
    pub max_tuples_per_write: Option<usize>,
    pub max_parallel_requests: Option<usize>,
    pub min_rps: Option<u32>,
    pub max_rps: Option<u32>,
    pub ramp_period_ticks: Option<u32>,
    pub tick_ms: Option<u64>,
}

impl ImportConfig {
    pub fn with_defaults() -> Self {
        Self {
            max_tuples_per_write: Some(1),
            max_parallel_requests: Some(4),
            min_rps: Some(1),
            max_rps: Some(10),
            ramp_period_ticks: Some(0),
            tick_ms: Some(1_000),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FerryConfig {
    pub database: DatabaseConfig,
    pub pool: Option<PoolConfig>,
    pub limits: Option<LimitsConfig>,
    pub import: Option<ImportConfig>,
    pub failpoints: Option<Vec<String>>,
}

impl FerryConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            pool: None,
            limits: Some(LimitsConfig::with_defaults()),
            import: Some(ImportConfig::with_defaults()),
            failpoints: None,
        }
    }

    pub fn load_or_init(base_dir: &Path, default_sqlite_path: &Path) -> FerryResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| FerryError::storage(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| FerryError::storage(format!("read config: {err}")))?;
            let config: FerryConfig = serde_json::from_str(&raw)
                .map_err(|err| FerryError::validation(format!("parse config: {err}")))?;
            return Ok(config);
        }
        let default = FerryConfig::default_sqlite(default_sqlite_path.to_string_lossy());
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| FerryError::storage(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| FerryError::storage(format!("write config: {err}")))?;
        log::info!("config: wrote defaults to {}", config_path.display());
        Ok(default)
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> FerryResult<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let path = path.clone().unwrap_or_else(|| "ferry.sqlite".to_string());
                let candidate = PathBuf::from(path);
                if candidate.is_absolute() {
                    Ok(candidate)
                } else {
                    Ok(base_dir.join(candidate))
                }
            }
            _ => Err(FerryError::validation("config is not sqlite backend")),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.database {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Postgres { .. } => "postgres",
            DatabaseConfig::Mysql { .. } => "mysql",
        }
    }

    pub fn connection_url(&self, base_dir: &Path) -> FerryResult<String> {
        match &self.database {
            DatabaseConfig::Sqlite { .. } => {
                let path = self.sqlite_path(base_dir)?;
                Ok(format!("sqlite://{}?mode=rwc", path.display()))
            }
            DatabaseConfig::Postgres { url } | DatabaseConfig::Mysql { url } => Ok(url.clone()),
        }
    }

    pub fn import_defaults(&self) -> ImportConfig {
        let defaults = ImportConfig::with_defaults();
        let Some(import) = self.import.clone() else {
            return defaults;
        };
        ImportConfig {
            max_tuples_per_write: import.max_tuples_per_write.or(defaults.max_tuples_per_write),
            max_parallel_requests: import
                .max_parallel_requests
                .or(defaults.max_parallel_requests),
            min_rps: import.min_rps.or(defaults.min_rps),
            max_rps: import.max_rps.or(defaults.max_rps),
            ramp_period_ticks: import.ramp_period_ticks.or(defaults.ramp_period_ticks),
            tick_ms: import.tick_ms.or(defaults.tick_ms),
        }
    }
}
