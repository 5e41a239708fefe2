//! Runtime configuration, layered from a TOML file and environment overrides
use crate::error::Result;
use crate::job::TimeoutPolicy;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const ENV_PREFIX: &str = "NUVOM__";

/// The name a queue/result backend is selected by in configuration. Plugin
/// backends share this namespace with the three built-ins.
pub type BackendName = String;

/// The fully-resolved runtime configuration consumed by [`crate::pool::WorkerPool`]
/// and the host binary. The runtime only consumes this record; authoring it
/// (from files, env vars, or a host's own flags) is the host's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub environment: String,
    pub log_level: String,
    pub queue_backend: BackendName,
    pub result_backend: BackendName,
    pub serialization_backend: String,
    pub max_workers: usize,
    pub batch_size: usize,
    pub job_timeout_secs: Option<f64>,
    pub timeout_policy: TimeoutPolicy,
    pub shutdown_grace_secs: u64,
    pub manifest_path: Option<PathBuf>,
    pub plugin_descriptor_path: PathBuf,
    pub sqlite_queue_path: PathBuf,
    pub sqlite_result_path: PathBuf,
    pub file_queue_path: PathBuf,
    pub file_result_path: PathBuf,
    pub visibility_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub prometheus_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            log_level: "info".to_string(),
            queue_backend: "memory".to_string(),
            result_backend: "memory".to_string(),
            serialization_backend: "msgpack".to_string(),
            max_workers: 4,
            batch_size: 1,
            job_timeout_secs: None,
            timeout_policy: TimeoutPolicy::Fail,
            shutdown_grace_secs: 10,
            manifest_path: None,
            plugin_descriptor_path: PathBuf::from("nuvom-plugins.toml"),
            sqlite_queue_path: PathBuf::from("nuvom_queue.db"),
            sqlite_result_path: PathBuf::from("nuvom_results.db"),
            file_queue_path: PathBuf::from(".nuvom/queue"),
            file_result_path: PathBuf::from(".nuvom/results"),
            visibility_timeout_secs: 30,
            sweep_interval_secs: 5,
            prometheus_port: 9477,
        }
    }
}

impl Config {
    /// Loads configuration by layering, in increasing precedence: built-in
    /// defaults, an optional `nuvom.toml` in the current directory, and
    /// environment variables prefixed `NUVOM__` with `__` as the nesting
    /// separator (e.g. `NUVOM__MAX_WORKERS=8`).
    pub fn new() -> Result<Self> {
        Self::from_file("nuvom.toml")
    }

    /// Same layering as [`Config::new`] but with an explicit config file path,
    /// useful for tests and hosts that accept a `--config` flag.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let config: Self = Figment::new()
            .merge(figment::providers::Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.queue_backend, "memory");
        assert_eq!(config.max_workers, 4);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::from_file("/nonexistent/nuvom.toml").unwrap();
        assert_eq!(config.environment, "development");
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nuvom.toml");
        std::fs::write(&path, "max_workers = 16\nqueue_backend = \"sqlite\"\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.max_workers, 16);
        assert_eq!(config.queue_backend, "sqlite");
        assert_eq!(config.result_backend, "memory");
    }

    #[test]
    fn env_override_takes_precedence_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nuvom.toml");
        std::fs::write(&path, "max_workers = 16\n").unwrap();
        std::env::set_var("NUVOM__MAX_WORKERS", "32");
        let config = Config::from_file(&path).unwrap();
        std::env::remove_var("NUVOM__MAX_WORKERS");
        assert_eq!(config.max_workers, 32);
    }
}
