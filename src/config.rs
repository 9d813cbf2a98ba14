//! Layered configuration for tasker.
//!
//! Values resolve in order: built-in defaults, then `<planning-dir>/tasker.toml`,
//! then environment variables, then command-line flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! target_dir = "/work/app"
//! lock_timeout_secs = 10
//! max_parallel = 3
//! log_level = "info"
//! ```
//!
//! A bad value in the file is an error naming the key. A bad value in the
//! environment is ignored with a warning, so a stray variable cannot wedge
//! every invocation.

use crate::errors::{Result, TaskerError};
use crate::state::StateRepository;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "tasker.toml";
pub const DEFAULT_PLANNING_DIR: &str = "project-planning";
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_PARALLEL: usize = 3;
pub const DEFAULT_LOG_LEVEL: &str = "warn";

pub const ENV_PLANNING_DIR: &str = "TASKER_PLANNING_DIR";
pub const ENV_TARGET_DIR: &str = "TASKER_TARGET_DIR";
pub const ENV_LOCK_TIMEOUT: &str = "TASKER_LOCK_TIMEOUT_SECS";
pub const ENV_MAX_PARALLEL: &str = "TASKER_MAX_PARALLEL";
pub const ENV_LOG: &str = "TASKER_LOG";

/// Contents of `tasker.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TaskerError::io(path, e)),
        };
        let parsed: FileConfig = toml::from_str(&raw).map_err(|e| {
            TaskerError::invalid(format!("{}: {}", path.display(), e.to_string().trim()))
        })?;
        if parsed.lock_timeout_secs == Some(0) {
            return Err(TaskerError::invalid(format!(
                "{}: lock_timeout_secs must be at least 1",
                path.display()
            )));
        }
        if parsed.max_parallel == Some(0) {
            return Err(TaskerError::invalid(format!(
                "{}: max_parallel must be at least 1",
                path.display()
            )));
        }
        if let Some(level) = &parsed.log_level
            && !valid_log_level(level)
        {
            return Err(TaskerError::invalid(format!(
                "{}: log_level '{}' is not a valid filter",
                path.display(),
                level
            )));
        }
        Ok(Some(parsed))
    }
}

fn valid_log_level(level: &str) -> bool {
    tracing_subscriber::EnvFilter::try_new(level).is_ok()
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub planning_dir: Option<PathBuf>,
    pub lock_timeout_secs: Option<u64>,
    pub max_parallel: Option<usize>,
    pub log_level: Option<String>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub planning_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_dir: Option<String>,
    pub lock_timeout_secs: u64,
    pub max_parallel: usize,
    pub log_level: String,
    /// The file that contributed values, if one existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Ignored environment values, reported once logging is up.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

impl Config {
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        Self::resolve_with(cli, |key| std::env::var(key).ok())
    }

    /// Resolve with an explicit environment lookup.
    pub fn resolve_with(cli: &CliOverrides, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let planning_dir = cli
            .planning_dir
            .clone()
            .or_else(|| env(ENV_PLANNING_DIR).filter(|v| !v.is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PLANNING_DIR));

        let config_path = planning_dir.join(CONFIG_FILE);
        let file = FileConfig::load(&config_path)?;
        let config_file = file.as_ref().map(|_| config_path);
        let file = file.unwrap_or_default();

        let mut warnings = Vec::new();
        let mut parsed_env = |key: &str, valid: &dyn Fn(&str) -> bool| -> Option<String> {
            let value = env(key)?;
            if valid(&value) {
                Some(value)
            } else {
                warnings.push(format!("ignoring {}={:?}: invalid value", key, value));
                None
            }
        };
        let positive = |v: &str| v.parse::<u64>().is_ok_and(|n| n > 0);

        let env_timeout = parsed_env(ENV_LOCK_TIMEOUT, &positive).and_then(|v| v.parse().ok());
        let env_parallel = parsed_env(ENV_MAX_PARALLEL, &positive).and_then(|v| v.parse().ok());
        let env_log = parsed_env(ENV_LOG, &valid_log_level);
        let env_target = env(ENV_TARGET_DIR).filter(|v| !v.is_empty());

        if let Some(level) = &cli.log_level
            && !valid_log_level(level)
        {
            return Err(TaskerError::invalid(format!(
                "--log-level '{}' is not a valid filter",
                level
            )));
        }
        if cli.lock_timeout_secs == Some(0) || cli.max_parallel == Some(0) {
            return Err(TaskerError::invalid(
                "--lock-timeout and --max-parallel must be at least 1",
            ));
        }

        Ok(Self {
            planning_dir,
            target_dir: env_target.or(file.target_dir),
            lock_timeout_secs: cli
                .lock_timeout_secs
                .or(env_timeout)
                .or(file.lock_timeout_secs)
                .unwrap_or(DEFAULT_LOCK_TIMEOUT_SECS),
            max_parallel: cli
                .max_parallel
                .or(env_parallel)
                .or(file.max_parallel)
                .unwrap_or(DEFAULT_MAX_PARALLEL),
            log_level: cli
                .log_level
                .clone()
                .or(env_log)
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            config_file,
            warnings,
        })
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn repository(&self) -> StateRepository {
        StateRepository::new(&self.planning_dir, self.lock_timeout())
    }

    pub fn config_path(&self) -> PathBuf {
        self.planning_dir.join(CONFIG_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.planning_dir.join("logs")
    }

    /// Write a `tasker.toml` holding the current values. Refuses to overwrite.
    pub fn write_file(&self) -> Result<PathBuf> {
        let path = self.config_path();
        if path.exists() {
            return Err(TaskerError::invalid(format!(
                "{} already exists",
                path.display()
            )));
        }
        let file = FileConfig {
            target_dir: self.target_dir.clone(),
            lock_timeout_secs: Some(self.lock_timeout_secs),
            max_parallel: Some(self.max_parallel),
            log_level: Some(self.log_level.clone()),
        };
        let body = toml::to_string_pretty(&file)
            .map_err(|e| TaskerError::invalid(format!("failed to render config: {}", e)))?;
        crate::store::atomic_write(&path, body.as_bytes())?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn cli_for(dir: &Path) -> CliOverrides {
        CliOverrides {
            planning_dir: Some(dir.to_path_buf()),
            ..CliOverrides::default()
        }
    }

    #[test]
    fn test_defaults_without_file_or_env() {
        let config = Config::resolve_with(&CliOverrides::default(), env_of(&[])).unwrap();
        assert_eq!(config.planning_dir, PathBuf::from(DEFAULT_PLANNING_DIR));
        assert_eq!(config.lock_timeout_secs, 10);
        assert_eq!(config.max_parallel, 3);
        assert_eq!(config.log_level, "warn");
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_layering_file_then_env_then_cli() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "max_parallel = 5\nlock_timeout_secs = 20\nlog_level = \"info\"\n",
        )
        .unwrap();

        let config = Config::resolve_with(&cli_for(dir.path()), env_of(&[])).unwrap();
        assert_eq!(config.max_parallel, 5);
        assert_eq!(config.lock_timeout_secs, 20);
        assert!(config.config_file.is_some());

        let env = env_of(&[(ENV_MAX_PARALLEL, "7"), (ENV_LOG, "debug")]);
        let config = Config::resolve_with(&cli_for(dir.path()), env).unwrap();
        assert_eq!(config.max_parallel, 7);
        assert_eq!(config.log_level, "debug");

        let cli = CliOverrides {
            max_parallel: Some(2),
            ..cli_for(dir.path())
        };
        let config = Config::resolve_with(&cli, env_of(&[(ENV_MAX_PARALLEL, "7")])).unwrap();
        assert_eq!(config.max_parallel, 2);
    }

    #[test]
    fn test_bad_file_value_names_key() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "max_parallel = \"lots\"\n").unwrap();
        let err = Config::resolve_with(&cli_for(dir.path()), env_of(&[])).unwrap_err();
        assert_eq!(err.category(), "validation");
        assert!(err.to_string().contains("max_parallel"));

        std::fs::write(dir.path().join(CONFIG_FILE), "lock_timeout_secs = 0\n").unwrap();
        let err = Config::resolve_with(&cli_for(dir.path()), env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("lock_timeout_secs"));
    }

    #[test]
    fn test_bad_env_value_is_ignored_with_warning() {
        let dir = tempdir().unwrap();
        let env = env_of(&[(ENV_LOCK_TIMEOUT, "soon")]);
        let config = Config::resolve_with(&cli_for(dir.path()), env).unwrap();
        assert_eq!(config.lock_timeout_secs, DEFAULT_LOCK_TIMEOUT_SECS);
        assert_eq!(config.warnings.len(), 1);
        assert!(config.warnings[0].contains(ENV_LOCK_TIMEOUT));
    }

    #[test]
    fn test_planning_dir_from_env() {
        let env = env_of(&[(ENV_PLANNING_DIR, "/tmp/plan")]);
        let config = Config::resolve_with(&CliOverrides::default(), env).unwrap();
        assert_eq!(config.planning_dir, PathBuf::from("/tmp/plan"));
    }

    #[test]
    fn test_write_file_round_trips() {
        let dir = tempdir().unwrap();
        let config = Config::resolve_with(&cli_for(dir.path()), env_of(&[])).unwrap();
        let path = config.write_file().unwrap();
        let loaded = FileConfig::load(&path).unwrap().unwrap();
        assert_eq!(loaded.max_parallel, Some(3));
        assert!(config.write_file().is_err());
    }
}
