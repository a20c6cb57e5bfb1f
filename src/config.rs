//! Scheduler configuration.
//!
//! Resolution order mirrors the teacher's `resolve_root`: CLI flag, then
//! environment variable, then a TOML file under the platform config
//! directory, then a built-in default. `db.url` and `scheduler.jobs_dir`
//! have no usable default and are fatal if absent (spec §6).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    db: Option<FileDb>,
    scheduler: Option<FileScheduler>,
    log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileDb {
    url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileScheduler {
    jobs_dir: Option<String>,
    grace_seconds: Option<i64>,
    tick_interval_ms: Option<u64>,
    max_unknown_retries: Option<u32>,
}

/// Raw overrides taken from CLI flags, highest precedence.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub db_url: Option<String>,
    pub jobs_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub jobs_dir: PathBuf,
    pub log_level: String,
    pub grace_seconds: i64,
    pub tick_interval_ms: u64,
    pub max_unknown_retries: u32,
}

const DEFAULT_GRACE_SECONDS: i64 = 300;
const DEFAULT_TICK_INTERVAL_MS: u64 = 500;
const DEFAULT_MAX_UNKNOWN_RETRIES: u32 = 10;

impl Config {
    /// Resolve configuration following CLI flag → env var → config file →
    /// default. `db.url` and `scheduler.jobs_dir` are required; their
    /// absence at every layer is a fatal startup error.
    pub fn resolve(overrides: ConfigOverrides) -> Result<Config> {
        let file = load_file_config()?;

        let db_url = overrides
            .db_url
            .or_else(|| env_nonempty("JOBCTL_DB_URL"))
            .or_else(|| file.db.as_ref().and_then(|d| d.url.clone()))
            .context("db.url is not configured (set --db-url, JOBCTL_DB_URL, or db.url in the config file)")?;

        let jobs_dir = overrides
            .jobs_dir
            .or_else(|| env_nonempty("JOBCTL_JOBS_DIR").map(PathBuf::from))
            .or_else(|| {
                file.scheduler
                    .as_ref()
                    .and_then(|s| s.jobs_dir.clone())
                    .map(PathBuf::from)
            })
            .context(
                "scheduler.jobs_dir is not configured (set --jobs-dir, JOBCTL_JOBS_DIR, or scheduler.jobs_dir in the config file)",
            )?;

        let log_level = overrides
            .log_level
            .or_else(|| env_nonempty("JOBCTL_LOG_LEVEL"))
            .or_else(|| file.log_level.clone())
            .unwrap_or_else(|| "INFO".to_string());

        let grace_seconds = file
            .scheduler
            .as_ref()
            .and_then(|s| s.grace_seconds)
            .unwrap_or(DEFAULT_GRACE_SECONDS);
        let tick_interval_ms = file
            .scheduler
            .as_ref()
            .and_then(|s| s.tick_interval_ms)
            .unwrap_or(DEFAULT_TICK_INTERVAL_MS);
        let max_unknown_retries = file
            .scheduler
            .as_ref()
            .and_then(|s| s.max_unknown_retries)
            .unwrap_or(DEFAULT_MAX_UNKNOWN_RETRIES);

        Ok(Config {
            db_url,
            jobs_dir,
            log_level,
            grace_seconds,
            tick_interval_ms,
            max_unknown_retries,
        })
    }

    /// Map the enumerated log level onto a `tracing-subscriber` filter directive.
    pub fn tracing_directive(&self) -> &'static str {
        match self.log_level.to_ascii_uppercase().as_str() {
            "CRITICAL" | "ERROR" => "error",
            "WARNING" => "warn",
            "DEBUG" => "debug",
            _ => "info",
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn load_file_config() -> Result<FileConfig> {
    let Some(path) = config_file_path() else {
        return Ok(FileConfig::default());
    };
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    parse_config_file(&path)
}

fn parse_config_file(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}

fn config_file_path() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("JOBCTL_CONFIG") {
        if !explicit.is_empty() {
            return Some(PathBuf::from(explicit));
        }
    }
    ProjectDirs::from("", "", "jobctl").map(|dirs| dirs.config_dir().join("jobctl.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_override_wins_over_everything() {
        let overrides = ConfigOverrides {
            db_url: Some("sqlite:///tmp/x.db".into()),
            jobs_dir: Some(PathBuf::from("/tmp/jobs")),
            log_level: Some("DEBUG".into()),
        };
        // SAFETY: test-only env mutation, single-threaded test in this module.
        unsafe {
            std::env::set_var("JOBCTL_DB_URL", "sqlite:///should-not-be-used.db");
        }
        let cfg = Config::resolve(overrides).unwrap();
        unsafe {
            std::env::remove_var("JOBCTL_DB_URL");
        }
        assert_eq!(cfg.db_url, "sqlite:///tmp/x.db");
        assert_eq!(cfg.jobs_dir, PathBuf::from("/tmp/jobs"));
        assert_eq!(cfg.tracing_directive(), "debug");
    }

    #[test]
    fn missing_db_url_is_fatal() {
        // SAFETY: test-only env mutation.
        unsafe {
            std::env::remove_var("JOBCTL_DB_URL");
            std::env::remove_var("JOBCTL_CONFIG");
        }
        let overrides = ConfigOverrides {
            jobs_dir: Some(PathBuf::from("/tmp/jobs")),
            ..Default::default()
        };
        assert!(Config::resolve(overrides).is_err());
    }

    #[test]
    fn defaults_fill_in_tuning_knobs() {
        let overrides = ConfigOverrides {
            db_url: Some("sqlite::memory:".into()),
            jobs_dir: Some(PathBuf::from("/tmp/jobs")),
            log_level: None,
        };
        let cfg = Config::resolve(overrides).unwrap();
        assert_eq!(cfg.grace_seconds, DEFAULT_GRACE_SECONDS);
        assert_eq!(cfg.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
        assert_eq!(cfg.log_level, "INFO");
    }
}
