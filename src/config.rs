// src/config.rs
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{ReportError, Result};

const CONFIG_PATH_VAR: &str = "PETRA_REPORTS_CONFIG";

/// Connection settings for the outgoing mail server.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// High-level application configuration: an optional TOML file, overridden
/// by environment variables.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_address: String,
    pub port: u16,
    /// Report calculations running at the same time.
    pub max_concurrent_jobs: usize,
    /// Queued plus running calculations before new ones are turned away.
    pub max_queued_jobs: usize,
    /// How long a finished job stays available for polling and downloads.
    pub job_retention_secs: u64,
    pub report_timeout_secs: u64,
    pub path_standard_reports: Option<PathBuf>,
    pub path_custom_reports: Option<PathBuf>,
    pub temp_dir: PathBuf,
    /// User whose email preferences apply when a request names none.
    pub default_user: String,
    pub smtp: Option<SmtpConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_concurrent_jobs: 4,
            max_queued_jobs: 32,
            job_retention_secs: 3600,
            report_timeout_secs: 300,
            path_standard_reports: None,
            path_custom_reports: None,
            temp_dir: std::env::temp_dir(),
            default_user: "SYSADMIN".to_string(),
            smtp: None,
        }
    }
}

fn default_smtp_port() -> u16 {
    587
}

impl AppConfig {
    /// Load the config file (if any) and apply the process environment.
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_PATH_VAR)
            .ok()
            .map(PathBuf::from)
            .or_else(default_config_file)
            .filter(|p| p.exists());

        let base = match file {
            Some(path) => {
                log::info!("Loading configuration from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };

        base.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Applies overrides looked up by variable name and validates the result.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(address) = lookup("BIND_ADDRESS") {
            self.bind_address = address;
        }
        if let Some(port) = lookup("PORT") {
            self.port = parse_number("PORT", &port)?;
        }
        if let Some(value) = lookup("MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = parse_number("MAX_CONCURRENT_JOBS", &value)?;
        }
        if let Some(value) = lookup("MAX_QUEUED_JOBS") {
            self.max_queued_jobs = parse_number("MAX_QUEUED_JOBS", &value)?;
        }
        if let Some(value) = lookup("JOB_RETENTION_SECS") {
            self.job_retention_secs = parse_number("JOB_RETENTION_SECS", &value)?;
        }
        if let Some(value) = lookup("REPORT_TIMEOUT_SECS") {
            self.report_timeout_secs = parse_number("REPORT_TIMEOUT_SECS", &value)?;
        }
        if let Some(path) = lookup("REPORTING_PATH_STANDARD_REPORTS") {
            self.path_standard_reports = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("REPORTING_PATH_CUSTOM_REPORTS") {
            self.path_custom_reports = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("REPORT_TEMP_DIR") {
            self.temp_dir = PathBuf::from(path);
        }
        if let Some(user) = lookup("DEFAULT_USER") {
            self.default_user = user;
        }

        if let Some(host) = lookup("SMTP_HOST") {
            let port = match lookup("SMTP_PORT") {
                Some(port) => parse_number("SMTP_PORT", &port)?,
                None => self.smtp.as_ref().map(|s| s.port).unwrap_or_else(default_smtp_port),
            };
            self.smtp = Some(SmtpConfig {
                host,
                port,
                username: lookup("SMTP_USERNAME"),
                password: lookup("SMTP_PASSWORD"),
            });
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(ReportError::Config("DATABASE_URL must be set".to_string()));
        }
        if !self.database_url.starts_with("sqlite:") {
            return Err(ReportError::Config(
                "DATABASE_URL must start with 'sqlite:'".to_string(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ReportError::Config(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.max_queued_jobs < self.max_concurrent_jobs {
            return Err(ReportError::Config(
                "max_queued_jobs must not be smaller than max_concurrent_jobs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_secs)
    }
}

fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("petra-reports").join("config.toml"))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ReportError::Config(format!("{} must be a number, got '{}'", key, value)))
}
