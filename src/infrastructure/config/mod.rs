//! Configuration loading with hierarchical merging and environment
//! variable interpolation.
//!
//! Precedence (lowest to highest): programmatic defaults, `foreman.yaml`,
//! `foreman.local.yaml`, then `FOREMAN_`-prefixed environment variables.
//! `${VAR}` in the YAML is required (load fails when unset);
//! `${VAR:-default}` falls back.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::scheduler::ScheduleConfig;
use crate::services::watchdog::ExpiryPolicy;
use crate::services::webhook::WebhookSubscriber;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is not set and has no default")]
    MissingEnvVar(String),

    #[error("Unterminated interpolation near byte {0}")]
    UnterminatedInterpolation(usize),

    #[error("Invalid wip limit for {0}: must be at least 1")]
    InvalidWipLimit(String),

    #[error("Invalid lease_ttl_secs: must be at least 1")]
    InvalidLeaseTtl,

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: ".foreman/foreman.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Per-task-type WIP ceilings; the "default" key bounds everything else
    pub wip_limits: HashMap<String, usize>,
    pub lease_ttl_secs: u64,
    pub heartbeat_secs: u64,
    pub tick_ms: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        let mut wip_limits = HashMap::new();
        wip_limits.insert("default".to_string(), 2);
        Self {
            wip_limits,
            lease_ttl_secs: 120,
            heartbeat_secs: 30,
            tick_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogSettings {
    pub interval_secs: u64,
    pub grace_secs: u64,
    pub policy: ExpiryPolicy,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            grace_secs: 5,
            policy: ExpiryPolicy::Requeue,
        }
    }
}

/// Root configuration for the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub watchdog: WatchdogSettings,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
    #[serde(default)]
    pub webhooks: Vec<WebhookSubscriber>,
}

/// Substitute `${VAR}` and `${VAR:-default}` against the process
/// environment.
pub fn interpolate_env(raw: &str) -> Result<String, ConfigError> {
    interpolate_with(raw, |name| std::env::var(name).ok())
}

fn interpolate_with(
    raw: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    let mut offset = 0;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let close = after
            .find('}')
            .ok_or(ConfigError::UnterminatedInterpolation(offset + start))?;
        let body = &after[..close];
        let (name, default) = match body.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (body, None),
        };
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => match default {
                Some(default) => out.push_str(default),
                None => return Err(ConfigError::MissingEnvVar(name.to_string())),
            },
        }
        offset += start + 2 + close + 1;
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load() -> Result<Config> {
        Self::load_from(Path::new("foreman.yaml"), Path::new("foreman.local.yaml"))
    }

    pub fn load_from(primary: &Path, local: &Path) -> Result<Config> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        for path in [primary, local] {
            if path.exists() {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let interpolated = interpolate_env(&raw)
                    .with_context(|| format!("interpolation failed in {}", path.display()))?;
                figment = figment.merge(Yaml::string(&interpolated));
            }
        }

        let config: Config = figment
            .merge(Env::prefixed("FOREMAN_").split("__"))
            .extract()
            .context("failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), ConfigError> {
        for (task_type, limit) in &config.dispatcher.wip_limits {
            if *limit == 0 {
                return Err(ConfigError::InvalidWipLimit(task_type.clone()));
            }
        }
        if config.dispatcher.lease_ttl_secs == 0 {
            return Err(ConfigError::InvalidLeaseTtl);
        }
        match config.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
        Ok(())
    }
}
