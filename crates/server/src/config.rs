use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone)]
pub struct HubConfig {
    pub bind: String,
    pub postgres_dsn: String,
    /// Interval of the server-to-client liveness probe.
    pub keepalive_secs: u64,
    /// Sockets silent for longer than this are closed. Floored at 60s.
    pub idle_timeout_secs: u64,
}

/// Loads hub configuration from the filesystem with environment overrides.
pub fn load_configuration(path: &Path) -> Result<HubConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let bind = required(override_env("FLUX_BIND", map.remove("server.bind"))?)?;
    let postgres_dsn = required(override_env(
        "FLUX_PG_DSN",
        map.remove("storage.postgres_dsn"),
    )?)?;
    let keepalive_secs = override_env("FLUX_KEEPALIVE", map.remove("server.keepalive"))?
        .unwrap_or_else(|| "30".to_string())
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid)?;
    let idle_timeout_secs = override_env("FLUX_IDLE_TIMEOUT", map.remove("server.idle_timeout"))?
        .unwrap_or_else(|| "120".to_string())
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid)?
        .max(60);

    Ok(HubConfig {
        bind,
        postgres_dsn,
        keepalive_secs,
        idle_timeout_secs,
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}
