#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8090;
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// File names resolved relative to the data root.
pub const TOKENS_DB_FILE: &str = "tokens.db";
pub const SIGNING_KEY_FILE: &str = "signing.key";
pub const DOWNLOADS_SUBDIR: &str = "downloads";

/// Harvest polling defaults: 60 scans 500ms apart, 30 seconds total.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_POLL_ATTEMPTS: u32 = 60;

/// Everything the binaries need at startup, resolved from CLI overrides,
/// process environment and the `.env` file (in that precedence order).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub admin_email: String,
    pub admin_password: String,
    pub signing_key_path: PathBuf,
    pub chrome_bin: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub poll_attempts: u32,
}

impl RuntimeConfig {
    pub fn tokens_db_path(&self) -> PathBuf {
        self.data_root.join(TOKENS_DB_FILE)
    }

    pub fn downloads_root(&self) -> PathBuf {
        self.data_root.join(DOWNLOADS_SUBDIR)
    }
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(RuntimeOverrides::default())
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

/// Resolves only the data root, for maintenance binaries that never touch the
/// admin credentials or the HTTP listener.
pub fn resolve_data_root(override_path: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        return Ok(path);
    }
    let file_vars = read_env_file(Path::new(DEFAULT_ENV_PATH))?;
    lookup_value("CLIPGATE_DATA_ROOT", &file_vars, &env_var_string)
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("CLIPGATE_DATA_ROOT not set"))
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let data_root = overrides
        .data_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("CLIPGATE_DATA_ROOT", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("CLIPGATE_DATA_ROOT not set"))?;
    let data_root = PathBuf::from(data_root);

    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("CLIPGATE_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = overrides
        .port
        .or_else(|| {
            lookup_value("CLIPGATE_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);

    let admin_email = lookup_value("CLIPGATE_ADMIN_EMAIL", file_vars, &env_lookup)
        .ok_or_else(|| anyhow!("CLIPGATE_ADMIN_EMAIL not set"))?;
    let admin_password = lookup_value("CLIPGATE_ADMIN_PASSWORD", file_vars, &env_lookup)
        .ok_or_else(|| anyhow!("CLIPGATE_ADMIN_PASSWORD not set"))?;

    let signing_key_path = lookup_value("CLIPGATE_SIGNING_KEY", file_vars, &env_lookup)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_root.join(SIGNING_KEY_FILE));

    let chrome_bin = lookup_value("CLIPGATE_CHROME_BIN", file_vars, &env_lookup)
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from);

    let poll_interval_ms = lookup_value("CLIPGATE_POLL_INTERVAL_MS", file_vars, &env_lookup)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    let poll_attempts = lookup_value("CLIPGATE_POLL_ATTEMPTS", file_vars, &env_lookup)
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_POLL_ATTEMPTS);

    Ok(RuntimeConfig {
        data_root,
        host,
        port,
        admin_email,
        admin_password,
        signing_key_path,
        chrome_bin,
        poll_interval_ms,
        poll_attempts,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
