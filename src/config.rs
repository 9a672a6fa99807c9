#![forbid(unsafe_code)]

//! Runtime configuration for the backend binary.
//!
//! Values resolve in order: explicit override (CLI flag) > process
//! environment > `.env` file > built-in default. Every key is optional; the
//! server can start with no configuration at all and talk to `yt-dlp` from
//! the executable search path.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_SCRATCH_DIR: &str = "downloads";
/// Resolved from PATH unless overridden via `YT_DLP_PATH`.
pub const DEFAULT_YT_DLP: &str = "yt-dlp";

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub yt_dlp_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub yt_dlp_path: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_settings(&file_vars, env_var_string, overrides))
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let yt_dlp_path = overrides
        .yt_dlp_path
        .or_else(|| lookup_value("YT_DLP_PATH", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP));
    let scratch_dir = overrides
        .scratch_dir
        .or_else(|| {
            lookup_value("TUBEFETCH_SCRATCH_DIR", file_vars, &env_lookup).map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRATCH_DIR));
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUBEFETCH_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .filter(|value| !value.trim().is_empty())
        .or_else(|| lookup_value("TUBEFETCH_HOST", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    RuntimeSettings {
        yt_dlp_path,
        scratch_dir,
        port,
        host,
    }
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

/// Reads a `KEY=value` env file, tolerating comments, blank lines, `export `
/// prefixes and single or double quotes. A missing file is an empty map.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        if let Some((key, value)) = parse_env_line(line) {
            vars.insert(key, value);
        }
    }
    Ok(vars)
}

fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), unquote(value.trim()).to_string()))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
