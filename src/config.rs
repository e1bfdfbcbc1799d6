use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::access::{AccessError, AllowList};
use crate::pipeline::backend_ops::{WebUiBackendOps, DEFAULT_SAMPLER, DEFAULT_STEPS};
use crate::pipeline::descriptors::DEFAULT_UPSCALER;

pub const DEFAULT_BIND: &str = "127.0.0.1:8790";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotConfig {
    pub sd_host: String,
    pub sd_port: u16,
    pub sd_use_https: bool,
    pub sampler: String,
    pub steps: u32,
    pub upscaler: String,
    pub allowed_user_ids: String,
    pub admin_user_ids: String,
    pub max_concurrency: i64,
    pub max_queue_depth: i64,
    pub bind: SocketAddr,
    pub backend_timeout_secs: u64,
}

impl BotConfig {
    /// Process environment first, then `.env` in `app_root`.
    pub fn from_env(app_root: &Path) -> Result<Self, ConfigError> {
        let dotenv = load_dotenv_map(app_root)?;
        Self::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| dotenv.get(key).cloned())
        })
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let sd_host = get("SD_HOST").ok_or(ConfigError::Missing("SD_HOST"))?;
        let bind_raw = get("SDBOT_BIND").unwrap_or_else(|| String::from(DEFAULT_BIND));
        let bind = bind_raw
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::Invalid {
                key: "SDBOT_BIND",
                value: bind_raw.clone(),
            })?;
        let allowed_user_ids = get("ALLOWED_USER_IDS").unwrap_or_else(|| String::from("*"));
        let admin_user_ids = get("ADMIN_USER_IDS").unwrap_or_else(|| String::from("-"));

        let config = Self {
            sd_host,
            sd_port: parse_or("SD_PORT", get("SD_PORT"), 80)?,
            sd_use_https: parse_bool("SD_USE_HTTPS", get("SD_USE_HTTPS"))?,
            sampler: get("SD_SAMPLER").unwrap_or_else(|| String::from(DEFAULT_SAMPLER)),
            steps: parse_or("SD_STEPS", get("SD_STEPS"), DEFAULT_STEPS)?,
            upscaler: get("SD_UPSCALER").unwrap_or_else(|| String::from(DEFAULT_UPSCALER)),
            allowed_user_ids,
            admin_user_ids,
            max_concurrency: parse_or("MAX_CONCURRENCY", get("MAX_CONCURRENCY"), 1)?,
            max_queue_depth: parse_or("MAX_QUEUE_DEPTH", get("MAX_QUEUE_DEPTH"), 10)?,
            bind,
            backend_timeout_secs: parse_or(
                "BACKEND_TIMEOUT_SECS",
                get("BACKEND_TIMEOUT_SECS"),
                300,
            )?,
        };
        config.access_policy()?;
        config.base_url()?;
        Ok(config)
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let scheme = if self.sd_use_https { "https" } else { "http" };
        let raw = format!("{scheme}://{}:{}/", self.sd_host, self.sd_port);
        Url::parse(raw.as_str()).map_err(|_| ConfigError::Invalid {
            key: "SD_HOST",
            value: self.sd_host.clone(),
        })
    }

    pub fn access_policy(&self) -> Result<AllowList, ConfigError> {
        Ok(AllowList::parse(
            self.allowed_user_ids.as_str(),
            self.admin_user_ids.as_str(),
        )?)
    }

    pub fn backend(&self) -> Result<WebUiBackendOps, ConfigError> {
        Ok(WebUiBackendOps::new(self.base_url()?)
            .with_sampler(self.sampler.clone())
            .with_default_steps(self.steps)
            .with_upscaler(self.upscaler.clone())
            .with_timeout(Duration::from_secs(self.backend_timeout_secs)))
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn parse_bool(key: &'static str, raw: Option<String>) -> Result<bool, ConfigError> {
    let Some(value) = raw else {
        return Ok(false);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { key, value }),
    }
}

fn load_dotenv_map(app_root: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let path = app_root.join(".env");
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path)?;
    Ok(parse_dotenv(raw.as_str()))
}

/// `KEY=value` lines; `export ` prefixes, quotes and trailing ` #` comments
/// are stripped.
pub fn parse_dotenv(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let line = line.strip_prefix("export ").map_or(line, str::trim_start);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value = value.trim();
            let unquoted = ['"', '\'']
                .iter()
                .find_map(|quote| {
                    value
                        .strip_prefix(*quote)
                        .and_then(|rest| rest.strip_suffix(*quote))
                })
                .map(str::to_string)
                .unwrap_or_else(|| {
                    value
                        .split_once(" #")
                        .map_or(value, |(before, _)| before.trim_end())
                        .to_string()
                });
            Some((key.to_string(), unquoted))
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("failed to read .env: {0}")]
    Io(#[from] std::io::Error),
}
