//! Process configuration from environment variables (`.env` is loaded by
//! `main` before this runs).

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::provider::OpenAiSettings;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// In-memory storage is used when unset.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub port: u16,
    pub model: OpenAiSettings,
    pub lesson_batch_size: usize,
    pub job_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = get("MODEL_API_KEY").ok_or(ConfigError::Missing("MODEL_API_KEY"))?;
        let model = OpenAiSettings {
            base_url: get("MODEL_API_BASE").unwrap_or_else(|| "https://api.openai.com/v1".into()),
            api_key,
            model: get("MODEL_NAME").unwrap_or_else(|| "gpt-4o-mini".into()),
            embedding_model: get("EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".into()),
            timeout: Duration::from_secs(parse_or(&get, "MODEL_TIMEOUT_SECS", 120)?),
            max_retries: parse_or(&get, "MODEL_MAX_RETRIES", 2)?,
            requests_per_minute: parse_or(&get, "MODEL_REQUESTS_PER_MINUTE", 60)?,
        };

        let lesson_batch_size: usize = parse_or(&get, "LESSON_BATCH_SIZE", 2)?;
        if lesson_batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "LESSON_BATCH_SIZE",
                value: "0".into(),
            });
        }

        Ok(Config {
            database_url: get("DATABASE_URL"),
            db_max_connections: parse_or(&get, "DB_MAX_CONNECTIONS", 10)?,
            port: parse_or(&get, "PORT", 8081)?,
            model,
            lesson_batch_size,
            job_timeout: Duration::from_secs(parse_or(&get, "JOB_TIMEOUT_SECS", 3600)?),
        })
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}
