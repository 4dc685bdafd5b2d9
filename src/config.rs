//! Environment-driven configuration.
//!
//! Values come from the process environment, optionally seeded from a `.env`
//! file by the binary. [`Config::from_lookup`] accepts any lookup function so
//! tests never touch the real environment.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::harvest::aggregator::RECORD_QUEUE_CAPACITY;
use crate::traits::{SearchQuery, SortOrder};

pub const DEFAULT_LANGUAGE: &str = "abap";
pub const DEFAULT_KEYWORDS: &[&str] = &["*", "abap", "sap", "program"];
pub const DEFAULT_API_URL: &str = "https://api.github.com";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),
    #[error("Invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for cloned working trees
    pub repo_dir: PathBuf,
    pub manifest_file: PathBuf,
    pub labeled_data_dir: PathBuf,
    /// Minimum repository size passed to discovery
    pub repo_size_kb: u64,
    pub language: String,
    pub file_suffix: String,
    pub keywords: Vec<String>,
    pub sorts: Vec<SortOrder>,
    pub github_token: Option<String>,
    pub github_api_url: String,
    pub queue_capacity: usize,
    pub max_concurrent_workers: Option<usize>,
    /// Applies to the clone step of each repository
    pub worker_timeout: Option<Duration>,
    pub shallow_clone: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values count as unset.
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let language = get("TARGET_LANGUAGE").unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
        let file_suffix = get("FILE_SUFFIX").unwrap_or_else(|| format!(".{}", language));

        let keywords = match get("SEARCH_KEYWORDS") {
            Some(raw) => split_list(&raw),
            None => DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        };
        let sorts = match get("SEARCH_SORTS") {
            Some(raw) => split_list(&raw)
                .iter()
                .map(|s| {
                    s.parse().map_err(|reason| ConfigError::Invalid {
                        var: "SEARCH_SORTS",
                        value: raw.clone(),
                        reason,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![SortOrder::BestMatch],
        };

        Ok(Self {
            repo_dir: PathBuf::from(required("REPO_DIR")?),
            manifest_file: PathBuf::from(required("MANIFEST_FILE")?),
            labeled_data_dir: PathBuf::from(required("LABELED_DATA_DIR")?),
            repo_size_kb: parse_or("REPO_SIZE_KB", get("REPO_SIZE_KB"), 0)?,
            language,
            file_suffix,
            keywords,
            sorts,
            github_token: get("GITHUB_TOKEN"),
            github_api_url: get("GITHUB_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            queue_capacity: parse_or(
                "QUEUE_CAPACITY",
                get("QUEUE_CAPACITY"),
                RECORD_QUEUE_CAPACITY,
            )?,
            max_concurrent_workers: parse_opt(
                "MAX_CONCURRENT_WORKERS",
                get("MAX_CONCURRENT_WORKERS"),
            )?,
            worker_timeout: parse_opt("WORKER_TIMEOUT_SECS", get("WORKER_TIMEOUT_SECS"))?
                .map(Duration::from_secs),
            shallow_clone: parse_bool("SHALLOW_CLONE", get("SHALLOW_CLONE"))?,
        })
    }

    /// Discovery queries: every keyword with every sort order.
    pub fn search_queries(&self) -> Vec<SearchQuery> {
        SearchQuery::matrix(&self.keywords, &self.sorts, &self.language, self.repo_size_kb)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_opt<T>(var: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value: v.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_or<T>(var: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(var, value)?.unwrap_or(default))
}

fn parse_bool(var: &'static str, value: Option<String>) -> Result<bool, ConfigError> {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            var,
            value: v,
            reason: "expected a boolean".to_string(),
        }),
    }
}
