//! Ledger configuration: YAML file, then environment overrides, then CLI flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use metric_ledger_core::{MetricKind, DEFAULT_HISTORY_INTERVAL_DAYS};
use serde::{Deserialize, Serialize};

pub const ENV_WORKER_URL: &str = "METRIC_LEDGER_WORKER_URL";
pub const ENV_SQLITE_PATH: &str = "METRIC_LEDGER_DB";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Worker,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sqlite_path: PathBuf,
    pub worker_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            sqlite_path: PathBuf::from("./metric_ledger.sqlite3"),
            worker_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeyConfig {
    pub registry: String,
    pub leetcode_problems: String,
    pub leetcode_rating: String,
    pub github_contributions: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            registry: "users:list".to_string(),
            leetcode_problems: MetricKind::LeetcodeProblems.default_dataset_key().to_string(),
            leetcode_rating: MetricKind::LeetcodeRating.default_dataset_key().to_string(),
            github_contributions: MetricKind::GithubContributions.default_dataset_key().to_string(),
        }
    }
}

impl KeyConfig {
    #[must_use]
    pub fn dataset(&self, metric: MetricKind) -> &str {
        match metric {
            MetricKind::LeetcodeProblems => &self.leetcode_problems,
            MetricKind::LeetcodeRating => &self.leetcode_rating,
            MetricKind::GithubContributions => &self.github_contributions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HistoryConfig {
    pub interval_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { interval_days: DEFAULT_HISTORY_INTERVAL_DAYS }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_secs: 30, user_agent: format!("metric-ledger/{}", env!("CARGO_PKG_VERSION")) }
    }
}

impl HttpConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Names of the environment variables holding platform credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CredentialsConfig {
    pub github_token_env: String,
    pub leetcode_session_env: String,
    pub leetcode_csrf_env: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            github_token_env: "GITHUB_PAT".to_string(),
            leetcode_session_env: "LEETCODE_SESSION".to_string(),
            leetcode_csrf_env: "LEETCODE_CSRF_TOKEN".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct LedgerConfig {
    pub store: StoreConfig,
    pub keys: KeyConfig,
    pub history: HistoryConfig,
    pub http: HttpConfig,
    pub credentials: CredentialsConfig,
}

impl LedgerConfig {
    /// Parse a YAML configuration document.
    ///
    /// # Errors
    /// Returns an error when the document is not valid configuration YAML.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("failed to parse ledger configuration")
    }

    /// Load configuration from an optional YAML file, then apply process environment overrides.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                Self::from_yaml_str(&raw)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Apply `METRIC_LEDGER_WORKER_URL` and `METRIC_LEDGER_DB` through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_SQLITE_PATH).filter(|value| !value.trim().is_empty()) {
            self.store.sqlite_path = PathBuf::from(path);
        }
        if let Some(url) = lookup(ENV_WORKER_URL).filter(|value| !value.trim().is_empty()) {
            self.store.backend = StoreBackend::Worker;
            self.store.worker_url = Some(url);
        }
    }

    /// # Errors
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.history.interval_days == 0 {
            return Err(anyhow!("history.interval_days MUST be >= 1"));
        }
        if self.http.timeout_secs == 0 {
            return Err(anyhow!("http.timeout_secs MUST be >= 1"));
        }

        let keys = [
            ("keys.registry", &self.keys.registry),
            ("keys.leetcode_problems", &self.keys.leetcode_problems),
            ("keys.leetcode_rating", &self.keys.leetcode_rating),
            ("keys.github_contributions", &self.keys.github_contributions),
        ];
        for (name, value) in keys {
            if value.trim().is_empty() {
                return Err(anyhow!("{name} MUST be non-empty"));
            }
        }

        if self.store.backend == StoreBackend::Worker
            && self.store.worker_url.as_deref().map_or(true, |url| url.trim().is_empty())
        {
            return Err(anyhow!("store.worker_url is required when store.backend is worker"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let config = LedgerConfig::default();

        config.validate()?;
        assert_eq!(config.keys.registry, "users:list");
        assert_eq!(config.keys.dataset(MetricKind::LeetcodeRating), "leetcode:rating");
        assert_eq!(config.history.interval_days, 7);
        assert_eq!(config.http.timeout(), Duration::from_secs(30));
        Ok(())
    }

    #[test]
    fn partial_yaml_keeps_remaining_defaults() -> Result<()> {
        let config = LedgerConfig::from_yaml_str(
            "store:\n  sqlite_path: /var/lib/ledger.sqlite3\nkeys:\n  github_contributions: github:data\n",
        )?;

        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.sqlite_path, PathBuf::from("/var/lib/ledger.sqlite3"));
        assert_eq!(config.keys.dataset(MetricKind::GithubContributions), "github:data");
        assert_eq!(config.keys.dataset(MetricKind::LeetcodeProblems), "leetcode:problems");
        assert_eq!(config.credentials.github_token_env, "GITHUB_PAT");
        Ok(())
    }

    #[test]
    fn worker_url_env_switches_backend() -> Result<()> {
        let mut config = LedgerConfig::default();

        config.apply_env_overrides(|name| match name {
            ENV_WORKER_URL => Some("https://kv.example.test".to_string()),
            ENV_SQLITE_PATH => Some("/tmp/other.sqlite3".to_string()),
            _ => None,
        });

        config.validate()?;
        assert_eq!(config.store.backend, StoreBackend::Worker);
        assert_eq!(config.store.worker_url.as_deref(), Some("https://kv.example.test"));
        assert_eq!(config.store.sqlite_path, PathBuf::from("/tmp/other.sqlite3"));
        Ok(())
    }

    #[test]
    fn validation_rejects_bad_settings() -> Result<()> {
        let zero_interval = LedgerConfig::from_yaml_str("history:\n  interval_days: 0\n")?;
        assert!(zero_interval.validate().is_err());

        let zero_timeout = LedgerConfig::from_yaml_str("http:\n  timeout_secs: 0\n")?;
        assert!(zero_timeout.validate().is_err());

        let blank_key = LedgerConfig::from_yaml_str("keys:\n  registry: ' '\n")?;
        assert!(blank_key.validate().is_err());

        let worker_without_url = LedgerConfig::from_yaml_str("store:\n  backend: worker\n")?;
        assert!(worker_without_url.validate().is_err());
        Ok(())
    }

    #[test]
    fn unknown_backend_is_a_parse_error() {
        assert!(LedgerConfig::from_yaml_str("store:\n  backend: redis\n").is_err());
    }
}
