//! Runtime configuration
//!
//! Loaded in three layers, later ones winning:
//! 1. `~/.config/deskmail/config.json` (every field optional)
//! 2. `DESKMAIL_*` environment variables
//! 3. command line flags, applied by the caller

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::MailError;

const CONFIG_DIR: &str = "deskmail";
const CONFIG_FILE: &str = "config.json";

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub client_secret_path: PathBuf,
    pub scopes: Vec<String>,
    pub query: String,
    pub page_size: u32,
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    pub refresh_skew_secs: i64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub api_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_secret_path: PathBuf::from("client_secret.json"),
            scopes: vec!["https://mail.google.com/".to_string()],
            query: "is:unread label:inbox".to_string(),
            page_size: 100,
            concurrency: 4,
            request_timeout_secs: 30,
            refresh_skew_secs: 60,
            max_attempts: 4,
            base_backoff_ms: 250,
            max_backoff_ms: 8_000,
            api_base_url: GMAIL_API_BASE.to_string(),
        }
    }
}

impl Config {
    /// Default file if present, then environment overrides.
    pub fn load() -> Result<Self, MailError> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// `~/.config/deskmail/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn from_file(path: &Path) -> Result<Self, MailError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MailError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
            .map_err(|e| MailError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(json: &str) -> Result<Self, MailError> {
        serde_json::from_str(json).map_err(|e| MailError::Config(e.to_string()))
    }

    /// Override fields from environment-style lookups.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), MailError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("DESKMAIL_CLIENT_SECRET") {
            self.client_secret_path = PathBuf::from(path);
        }
        if let Some(query) = lookup("DESKMAIL_QUERY") {
            self.query = query;
        }
        if let Some(value) = lookup("DESKMAIL_CONCURRENCY") {
            self.concurrency = parse_env("DESKMAIL_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("DESKMAIL_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_env("DESKMAIL_TIMEOUT_SECS", &value)?;
        }
        if let Some(base) = lookup("DESKMAIL_API_BASE") {
            self.api_base_url = base.trim_end_matches('/').to_string();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), MailError> {
        if self.concurrency == 0 {
            return Err(MailError::Config("concurrency must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(MailError::Config("max_attempts must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(MailError::Config(
                "request_timeout_secs must be at least 1".into(),
            ));
        }
        if self.scopes.is_empty() {
            return Err(MailError::Config("at least one scope is required".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_skew_secs)
    }

    pub fn retry_policy(&self) -> crate::sync::RetryPolicy {
        crate::sync::RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, MailError> {
    value
        .trim()
        .parse()
        .map_err(|_| MailError::Config(format!("{} has invalid value {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_json(r#"{ "concurrency": 8, "query": "label:support" }"#).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.query, "label:support");
        assert_eq!(config.page_size, 100);
        assert_eq!(config.api_base_url, GMAIL_API_BASE);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DESKMAIL_CONCURRENCY", "2"),
            ("DESKMAIL_API_BASE", "http://localhost:9000/gmail/v1/"),
            ("DESKMAIL_QUERY", "in:anywhere"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.concurrency, 2);
        assert_eq!(config.api_base_url, "http://localhost:9000/gmail/v1");
        assert_eq!(config.query, "in:anywhere");
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = Config::default();
        let result = config.apply_env(|key| {
            (key == "DESKMAIL_TIMEOUT_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(MailError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = Config {
            concurrency: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "max_attempts": 2 }"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.max_attempts, 2);
        assert!(Config::from_file(&dir.path().join("missing.json")).is_err());
    }
}
