use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_EMBEDDING_URL: &str = "TESTPILOT_EMBEDDING_URL";
pub const ENV_SIMILARITY_STORE: &str = "TESTPILOT_SIMILARITY_STORE";
pub const ENV_WORK_DIR: &str = "TESTPILOT_WORK_DIR";
pub const ENV_API_KEY: &str = "GEMINI_API_KEY";
pub const ENV_MODEL: &str = "TESTPILOT_MODEL";

const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Settings for every external collaborator, built once at startup and
/// shared by reference. Optional fields are validated by the collaborator
/// that needs them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub embedding_url: Option<String>,
    pub similarity_store: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub request_timeout_secs: u64,
    pub runner_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            embedding_url: None,
            similarity_store: None,
            work_dir: None,
            api_key: None,
            model: None,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            runner_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Load the config file (if any) and overlay the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path()?;

        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).map_err(|e| ConfigError::Unreadable {
                path: config_path.display().to_string(),
                reason: e.to_string(),
            })?;
            serde_json::from_str(&content).map_err(|e| ConfigError::Unreadable {
                path: config_path.display().to_string(),
                reason: e.to_string(),
            })?
        } else {
            Self::new()
        };

        Ok(config.with_env(std::env::vars()))
    }

    /// Overlay environment variables; blank values are ignored.
    pub fn with_env<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.as_str() {
                ENV_EMBEDDING_URL => self.embedding_url = Some(value.to_string()),
                ENV_SIMILARITY_STORE => self.similarity_store = Some(value.to_string()),
                ENV_WORK_DIR => self.work_dir = Some(PathBuf::from(value)),
                ENV_API_KEY => self.api_key = Some(value.to_string()),
                ENV_MODEL => self.model = Some(value.to_string()),
                _ => {}
            }
        }
        self
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path()?;
        let unwritable = |e: std::io::Error| ConfigError::Unreadable {
            path: config_path.display().to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).map_err(unwritable)?;
        }

        let content = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Invalid {
            field: "config",
            reason: e.to_string(),
        })?;
        fs::write(&config_path, content).map_err(unwritable)?;
        Ok(())
    }

    /// Remember the credential for the next session. The environment is not
    /// written back, only what was in the file plus the key.
    pub fn save_api_key(key: &str) -> Result<(), ConfigError> {
        let config_path = Self::config_path()?;
        let mut config = if config_path.exists() {
            fs::read_to_string(&config_path)
                .ok()
                .and_then(|c| serde_json::from_str::<Config>(&c).ok())
                .unwrap_or_default()
        } else {
            Self::new()
        };
        config.api_key = Some(key.to_string());
        config.save()
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir()
            .ok_or(ConfigError::Missing("user config directory"))?;

        Ok(config_dir.join("testpilot").join("config.json"))
    }

    /// Directory for log files of both processes.
    pub fn log_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("testpilot")
    }

    /// Working root: configured override, else the current directory.
    pub fn resolve_work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn require_embedding_url(&self) -> Result<&str, ConfigError> {
        self.embedding_url
            .as_deref()
            .ok_or(ConfigError::Missing(ENV_EMBEDDING_URL))
    }

    pub fn require_similarity_store(&self) -> Result<&str, ConfigError> {
        self.similarity_store
            .as_deref()
            .ok_or(ConfigError::Missing(ENV_SIMILARITY_STORE))
    }

    pub fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn runner_timeout(&self) -> Duration {
        Duration::from_secs(self.runner_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_overlay() {
        let config = Config::new().with_env(vars(&[
            (ENV_EMBEDDING_URL, "http://localhost:8000/embed"),
            (ENV_SIMILARITY_STORE, "/tmp/chunks.db"),
            (ENV_WORK_DIR, "/srv/project"),
            ("UNRELATED", "ignored"),
        ]));

        assert_eq!(
            config.require_embedding_url().unwrap(),
            "http://localhost:8000/embed"
        );
        assert_eq!(config.require_similarity_store().unwrap(), "/tmp/chunks.db");
        assert_eq!(config.resolve_work_dir(), PathBuf::from("/srv/project"));
    }

    #[test]
    fn test_blank_env_values_are_absent() {
        let config = Config::new().with_env(vars(&[(ENV_EMBEDDING_URL, "   ")]));
        assert_eq!(
            config.require_embedding_url(),
            Err(ConfigError::Missing(ENV_EMBEDDING_URL))
        );
    }

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.model_name(), DEFAULT_MODEL);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.runner_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"model":"gemini-1.5-pro"}"#).unwrap();
        assert_eq!(config.model_name(), "gemini-1.5-pro");
        assert_eq!(config.runner_timeout_secs, 30);
        assert!(config.embedding_url.is_none());
    }
}
