use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const BASE_URL_ENV: &str = "PARLOR_BASE_URL";

const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STALL_TIMEOUT_SECS: u64 = 60;
const DEFAULT_LOGIN_PATH: &str = "/auth/login";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Runtime settings for the network layer.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: Url,
    /// Upper bound on a single refresh cycle; a stuck refresh counts as failed.
    pub refresh_timeout: Duration,
    /// Longest silence tolerated between chat stream chunks.
    pub stall_timeout: Duration,
    pub login_path: String,
    pub log_level: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Parlor not configured: create parlor.yaml or set PARLOR_BASE_URL.")]
    Missing,
    #[error("Parlor configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Missing => {
                "Parlor not configured: create parlor.yaml or set PARLOR_BASE_URL.".to_string()
            }
            Self::Invalid(detail) => format!("Parlor not configured: {detail}. Update parlor.yaml."),
        }
    }
}

impl ClientSettings {
    /// Read `.env`, then `parlor.yaml`, then apply `PARLOR_BASE_URL`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_base_url(None)
    }

    /// Like [`ClientSettings::load`], with `base_url` taking precedence over the
    /// environment and the file.
    pub fn load_with_base_url(base_url: Option<&str>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let file = match locate_config_file() {
            Some(path) => Some(read_config_file(&path)?),
            None => None,
        };
        let base_url_override = base_url
            .map(str::to_string)
            .or_else(|| std::env::var(BASE_URL_ENV).ok());
        resolve_settings(file, base_url_override)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        resolve_settings(Some(read_config_file(path)?), None)
    }

    /// Defaults around an explicit base URL.
    pub fn for_base_url(base_url: &str) -> Result<Self, ConfigError> {
        resolve_settings(None, Some(base_url.to_string()))
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }
}

fn read_config_file(path: &Path) -> Result<ParlorConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
    })?;
    serde_yaml::from_str(&contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid parlor.yaml: {err}")))
}

fn resolve_settings(
    file: Option<ParlorConfig>,
    base_url_override: Option<String>,
) -> Result<ClientSettings, ConfigError> {
    let file = file.unwrap_or_default();
    let client = file.client.unwrap_or_default();
    let raw_url = base_url_override
        .or(client.base_url)
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or(ConfigError::Missing)?;
    let base_url = Url::parse(&raw_url)
        .map_err(|err| ConfigError::Invalid(format!("invalid base_url {raw_url:?}: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "base_url must be http or https, got {:?}",
            base_url.scheme()
        )));
    }

    let refresh_secs = client
        .refresh_timeout_secs
        .unwrap_or(DEFAULT_REFRESH_TIMEOUT_SECS);
    if refresh_secs == 0 {
        return Err(ConfigError::Invalid(
            "refresh_timeout_secs must be positive".to_string(),
        ));
    }
    let stall_secs = client.stall_timeout_secs.unwrap_or(DEFAULT_STALL_TIMEOUT_SECS);
    if stall_secs == 0 {
        return Err(ConfigError::Invalid(
            "stall_timeout_secs must be positive".to_string(),
        ));
    }

    let login_path = client
        .login_path
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .unwrap_or_else(|| DEFAULT_LOGIN_PATH.to_string());
    let log_level = file
        .logging
        .and_then(|logging| logging.level)
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

    Ok(ClientSettings {
        base_url,
        refresh_timeout: Duration::from_secs(refresh_secs),
        stall_timeout: Duration::from_secs(stall_secs),
        login_path,
        log_level,
    })
}

fn locate_config_file() -> Option<PathBuf> {
    parlor_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn parlor_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("parlor");
        paths.push(config_dir.join("parlor.yaml"));
        paths.push(config_dir.join("parlor.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".parlor").join("parlor.yaml"));
        paths.push(home_dir.join(".parlor").join("parlor.yml"));
    }
    paths.push(PathBuf::from("parlor.yaml"));
    paths.push(PathBuf::from("parlor.yml"));
    paths
}

#[derive(Debug, Default, Deserialize)]
struct ParlorConfig {
    client: Option<ClientSection>,
    logging: Option<LoggingSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ClientSection {
    base_url: Option<String>,
    refresh_timeout_secs: Option<u64>,
    stall_timeout_secs: Option<u64>,
    login_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingSection {
    level: Option<String>,
}
