use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, warn};
use worker_protocol::message::LogLevel;

use crate::error::ConfigError;

pub const WORKER_PATH: &str = "FLOWBOT_WORKER_PATH";
pub const WORKER_EXE: &str = "FLOWBOT_WORKER_EXE";
pub const HANDSHAKE_TIMEOUT_MS: &str = "FLOWBOT_HANDSHAKE_TIMEOUT_MS";
pub const REQUEST_TIMEOUT_MS: &str = "FLOWBOT_REQUEST_TIMEOUT_MS";
pub const CLOSE_TIMEOUT_MS: &str = "FLOWBOT_CLOSE_TIMEOUT_MS";
pub const LOG_LEVEL: &str = "FLOWBOT_LOG_LEVEL";
pub const LOG_DIR: &str = "FLOWBOT_LOG_DIR";

/// Where configuration values come from.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
}

impl EnvConfigManager {
    pub fn new(env_file: Option<PathBuf>) -> Box<Self> {
        match &env_file {
            Some(path) if path.exists() => {
                dotenvy::from_path(path).ok();
                info!("Loaded .env from {}", path.display());
            }
            Some(path) => warn!("could not load .env from {}", path.display()),
            None => {
                if let Ok(path) = dotenvy::dotenv() {
                    info!("Loaded .env from {}", path.display());
                }
            }
        }
        Box::new(Self { env_file })
    }

    pub fn env_file(&self) -> Option<&Path> {
        self.env_file.as_deref()
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "EnvConfigManager".to_string()
    }
}

/// In-memory values, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn del(&self, key: &str) {
        self.map.remove(key);
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Settings a session runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Worker install directory or executable, used when `open` gets none.
    pub worker_path: Option<PathBuf>,
    /// File name of the worker executable inside an install directory.
    pub worker_exe: String,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    /// Upper bound for `close` waiting on the final event.
    pub close_timeout: Duration,
    pub log_level: LogLevel,
    /// Forwarded to the worker so both sides log next to each other.
    pub log_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            worker_path: None,
            worker_exe: default_worker_exe(),
            handshake_timeout: Duration::from_millis(10_000),
            request_timeout: Duration::from_millis(30_000),
            close_timeout: Duration::from_millis(5_000),
            log_level: LogLevel::Info,
            log_dir: None,
        }
    }
}

pub fn default_worker_exe() -> String {
    format!("flowbot-worker{}", env::consts::EXE_SUFFIX)
}

impl ClientConfig {
    /// Reads every `FLOWBOT_*` key; unset keys keep their defaults.
    pub async fn load(manager: &ConfigManager) -> Result<Self, ConfigError> {
        let source = &manager.0;
        let mut config = ClientConfig::default();

        if let Some(path) = source.get(WORKER_PATH).await.filter(|v| !v.is_empty()) {
            config.worker_path = Some(PathBuf::from(path));
        }
        if let Some(exe) = source.get(WORKER_EXE).await.filter(|v| !v.is_empty()) {
            config.worker_exe = exe;
        }
        if let Some(v) = source.get(HANDSHAKE_TIMEOUT_MS).await {
            config.handshake_timeout = millis(HANDSHAKE_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = source.get(REQUEST_TIMEOUT_MS).await {
            config.request_timeout = millis(REQUEST_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = source.get(CLOSE_TIMEOUT_MS).await {
            config.close_timeout = millis(CLOSE_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = source.get(LOG_LEVEL).await {
            config.log_level = LogLevel::from_str(&v).map_err(|reason| ConfigError {
                key: LOG_LEVEL.to_string(),
                value: v.clone(),
                reason,
            })?;
        }
        if let Some(dir) = source.get(LOG_DIR).await.filter(|v| !v.is_empty()) {
            config.log_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }

    pub fn with_worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = Some(path.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

fn millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| ConfigError {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}
