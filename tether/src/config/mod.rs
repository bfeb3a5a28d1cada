mod error;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use resolve_path::PathResolveExt;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
use snafu::ResultExt;
use tether_cli::config::LogConfig;

pub use self::error::Error;
use crate::controller::Backoff;

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    /// Interval after which every object is reconciled again.
    #[serde(default = "default_resync_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub resync_interval: Duration,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            resync_interval: default_resync_interval(),
            workers: WorkerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Number of concurrent reconciliations per watched kind.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub services: u16,

    #[serde(default = "default_workers")]
    pub pods: u16,

    #[serde(default = "default_workers")]
    pub endpoints: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { services: default_workers(), pods: default_workers(), endpoints: default_workers() }
    }
}

/// Backoff applied to objects whose reconciliation failed.
#[serde_as]
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(rename = "baseDelayMillis", default = "default_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,

    #[serde(rename = "maxDelaySeconds", default = "default_max_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self { Self { base_delay: default_base_delay(), max_delay: default_max_delay() } }
}

impl RetryConfig {
    pub const fn backoff(&self) -> Backoff { Backoff { base: self.base_delay, max: self.max_delay } }
}

impl Config {
    /// Returns the first existing configuration file among the default
    /// locations.
    pub fn search_config_file_path() -> Option<PathBuf> {
        std::iter::once(Self::default_path())
            .chain(tether_base::fallback_project_config_directories().into_iter().map(|mut path| {
                path.push(tether_base::CLI_CONFIG_NAME);
                path
            }))
            .find(|path| path.try_exists().unwrap_or(false))
    }

    #[inline]
    pub fn default_path() -> PathBuf {
        [tether_base::PROJECT_CONFIG_DIR.to_path_buf(), PathBuf::from(tether_base::CLI_CONFIG_NAME)]
            .into_iter()
            .collect()
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path
            .as_ref()
            .try_resolve()
            .map(|path| path.to_path_buf())
            .with_context(|_| error::ResolveFilePathSnafu { file_path: path.as_ref().to_path_buf() })?;
        let data = std::fs::read(&path).context(error::OpenConfigSnafu { filename: path.clone() })?;
        let mut config = Self::from_slice(&data).context(error::ParseConfigSnafu { filename: path })?;

        config.log.file_path = match config.log.file_path.map(|path| {
            path.try_resolve()
                .map(|path| path.to_path_buf())
                .with_context(|_| error::ResolveFilePathSnafu { file_path: path.clone() })
        }) {
            Some(Ok(path)) => Some(path),
            Some(Err(err)) => return Err(err),
            None => None,
        };

        Ok(config)
    }

    fn from_slice(data: &[u8]) -> Result<Self, serde_yaml::Error> {
        let mut config: Self = serde_yaml::from_slice(data)?;
        config.workers.services = config.workers.services.max(1);
        config.workers.pods = config.workers.pods.max(1);
        config.workers.endpoints = config.workers.endpoints.max(1);
        Ok(config)
    }

    /// The default configuration rendered as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn template_basic() -> Result<String, Error> {
        serde_yaml::to_string(&Self::default()).context(error::SerializeConfigSnafu)
    }
}

const fn default_resync_interval() -> Duration { Duration::from_secs(300) }

const fn default_workers() -> u16 { 2 }

const fn default_base_delay() -> Duration { Duration::from_millis(5) }

const fn default_max_delay() -> Duration { Duration::from_secs(300) }
