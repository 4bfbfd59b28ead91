//! Daemon configuration.
//!
//! Read from an optional JSON file, then overridden by `SANDBOX_*`
//! environment variables. The sandbox security profile is fixed; only the
//! image it runs is configurable.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::report::ReportingConfig;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_PATH_ENV: &str = "CODE_SANDBOX_CONFIG";

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub reporting: ReportingConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind.
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Job queue configuration (as read from JSON).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueConfig {
    /// Pending jobs held before submissions are rejected.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Concurrent sandbox units.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Hard upper bound on a single run, in seconds.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            workers: default_workers(),
            job_timeout_seconds: default_job_timeout(),
        }
    }
}

/// Sandbox image configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SandboxConfig {
    /// Image providing the python interpreter.
    #[serde(default = "default_image")]
    pub image: String,

    /// Pull the image at startup if it is missing.
    #[serde(default = "default_pull_on_start")]
    pub pull_on_start: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            pull_on_start: default_pull_on_start(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".into()
}

fn default_image() -> String {
    "python:alpine".into()
}

const fn default_capacity() -> usize {
    100
}

const fn default_workers() -> usize {
    10
}

const fn default_job_timeout() -> u64 {
    12
}

const fn default_pull_on_start() -> bool {
    true
}

impl Config {
    /// Load configuration from `path` (or defaults), apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse config JSON")
    }

    /// Apply `SANDBOX_*` overrides read through `lookup`.
    ///
    /// Values that do not parse are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = lookup("SANDBOX_BIND") {
            self.server.bind = bind;
        }
        if let Some(image) = lookup("SANDBOX_IMAGE") {
            self.sandbox.image = image;
        }
        override_parsed(&lookup, "SANDBOX_WORKERS", &mut self.queue.workers);
        override_parsed(&lookup, "SANDBOX_QUEUE_CAPACITY", &mut self.queue.capacity);
        override_parsed(&lookup, "SANDBOX_JOB_TIMEOUT", &mut self.queue.job_timeout_seconds);
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.queue.workers > 0, "queue.workers must be at least 1");
        anyhow::ensure!(self.queue.capacity > 0, "queue.capacity must be at least 1");
        anyhow::ensure!(
            self.queue.job_timeout_seconds > 0,
            "queue.job_timeout_seconds must be at least 1"
        );
        anyhow::ensure!(
            !self.sandbox.image.trim().is_empty(),
            "sandbox.image must not be empty"
        );
        Ok(())
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => warn!(key = %key, value = %raw, "Ignoring unparseable override"),
    }
}
