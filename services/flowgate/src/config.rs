//! Configuration types and loading
//!
//! Config path precedence: `--config` CLI arg > `CONFIG_PATH` env var >
//! `flowgate.toml`. Every option has a default and a validated range.
//! The admin API key is loaded from the FLOWGATE_ADMIN_KEY env var or
//! `admin_key_file`, never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use worker_pool::{PoolSettings, RefreshSettings};

const ADMIN_KEY_ENV: &str = "FLOWGATE_ADMIN_KEY";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub admin_listen_addr: SocketAddr,
    pub max_connections: usize,
    /// Path to a file containing the admin key (alternative to FLOWGATE_ADMIN_KEY)
    pub admin_key_file: Option<PathBuf>,
    #[serde(skip)]
    pub admin_key: Option<Secret<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            admin_listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            max_connections: 1000,
            admin_key_file: None,
            admin_key: None,
        }
    }
}

/// Upstream generation and identity endpoints
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_image_timeout")]
    pub image_timeout_secs: u64,
    #[serde(default = "default_video_timeout")]
    pub video_timeout_secs: u64,
    #[serde(default = "default_identity_url")]
    pub identity_url: String,
}

fn default_image_timeout() -> u64 {
    300
}

fn default_video_timeout() -> u64 {
    1500
}

fn default_identity_url() -> String {
    flow_auth::SESSION_ENDPOINT.to_string()
}

impl UpstreamConfig {
    pub fn timeout(&self, kind: upstream::Kind) -> Duration {
        match kind {
            upstream::Kind::Image => Duration::from_secs(self.image_timeout_secs),
            upstream::Kind::Video => Duration::from_secs(self.video_timeout_secs),
        }
    }
}

/// Worker pool settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub store_path: PathBuf,
    pub error_ban_threshold: u32,
    pub rate_limit_ban_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_select_attempts: usize,
    pub default_image_concurrency: i32,
    pub default_video_concurrency: i32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("data/workers.json"),
            error_ban_threshold: 3,
            rate_limit_ban_secs: 3600,
            sweep_interval_secs: 3600,
            max_select_attempts: 3,
            default_image_concurrency: -1,
            default_video_concurrency: -1,
        }
    }
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            error_threshold: self.error_ban_threshold,
            rate_limit_ban: Duration::from_secs(self.rate_limit_ban_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            max_select_attempts: self.max_select_attempts,
        }
    }
}

/// Background credential refresh settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub enabled: bool,
    pub buffer_secs: u64,
    pub min_sleep_secs: u64,
    pub fallback_secs: u64,
    pub stagger_secs: u64,
    pub job_budget_secs: u64,
    pub workers: usize,
    /// Directory holding one cached browser session file per worker
    pub session_dir: PathBuf,
    /// Helper program that renews a session; receives the session file path
    /// as its last argument and prints the new refresh credential
    pub command: Option<String>,
    pub args: Vec<String>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_secs: 7200,
            min_sleep_secs: 10,
            fallback_secs: 3600,
            stagger_secs: 5,
            job_budget_secs: 300,
            workers: 2,
            session_dir: PathBuf::from("data/sessions"),
            command: None,
            args: Vec::new(),
        }
    }
}

impl RefreshConfig {
    pub fn settings(&self) -> RefreshSettings {
        RefreshSettings {
            buffer: Duration::from_secs(self.buffer_secs),
            min_sleep: Duration::from_secs(self.min_sleep_secs),
            fallback: Duration::from_secs(self.fallback_secs),
            stagger: Duration::from_secs(self.stagger_secs),
            job_budget: Duration::from_secs(self.job_budget_secs),
            workers: self.workers,
        }
    }
}

fn non_zero(field: &'static str, value: u64) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::out_of_range(field, "must be greater than 0"));
    }
    Ok(())
}

fn concurrency(field: &'static str, value: i32) -> common::Result<()> {
    if value < -1 {
        return Err(common::Error::out_of_range(
            field,
            format!("must be -1 (unlimited), 0 (disabled) or positive, got {value}"),
        ));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve the
    /// admin key.
    ///
    /// Admin key resolution order:
    /// 1. FLOWGATE_ADMIN_KEY env var
    /// 2. admin_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        let env_key = std::env::var(ADMIN_KEY_ENV)
            .ok()
            .map(|key| key.trim().to_owned())
            .filter(|key| !key.is_empty());
        if let Some(key) = env_key {
            config.server.admin_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.server.admin_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read admin_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.server.admin_key = Some(Secret::new(key));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.upstream.base_url
            )));
        }
        if !self.upstream.identity_url.starts_with("http://")
            && !self.upstream.identity_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "identity_url must start with http:// or https://, got: {}",
                self.upstream.identity_url
            )));
        }
        non_zero("image_timeout_secs", self.upstream.image_timeout_secs)?;
        non_zero("video_timeout_secs", self.upstream.video_timeout_secs)?;
        non_zero("max_connections", self.server.max_connections as u64)?;

        let pool = &self.pool;
        if !(1..=1000).contains(&pool.error_ban_threshold) {
            return Err(common::Error::out_of_range(
                "error_ban_threshold",
                format!("must be 1..=1000, got {}", pool.error_ban_threshold),
            ));
        }
        if !(1..=10).contains(&pool.max_select_attempts) {
            return Err(common::Error::out_of_range(
                "max_select_attempts",
                format!("must be 1..=10, got {}", pool.max_select_attempts),
            ));
        }
        non_zero("rate_limit_ban_secs", pool.rate_limit_ban_secs)?;
        non_zero("sweep_interval_secs", pool.sweep_interval_secs)?;
        concurrency("default_image_concurrency", pool.default_image_concurrency)?;
        concurrency("default_video_concurrency", pool.default_video_concurrency)?;

        let refresh = &self.refresh;
        if !(1..=8).contains(&refresh.workers) {
            return Err(common::Error::out_of_range(
                "workers",
                format!("must be 1..=8, got {}", refresh.workers),
            ));
        }
        non_zero("buffer_secs", refresh.buffer_secs)?;
        non_zero("min_sleep_secs", refresh.min_sleep_secs)?;
        non_zero("fallback_secs", refresh.fallback_secs)?;
        non_zero("job_budget_secs", refresh.job_budget_secs)?;
        if refresh.enabled && refresh.command.as_deref().is_some_and(str::is_empty) {
            return Err(common::Error::Config("refresh command must not be empty".into()));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("flowgate.toml")
    }
}
