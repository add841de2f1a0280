use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 6000))
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("playercache")
}

fn default_cache_quota_bytes() -> u64 {
    256 * 1024 * 1024 // 256 MiB
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_tls_handshake_timeout() -> u64 {
    10
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_playlist_size() -> usize {
    8 * 1024 * 1024
}

fn default_chunk_queue_depth() -> usize {
    16
}

fn default_index_failure_threshold() -> u32 {
    3
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    #[serde(default = "default_cache_quota_bytes")]
    pub cache_quota_bytes: u64,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_tls_handshake_timeout")]
    pub tls_handshake_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_playlist_size")]
    pub max_playlist_size: usize,
    #[serde(default = "default_chunk_queue_depth")]
    pub chunk_queue_depth: usize,
    #[serde(default = "default_index_failure_threshold")]
    pub index_failure_threshold: u32,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            storage_dir: default_storage_dir(),
            cache_quota_bytes: default_cache_quota_bytes(),
            log: default_log_format(),
            client_timeout: default_client_timeout(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            upstream_timeout: default_upstream_timeout(),
            tls_handshake_timeout: default_tls_handshake_timeout(),
            max_header_size: default_max_header_size(),
            max_playlist_size: default_max_playlist_size(),
            chunk_queue_depth: default_chunk_queue_depth(),
            index_failure_threshold: default_index_failure_threshold(),
            metrics_listen: None,
        }
    }
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        if let Some(path) = &config_path {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("PLAYERCACHE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = &config_path {
            settings.apply_base_dir(path);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.listen.ip().is_loopback(),
            "listen must be a loopback address (got {})",
            self.listen
        );
        if let Some(metrics) = self.metrics_listen {
            ensure!(
                metrics.ip().is_loopback(),
                "metrics_listen must be a loopback address (got {metrics})"
            );
        }
        ensure!(
            !self.storage_dir.as_os_str().is_empty(),
            "storage_dir must not be empty"
        );
        ensure!(
            self.cache_quota_bytes > 0,
            "cache_quota_bytes must be greater than 0 (got {})",
            self.cache_quota_bytes
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_playlist_size > 0,
            "max_playlist_size must be greater than 0 (got {})",
            self.max_playlist_size
        );
        ensure!(
            self.chunk_queue_depth > 0,
            "chunk_queue_depth must be at least 1 (got {})",
            self.chunk_queue_depth
        );
        ensure!(
            self.index_failure_threshold > 0,
            "index_failure_threshold must be at least 1 (got {})",
            self.index_failure_threshold
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        ensure!(
            self.tls_handshake_timeout > 0,
            "tls_handshake_timeout must be greater than 0 seconds (got {})",
            self.tls_handshake_timeout
        );
        Ok(())
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.storage_dir = absolutize(&self.storage_dir, base_dir);
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<Option<PathBuf>> {
    if let Some(path) = cli.config_path() {
        if !path.exists() {
            bail!("configuration file {} does not exist", path.display());
        }
        return Ok(Some(path.to_path_buf()));
    }

    let candidate = default_config_candidate();
    Ok(candidate.exists().then_some(candidate))
}

fn default_config_candidate() -> PathBuf {
    PathBuf::from("playercache.toml")
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
