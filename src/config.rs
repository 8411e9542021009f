//! Caster configuration: a typed structure loaded from a TOML file with
//! environment-variable overrides, matching the keys enumerated in the
//! caster's external-interfaces spec.
//!
//! A mostly empty file is valid — every field carries a default mirroring the
//! original Python `config.ini` fallback behavior (`config.py`:
//! `get_config_value(section, key, fallback=...)`).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpKeepalive {
    pub enabled: bool,
    pub idle_secs: u64,
    pub interval_secs: u64,
    pub count: u32,
}

impl Default for TcpKeepalive {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_secs: 60,
            interval_secs: 10,
            count: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CasterLocation {
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for CasterLocation {
    fn default() -> Self {
        Self {
            country: "UNK".into(),
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
    pub contact: String,
    pub website: String,
}

impl Default for AppInfo {
    fn default() -> Self {
        Self {
            name: "NTRIP-Caster".into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            contact: "admin@example.com".into(),
            website: "https://example.com".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultAdmin {
    pub username: String,
    pub password: String,
}

impl Default for DefaultAdmin {
    fn default() -> Self {
        Self {
            username: "admin".into(),
            password: "admin".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: String,
    pub level: String,
    pub max_size_mb: u64,
    pub backup_count: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: "logs".into(),
            level: "info".into(),
            max_size_mb: 10,
            backup_count: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub ntrip_port: u16,
    pub web_port: u16,
    pub buffer_size: usize,
    pub max_connections: usize,
    pub max_user_connections_per_mount: usize,
    pub broadcast_interval_ms: u64,
    pub data_send_timeout_secs: u64,
    pub mount_timeout_secs: u64,
    pub client_timeout_secs: u64,
    pub ring_buffer_size: usize,
    pub catalog_path: String,
    pub mount_list_path: String,
    pub tcp_keepalive: TcpKeepalive,
    pub caster: CasterLocation,
    pub app: AppInfo,
    pub default_admin: DefaultAdmin,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            ntrip_port: 2101,
            web_port: 2102,
            buffer_size: 4096,
            max_connections: 512,
            max_user_connections_per_mount: 3,
            broadcast_interval_ms: 10,
            data_send_timeout_secs: 5,
            mount_timeout_secs: 180,
            client_timeout_secs: 180,
            ring_buffer_size: 2000,
            catalog_path: "caster.sqlite3".into(),
            mount_list_path: "mount_list.txt".into(),
            tcp_keepalive: TcpKeepalive::default(),
            caster: CasterLocation::default(),
            app: AppInfo::default(),
            default_admin: DefaultAdmin::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (if it exists) layered with
    /// `NTRIP_CASTER_*` environment overrides, falling back to defaults for
    /// anything neither source sets.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut builder = config::Config::builder();
        if path.exists() {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("NTRIP_CASTER")
                .separator("__")
                .try_parsing(true),
        );
        let raw = builder.build()?;
        let cfg: Config = raw.try_deserialize()?;
        Ok(cfg)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn data_send_timeout(&self) -> Duration {
        Duration::from_secs(self.data_send_timeout_secs)
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}
