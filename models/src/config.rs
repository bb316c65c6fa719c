use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Top-level daemon configuration: one ingress server, many watched
/// directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub directories: Vec<DirectoryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    pub port: u16,
    pub temp_dir: PathBuf,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub basic_auth: BasicAuthConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: PathBuf,
    #[serde(default)]
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BasicAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub username: String,
    /// Plaintext reference password. Prefer `password_hash`.
    #[serde(default)]
    pub password: String,
    /// Bcrypt hash of the password.
    #[serde(default)]
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub name: String,
    pub watch_path: PathBuf,
    /// Where HTTP-ingested files land. Defaults to `watch_path`.
    #[serde(default)]
    pub ingest_path: Option<PathBuf>,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub ignore: Vec<String>,
    pub watch: WatchConfig,
    pub stability: StabilityConfig,
    #[serde(default)]
    pub shadow: ShadowConfig,
    pub outbound: OutboundConfig,
}

impl DirectoryConfig {
    pub fn ingest_path(&self) -> &Path {
        self.ingest_path.as_deref().unwrap_or(&self.watch_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    EventOnly,
    PollingOnly,
    HybridUltraLowLatency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub mode: WatchMode,
    /// Defaults to enabled when absent.
    #[serde(default)]
    pub startup_reconcile_scan: Option<bool>,
    #[serde(default)]
    pub reconcile_scan: ReconcileScanConfig,
}

impl WatchConfig {
    pub fn startup_scan_enabled(&self) -> bool {
        self.startup_reconcile_scan.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileScanConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub interval_seconds: u64,
}

impl ReconcileScanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StabilityConfig {
    pub confirmation_interval_ms: u64,
    pub required_stable_checks: u32,
    pub max_wait_ms: u64,
}

impl StabilityConfig {
    pub fn confirmation_interval(&self) -> Duration {
        Duration::from_millis(self.confirmation_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShadowConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub retention_hours: u64,
}

impl ShadowConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    pub url: String,
    #[serde(default)]
    pub auth: OutboundAuth,
}

/// Authentication attached to outbound upload requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
    Token {
        token: String,
    },
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

impl Config {
    /// Startup validation. Any failure here is fatal to the launcher.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("invalid server port: {}", self.server.port);
        }
        if self.server.temp_dir.as_os_str().is_empty() {
            bail!("temp_dir is required");
        }

        let auth = &self.server.basic_auth;
        if auth.enabled {
            if auth.username.is_empty() {
                bail!("basic_auth.username is required when basic_auth is enabled");
            }
            if auth.password.is_empty() && auth.password_hash.is_empty() {
                bail!(
                    "either basic_auth.password or basic_auth.password_hash is required \
                     when basic_auth is enabled"
                );
            }
            if !auth.password.is_empty() && !auth.password_hash.is_empty() {
                bail!("cannot specify both basic_auth.password and basic_auth.password_hash");
            }
        }

        if self.directories.is_empty() {
            bail!("at least one directory must be configured");
        }
        for (i, dir) in self.directories.iter().enumerate() {
            dir.validate()
                .map_err(|e| e.context(format!("directory[{}] ({})", i, dir.name)))?;
        }
        Ok(())
    }
}

impl DirectoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("name is required");
        }
        if self.watch_path.as_os_str().is_empty() {
            bail!("watch_path is required");
        }
        if self.stability.confirmation_interval_ms == 0 {
            bail!("confirmation_interval_ms must be positive");
        }
        if self.stability.required_stable_checks == 0 {
            bail!("required_stable_checks must be positive");
        }
        if self.stability.max_wait_ms == 0 {
            bail!("max_wait_ms must be positive");
        }
        if self.watch.mode == WatchMode::PollingOnly && !self.watch.reconcile_scan.enabled {
            bail!("polling_only mode requires reconcile_scan.enabled");
        }
        if self.watch.reconcile_scan.enabled && self.watch.reconcile_scan.interval_seconds == 0 {
            bail!("reconcile_scan.interval_seconds must be positive");
        }
        if self.shadow.enabled && self.shadow.path.as_os_str().is_empty() {
            bail!("shadow.path is required when shadow is enabled");
        }
        if self.outbound.url.is_empty() {
            bail!("outbound.url is required");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> DirectoryConfig {
        DirectoryConfig {
            name: "invoices".to_string(),
            watch_path: PathBuf::from("/data/invoices"),
            ingest_path: None,
            recursive: false,
            ignore: vec![],
            watch: WatchConfig {
                mode: WatchMode::HybridUltraLowLatency,
                startup_reconcile_scan: None,
                reconcile_scan: ReconcileScanConfig {
                    enabled: true,
                    interval_seconds: 30,
                },
            },
            stability: StabilityConfig {
                confirmation_interval_ms: 100,
                required_stable_checks: 3,
                max_wait_ms: 5000,
            },
            shadow: ShadowConfig::default(),
            outbound: OutboundConfig {
                url: "http://upstream/ingest".to_string(),
                auth: OutboundAuth::None,
            },
        }
    }

    fn config() -> Config {
        Config {
            server: ServerConfig {
                address: "127.0.0.1".to_string(),
                port: 8080,
                temp_dir: PathBuf::from("/tmp/xferd"),
                tls: TlsConfig::default(),
                basic_auth: BasicAuthConfig::default(),
            },
            directories: vec![directory()],
        }
    }

    #[test]
    fn ingest_path_defaults_to_watch_path() {
        let mut dir = directory();
        assert_eq!(dir.ingest_path(), Path::new("/data/invoices"));
        dir.ingest_path = Some(PathBuf::from("/data/incoming"));
        assert_eq!(dir.ingest_path(), Path::new("/data/incoming"));
    }

    #[test]
    fn startup_scan_defaults_to_enabled() {
        let mut dir = directory();
        assert!(dir.watch.startup_scan_enabled());
        dir.watch.startup_reconcile_scan = Some(false);
        assert!(!dir.watch.startup_scan_enabled());
    }

    #[test]
    fn validate_accepts_reasonable_config() {
        config().validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_stability_values() {
        let mut cfg = config();
        cfg.directories[0].stability.required_stable_checks = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_basic_auth_with_both_password_forms() {
        let mut cfg = config();
        cfg.server.basic_auth = BasicAuthConfig {
            enabled: true,
            username: "up".to_string(),
            password: "pw".to_string(),
            password_hash: "$2b$12$abcdefghijklmnopqrstuv".to_string(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_scan_for_polling_only() {
        let mut cfg = config();
        cfg.directories[0].watch.mode = WatchMode::PollingOnly;
        cfg.directories[0].watch.reconcile_scan.enabled = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_enabled_shadow_without_path() {
        let mut cfg = config();
        cfg.directories[0].shadow.enabled = true;
        assert!(cfg.validate().is_err());
    }
}
