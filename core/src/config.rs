use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use models::Config;

#[derive(Debug, Parser)]
#[command(name = "xferd", about = "Low-latency file movement daemon")]
pub struct CliConfig {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c', default_value = "xferd.toml")]
    pub config: PathBuf,

    /// Path to the log file
    #[arg(long, default_value = "xferd.log")]
    pub log_path: PathBuf,
}

/// Read, override, and validate the daemon configuration. Any failure here
/// is fatal to the launcher.
pub fn load(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut cfg: Config = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    apply_env_overrides(&mut cfg);
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}

fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(port) = std::env::var("XFERD_PORT") {
        if let Ok(port) = port.parse() {
            cfg.server.port = port;
        }
    }
    if let Ok(address) = std::env::var("XFERD_ADDRESS") {
        cfg.server.address = address;
    }
    if let Ok(temp_dir) = std::env::var("XFERD_TEMP_DIR") {
        cfg.server.temp_dir = PathBuf::from(temp_dir);
    }
}
