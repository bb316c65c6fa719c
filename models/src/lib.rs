#![allow(dead_code)]

pub mod config;
pub mod event;

pub use config::{
    BasicAuthConfig, Config, DirectoryConfig, OutboundAuth, OutboundConfig, ReconcileScanConfig,
    ServerConfig, ShadowConfig, StabilityConfig, TlsConfig, WatchConfig, WatchMode,
};
pub use event::{FileEvent, UploadJob};
