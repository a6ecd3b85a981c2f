//! Runtime configuration for the hall server.
//!
//! `main` builds a [`ServerConfig`] from command-line arguments; library users
//! and tests start from [`ServerConfig::default`] and override fields.

use std::path::PathBuf;
use std::time::Duration;

/// Values reported to clients through `server_config` and `publickey`.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub version: String,
    pub anonymous_login: bool,
    pub key: String,
    pub url: String,
    pub name: String,
    pub max_online: u64,
    /// Opaque PEM string handed to clients; never parsed here.
    pub public_key: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            anonymous_login: true,
            key: "cc1".to_string(),
            url: "ws://127.0.0.1:2424".to_string(),
            name: "Chinese Chess Hall".to_string(),
            max_online: 100,
            public_key: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Base URL of the account service, without trailing slash.
    pub account_url: String,
    pub auth_timeout: Duration,
    pub snapshot_path: PathBuf,
    pub flush_interval: Duration,
    pub keepalive_interval: Duration,
    /// Unanswered keepalive probes tolerated before a connection is closed.
    pub keepalive_max_missed: u32,
    pub max_connections: usize,
    /// Idle time after which a held piece is released; `None` disables the sweep.
    pub piece_hold_timeout: Option<Duration>,
    pub info: ServerInfo,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:2424".to_string(),
            account_url: "http://127.0.0.1:810".to_string(),
            auth_timeout: Duration::from_secs(10),
            snapshot_path: PathBuf::from("counters.json"),
            flush_interval: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(20),
            keepalive_max_missed: 3,
            max_connections: 256,
            piece_hold_timeout: None,
            info: ServerInfo::default(),
        }
    }
}
