use std::time::Duration;

use serde::{Deserialize, Serialize};

/// An entire configuration for a pgrollback proxy instance
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// The real postgres server that sessions connect to
    pub backend: BackendConfig,
    /// The listening socket of the proxy
    #[serde(default)]
    pub proxy: ListenConfig,
    /// Test session behaviour
    #[serde(default)]
    pub session: SessionConfig,
}

/// Connection settings for the backing postgres server
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Host name or address of the postgres server
    pub host: String,
    /// Port of the postgres server
    #[serde(default = "default_backend_port")]
    pub port: u16,
    /// Database to connect to
    pub database: String,
    /// User to authenticate as
    pub user: String,
    /// Password for the user, if the server requires one
    #[serde(default)]
    pub password: String,
}

/// Listening options for the proxy
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// The host to bind on
    #[serde(default = "default_listen_host")]
    pub host: String,
    /// The listening port of the proxy
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

/// Session lifecycle options
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions idle for longer than this are destroyed
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Interval between keepalive pings on each session's backend
    /// connection. Zero disables keepalive.
    #[serde(default)]
    pub keepalive_interval_secs: u64,
}

impl BackendConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ListenConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// The configured keepalive cadence, or None when disabled
    pub fn keepalive_interval(&self) -> Option<Duration> {
        if self.keepalive_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.keepalive_interval_secs))
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_listen_port(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            keepalive_interval_secs: 0,
        }
    }
}

fn default_backend_port() -> u16 {
    5432
}

fn default_listen_host() -> String {
    "0.0.0.0".into()
}

fn default_listen_port() -> u16 {
    5433
}

fn default_idle_timeout_secs() -> u64 {
    // 24 hours
    86400
}
