//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::SandboxRuntime;

pub const DEFAULT_PORT: u16 = 3005;

/// Hard wall-clock ceiling per run.
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(60);

/// Request budget per client address.
pub const DEFAULT_RATE_LIMIT: RateLimit = RateLimit {
    requests: 100,
    window: Duration::from_secs(15 * 60),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u32,
    pub window: Duration,
}

pub fn default_staging_root() -> PathBuf {
    std::env::temp_dir().join("code_bridge_temp")
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub staging_root: PathBuf,
    pub time_limit: Duration,
    pub runtime: SandboxRuntime,
    /// `None` disables HTTP rate limiting.
    pub rate_limit: Option<RateLimit>,
}

impl Config {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            staging_root: default_staging_root(),
            time_limit: DEFAULT_TIME_LIMIT,
            runtime: SandboxRuntime::docker("docker", "codebridge-"),
            rate_limit: Some(DEFAULT_RATE_LIMIT),
        }
    }
}
