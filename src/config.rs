//! Command line and environment configuration for the `rawhttp` binary.
//!
//! ```bash
//! rawhttp --port 8080 --run-for-secs 60
//! HTTP_HOST=0.0.0.0 HTTP_PORT=8080 rawhttp
//! ```

use std::time::Duration;

use clap::Parser;
use tracing::Level;

use crate::request::ReadLimits;
use crate::server::ServerConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "rawhttp")]
#[command(about = "Minimal HTTP/1.1 server on raw TCP sockets")]
#[command(version)]
pub struct Config {
    /// Host/IP to listen on
    #[arg(long, default_value = "127.0.0.1", env = "HTTP_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "10001", env = "HTTP_PORT")]
    pub port: u16,

    /// Largest request body accepted, in bytes
    #[arg(long = "max-body-bytes", default_value = "1048576", env = "HTTP_MAX_BODY_BYTES")]
    pub max_body_bytes: usize,

    /// Time given to in-flight connections on shutdown, in milliseconds
    #[arg(long = "drain-timeout-ms", default_value = "5000", env = "HTTP_DRAIN_TIMEOUT_MS")]
    pub drain_timeout_ms: u64,

    /// Stop after this many seconds; 0 runs until Ctrl-C
    #[arg(long = "run-for-secs", default_value = "0", env = "HTTP_RUN_FOR_SECS")]
    pub run_for_secs: u64,

    /// Maximum log level (error, warn, info, debug, trace)
    #[arg(long = "log-level", default_value = "info", env = "HTTP_LOG_LEVEL")]
    pub log_level: Level,
}

impl Config {
    /// `host:port` to bind.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.drain_timeout_ms == 0 {
            return Err("drain timeout must be > 0".to_string());
        }
        Ok(())
    }

    /// `None` when the server should run until interrupted.
    pub fn run_for(&self) -> Option<Duration> {
        (self.run_for_secs > 0).then(|| Duration::from_secs(self.run_for_secs))
    }

    pub fn server_config(&self) -> ServerConfig {
        let limits = ReadLimits {
            max_body_bytes: self.max_body_bytes,
            ..ReadLimits::default()
        };
        ServerConfig::new(self.address())
            .with_limits(limits)
            .with_drain_timeout(Duration::from_millis(self.drain_timeout_ms))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10001,
            max_body_bytes: 1024 * 1024,
            drain_timeout_ms: 5000,
            run_for_secs: 0,
            log_level: Level::INFO,
        }
    }
}
