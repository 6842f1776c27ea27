use std::fs;
use std::time::Duration;

use log::warn;
use serde_derive::{Deserialize, Serialize};

use crate::exception::Exception;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    local: bool,
    #[serde(default)]
    worker_threads: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    shutdown_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    read_timeout_secs: u64,
    #[serde(default = "default_max_header_size")]
    max_header_size: usize,
    #[serde(default = "default_max_body_size")]
    max_body_size: u64,
    #[serde(default = "default_stream_delay_ms")]
    stream_delay_ms: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout_secs() -> u64 {
    15
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_max_header_size() -> usize {
    1048576 // 1MB
}

fn default_max_body_size() -> u64 {
    10485760 // 10MB
}

fn default_stream_delay_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            local: false,
            worker_threads: 0,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_header_size: default_max_header_size(),
            max_body_size: default_max_body_size(),
            stream_delay_ms: default_stream_delay_ms(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml(filename: &str) -> Result<Self, Exception> {
        let content = fs::read_to_string(filename)
            .map_err(|e| Exception::Config(format!("cannot read {}: {}", filename, e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, Exception> {
        let mut raw_config: Config =
            toml::from_str(content).map_err(|e| Exception::Config(e.to_string()))?;
        if raw_config.max_header_size == 0 {
            warn!("max_header_size被设置为0，这会拒绝所有请求，因此该值将被改为默认值。");
            raw_config.max_header_size = default_max_header_size();
        }
        Ok(raw_config)
    }
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local(&self) -> bool {
        self.local
    }

    /// 工作线程数，0 表示按 CPU 核数决定。
    pub fn worker_threads(&self) -> usize {
        match self.worker_threads {
            0 => num_cpus::get(),
            n => n,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// 接收单个请求允许的最长时间，`None` 表示不限制。
    pub fn read_timeout(&self) -> Option<Duration> {
        match self.read_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn max_header_size(&self) -> usize {
        self.max_header_size
    }

    pub fn max_body_size(&self) -> u64 {
        self.max_body_size
    }

    pub fn stream_delay(&self) -> Duration {
        Duration::from_millis(self.stream_delay_ms)
    }
}
