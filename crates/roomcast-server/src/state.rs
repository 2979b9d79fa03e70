use crate::media::{WebRtcTransportOptions, WorkerSettings};
use crate::sfu::SfuSessionManager;
use anyhow::{Context, bail};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Interface the HTTP server binds to
    pub host: String,
    pub port: u16,
    /// Public address announced in ICE candidates
    pub server_ip: String,
    /// Local address RTC sockets bind to
    pub rtc_listen_ip: IpAddr,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Config {
    /// Load from environment variables (and `.env` if the caller loaded it).
    pub fn load() -> anyhow::Result<Self> {
        Self::from_env(config::Environment::default())
    }

    pub fn from_env(env: config::Environment) -> anyhow::Result<Self> {
        let config: Config = config::Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 5000)?
            .set_default("server_ip", "127.0.0.1")?
            .set_default("rtc_listen_ip", "0.0.0.0")?
            .set_default("rtc_min_port", 10000)?
            .set_default("rtc_max_port", 10100)?
            .add_source(env.try_parsing(true))
            .build()?
            .try_deserialize()
            .context("invalid configuration")?;

        if config.rtc_min_port > config.rtc_max_port {
            bail!(
                "RTC_MIN_PORT ({}) is greater than RTC_MAX_PORT ({})",
                config.rtc_min_port,
                config.rtc_max_port
            );
        }

        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
        }
    }

    /// Every transport listens on both UDP and TCP, UDP first.
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.rtc_listen_ip,
            announced_ip: Some(self.server_ip.clone()),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sfu: Arc<SfuSessionManager>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let sfu = Arc::new(SfuSessionManager::new(config.transport_options()));
        Self { config, sfu }
    }
}
