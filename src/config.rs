//! Configuration file loading and validation (§10.1).
//!
//! Mirrors the original's `Config` class: a flat set of required keys,
//! validated once at startup, before any listener binds. Config errors
//! are fatal to the process (§7).

use std::{
    fs,
    net::{SocketAddr, ToSocketAddrs},
    path::Path,
};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path to a PEM file. Reserved for a future transport-identity
    /// feature; unused by the core.
    pub hostkey: String,
    pub cache_size: usize,
    pub degree: usize,
    pub bootstrapper: String,
    pub p2p_address: String,
    pub api_address: String,
    pub challenge_timeout: u64,
    pub challenge_difficulty: u8,
    pub discovery_cooldown: u64,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.degree > 0, "`degree` must be greater than zero");
        anyhow::ensure!(self.cache_size > 0, "`cache_size` must be greater than zero");
        anyhow::ensure!(
            self.challenge_difficulty <= 64,
            "`challenge_difficulty` must be in [0, 64]"
        );
        anyhow::ensure!(
            self.hostkey.ends_with(".pem"),
            "`hostkey` must point to a .pem file"
        );
        self.bootstrapper_addr()
            .context("`bootstrapper` is not a valid host:port")?;
        self.p2p_addr().context("`p2p_address` is not a valid host:port")?;
        self.api_addr().context("`api_address` is not a valid host:port")?;
        Ok(())
    }

    pub fn bootstrapper_addr(&self) -> Result<SocketAddr> {
        resolve(&self.bootstrapper)
    }

    pub fn p2p_addr(&self) -> Result<SocketAddr> {
        resolve(&self.p2p_address)
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        resolve(&self.api_address)
    }
}

fn resolve(host_port: &str) -> Result<SocketAddr> {
    host_port
        .to_socket_addrs()
        .with_context(|| format!("resolving {host_port}"))?
        .next()
        .with_context(|| format!("{host_port} did not resolve to an address"))
}
