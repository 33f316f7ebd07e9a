use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::block::ManagerOptions;
use crate::dataserver::DEFAULT_DATA_SERVER;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // id of this worker, part of its durable temp paths
    pub worker_id: u64,
    // ip:port of the RPC endpoint
    #[serde(default = "default_rpc_addr")]
    pub rpc_addr: SocketAddr,
    // ip:port of the bulk data endpoint
    #[serde(default = "default_data_addr")]
    pub data_addr: SocketAddr,
    // name of the data server implementation
    #[serde(default = "default_data_server")]
    pub data_server: String,
    // local folder holding cached blocks and session temp folders
    pub data_folder: PathBuf,
    // root of the local under file system
    pub underfs_root: PathBuf,
    pub capacity_bytes: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    // sessions silent for heartbeat_interval_ms * zombie_multiplier are reclaimed
    #[serde(default = "default_zombie_multiplier")]
    pub zombie_multiplier: u32,
    #[serde(default = "default_checkpoint_workers")]
    pub checkpoint_workers: usize,
    #[serde(default = "default_checkpoint_queue_capacity")]
    pub checkpoint_queue_capacity: usize,
}

fn default_rpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 29998))
}

fn default_data_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 29999))
}

fn default_data_server() -> String {
    DEFAULT_DATA_SERVER.to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_zombie_multiplier() -> u32 {
    3
}

fn default_checkpoint_workers() -> usize {
    2
}

fn default_checkpoint_queue_capacity() -> usize {
    64
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            bail!("heartbeat_interval_ms must be positive");
        }
        if self.zombie_multiplier == 0 {
            bail!("zombie_multiplier must be positive");
        }
        if self.checkpoint_workers == 0 || self.checkpoint_queue_capacity == 0 {
            bail!("checkpoint_workers and checkpoint_queue_capacity must be positive");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            capacity_bytes: self.capacity_bytes,
            heartbeat_interval: self.heartbeat_interval(),
            zombie_multiplier: self.zombie_multiplier,
            checkpoint_workers: self.checkpoint_workers,
            checkpoint_queue_capacity: self.checkpoint_queue_capacity,
        }
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    cfg.validate()?;
    Ok(cfg)
}
