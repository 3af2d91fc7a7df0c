//! Configuration module for forkbus.
//!
//! Loads a structured TOML file into strongly typed structs (`Config`,
//! `ClusterConfig`) using `serde` + `toml`. Every field has a default so
//! embedded instances can run on `Config::default()`.
//!
//! # Example `forkbus.toml`
//! ```toml
//! [cluster]
//! socket_dir       = "/run/myapp"   # default: $TMPDIR, else /tmp
//! ping_interval_ms = 5_000
//! raise_signals    = true
//! ```
//!
//! # Usage
//! ```rust,ignore
//! let cfg = forkbus::config::load_config("./forkbus.toml")?;
//! let bus = forkbus::Postoffice::new(cfg);
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClusterConfig {
    /// Directory the cluster socket is created in. `None` means `$TMPDIR`,
    /// falling back to `/tmp`.
    pub socket_dir: Option<PathBuf>,

    /// Keepalive interval for idle cluster links, in milliseconds.
    /// 0 disables pings.
    pub ping_interval_ms: u64,

    /// Whether the bus may raise process signals (self-SIGINT on shutdown
    /// or parent crash, process exit on protocol overflow). Disable when
    /// embedding the bus in a test harness that must observe these events
    /// instead of dying from them.
    pub raise_signals: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            socket_dir: None,
            ping_interval_ms: 5_000,
            raise_signals: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub cluster: ClusterConfig,
}

/// Load configuration from a TOML file into `Config`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(&path)?;
    let cfg: Config = toml::from_str(&raw)?;
    Ok(cfg)
}
