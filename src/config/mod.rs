use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_hook_port() -> u16 {
    8787
}

fn default_agent_process() -> String {
    "claude".to_string()
}

fn default_scan_interval_secs() -> u64 {
    15
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_tunnel_enabled() -> bool {
    true
}

fn default_viewer_base_url() -> String {
    "https://tether-sh.github.io/viewer".to_string()
}

#[derive(Debug, Deserialize)]
pub struct HookConfig {
    /// Loopback port the hook endpoint listens on.
    #[serde(default = "default_hook_port")]
    pub port: u16,
    /// Shared secret required in the `x-tether-secret` header.
    #[serde(default)]
    pub secret: String,
    /// Delay before reading agent artifacts after a stop hook fires.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            port: default_hook_port(),
            secret: String::new(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Process name to look for below agent panes.
    #[serde(default = "default_agent_process")]
    pub agent_process: String,
    /// Seconds between periodic pane scans.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            agent_process: default_agent_process(),
            scan_interval_secs: default_scan_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_tunnel_enabled")]
    pub enabled: bool,
    /// Base URL of the static response viewer used in deep links.
    #[serde(default = "default_viewer_base_url")]
    pub viewer_base_url: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: default_tunnel_enabled(),
            viewer_base_url: default_viewer_base_url(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub hook: HookConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

impl Config {
    /// Load `~/.tether/config.toml`, or defaults when the file is absent.
    pub fn load() -> Result<(Self, Option<PathBuf>)> {
        Self::load_from(&crate::paths::config_file())
    }

    pub fn load_from(path: &Path) -> Result<(Self, Option<PathBuf>)> {
        if path.is_file() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path.to_path_buf())))
        } else {
            Ok((Config::default(), None))
        }
    }
}
