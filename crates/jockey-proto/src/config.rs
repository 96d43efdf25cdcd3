use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub scrobble: ScrobbleConfig,
    #[serde(default)]
    pub socket: SocketConfig,
}

/// Connection to the remote audio-processing node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_endpoint")]
    pub endpoint: String,
    /// First reconnect delay; doubles per attempt up to `reconnect_max_ms`.
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions idle past this are evicted by the background sweep.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Starting volume when no stored preference exists. 0-150.
    #[serde(default = "default_volume")]
    pub default_volume: u16,
    /// How many times the current track is re-issued across node reconnects
    /// before the session gives up and ends.
    #[serde(default = "default_resume_attempts")]
    pub resume_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Minimum interval between two renders of the same status display.
    #[serde(default = "default_min_render_interval_ms")]
    pub min_render_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrobbleConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Webhook receiving now-playing / scrobble notifications as JSON.
    #[serde(default)]
    pub webhook_url: String,
}

/// TCP control socket the bot process connects to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_socket_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_socket_port")]
    pub port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            endpoint: default_node_endpoint(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            default_volume: default_volume(),
            resume_attempts: default_resume_attempts(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            min_render_interval_ms: default_min_render_interval_ms(),
        }
    }
}

impl Default for ScrobbleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: String::new(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            enabled: default_socket_enabled(),
            bind_address: default_bind_address(),
            port: default_socket_port(),
        }
    }
}

fn default_node_endpoint() -> String {
    "127.0.0.1:2333".to_string()
}

fn default_reconnect_initial_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    8000
}

fn default_idle_timeout_secs() -> u64 {
    180
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_volume() -> u16 {
    100
}

fn default_resume_attempts() -> u32 {
    5
}

fn default_min_render_interval_ms() -> u64 {
    5000
}

fn default_socket_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_socket_port() -> u16 {
    9847
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.endpoint, "127.0.0.1:2333");
        assert_eq!(config.session.idle_timeout_secs, 180);
        assert_eq!(config.session.default_volume, 100);
        assert_eq!(config.presence.min_render_interval_ms, 5000);
        assert!(config.socket.enabled);
        assert!(!config.scrobble.enabled);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [node]
            endpoint = "audio.internal:2333"

            [session]
            idle_timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.node.endpoint, "audio.internal:2333");
        assert_eq!(config.node.reconnect_initial_ms, 1000);
        assert_eq!(config.session.idle_timeout_secs, 60);
        assert_eq!(config.session.resume_attempts, 5);
        assert_eq!(config.socket.port, 9847);
    }
}
