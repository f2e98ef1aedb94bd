use serde::Deserialize;
use std::path::PathBuf;

use fleet_core::RegistryConfig;

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_fts_root")]
    pub fts_root: PathBuf,
    /// Free space to keep on the FTS volume; uploads that would eat into
    /// it are rejected.
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_agent_ttl_ms")]
    pub agent_ttl_ms: u64,
    #[serde(default = "default_mgmt_ttl_ms")]
    pub mgmt_ttl_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// The update_agent_executable operation kind is refused unless this
    /// is switched on.
    #[serde(default)]
    pub allow_executable_update: bool,
    /// Deploy-token self-registration is refused unless this is switched
    /// on.
    #[serde(default)]
    pub allow_deployment: bool,
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        // Try to load from config file, fall back to defaults
        let config_path = Self::config_path();
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn config_path() -> PathBuf {
        dirs_path().join("config.toml")
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            agent_ttl_ms: self.agent_ttl_ms,
            mgmt_ttl_ms: self.mgmt_ttl_ms,
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            state_dir: default_state_dir(),
            fts_root: default_fts_root(),
            min_free_bytes: default_min_free_bytes(),
            sweep_interval_ms: default_sweep_interval_ms(),
            agent_ttl_ms: default_agent_ttl_ms(),
            mgmt_ttl_ms: default_mgmt_ttl_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            allow_executable_update: false,
            allow_deployment: false,
        }
    }
}

fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("FLEET_CONFIG_DIR") {
        PathBuf::from(config_dir)
    } else if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("fleet")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("fleet")
    } else {
        PathBuf::from("/tmp/fleet")
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:4500".to_string()
}

fn default_state_dir() -> PathBuf {
    dirs_path().join("state")
}

fn default_fts_root() -> PathBuf {
    dirs_path().join("fts")
}

fn default_min_free_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_sweep_interval_ms() -> u64 {
    500
}

fn default_agent_ttl_ms() -> u64 {
    30 * 60 * 1000
}

fn default_mgmt_ttl_ms() -> u64 {
    10 * 60 * 1000
}

fn default_heartbeat_timeout_ms() -> u64 {
    30 * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_gets_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:4500");
        assert_eq!(config.sweep_interval_ms, 500);
        assert_eq!(config.heartbeat_timeout_ms, 30_000);
        assert!(!config.allow_executable_update);
        assert!(!config.allow_deployment);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            listen_addr = "0.0.0.0:9000"
            agent_ttl_ms = 60000
            allow_executable_update = true
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.agent_ttl_ms, 60_000);
        assert!(config.allow_executable_update);
        assert_eq!(config.registry_config().agent_ttl_ms, 60_000);
    }
}
