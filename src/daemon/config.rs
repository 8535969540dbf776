//! Relay daemon configuration
//!
//! Configuration loading, validation and serialization. Files are read as
//! JSON, TOML or YAML depending on their extension; missing fields take their
//! defaults.

use crate::engine::EngineConfig;
use crate::frame::MacAddr;
use crate::{RelayError, Result, HWSIM_FAMILY_NAME};

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default TCP port peers connect to
pub const DEFAULT_PORT: u16 = 8211;

/// Main relay configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// General daemon settings
    pub general: GeneralConfig,
    /// Driver side
    pub kernel: KernelConfig,
    /// Peer side
    pub server: ServerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// General daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Daemon name
    pub name: String,
    /// PID file path
    pub pid_file: Option<PathBuf>,
    /// Refuse to start unless running as root
    pub require_privileges: bool,
}

/// Driver-side settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Generic netlink family name
    pub family_name: String,
    /// Family lookup retry interval (ms)
    pub resolve_interval_ms: u64,
    /// Bound on each netlink receive (ms)
    pub receive_timeout_ms: u64,
    /// Signal reported in acknowledgements (dBm)
    pub ack_signal: i32,
    /// Rate index reported for frames injected from peers
    pub rx_rate: u32,
    /// Signal reported for frames injected from peers (dBm)
    pub rx_signal: i32,
    /// Local radio receiving injected frames, e.g. "02:00:00:00:00:00"
    pub radio_address: Option<String>,
}

/// Peer-side settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub bind_address: String,
    /// TCP port
    pub port: u16,
    /// Read timeout on peer sockets (ms)
    pub read_timeout_ms: u64,
    /// Write timeout on peer sockets (ms)
    pub write_timeout_ms: u64,
    /// Idle sleep of the accept thread (ms)
    pub accept_interval_ms: u64,
    /// Per-read buffer size
    pub recv_buffer_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Include thread ids in log lines
    pub thread_ids: bool,
    /// Include source file and line in log lines
    pub file_lines: bool,
}

/// Outcome of a configuration check
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: "vwifi-relay".to_string(),
            pid_file: None,
            require_privileges: false,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            family_name: HWSIM_FAMILY_NAME.to_string(),
            resolve_interval_ms: engine.resolve_interval.as_millis() as u64,
            receive_timeout_ms: engine.receive_timeout.as_millis() as u64,
            ack_signal: engine.ack_signal,
            rx_rate: engine.rx_rate,
            rx_signal: engine.rx_signal,
            radio_address: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            read_timeout_ms: 10,
            write_timeout_ms: 1000,
            accept_interval_ms: 50,
            recv_buffer_size: 64 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            thread_ids: true,
            file_lines: true,
        }
    }
}

impl KernelConfig {
    /// Parameters for the relay engine
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let radio_address = self
            .radio_address
            .as_deref()
            .map(str::parse::<MacAddr>)
            .transpose()
            .map_err(|e| RelayError::Config(format!("radio_address: {}", e)))?;

        Ok(EngineConfig {
            family_name: self.family_name.clone(),
            resolve_interval: Duration::from_millis(self.resolve_interval_ms),
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            ack_signal: self.ack_signal,
            rx_rate: self.rx_rate,
            rx_signal: self.rx_signal,
            radio_address,
        })
    }
}

impl ServerConfig {
    pub fn bind_ip(&self) -> Result<IpAddr> {
        self.bind_address
            .parse()
            .map_err(|_| RelayError::Config(format!("invalid bind address '{}'", self.bind_address)))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn accept_interval(&self) -> Duration {
        Duration::from_millis(self.accept_interval_ms)
    }
}

/// Holds the active configuration and where it came from
#[derive(Debug, Default)]
pub struct ConfigManager {
    config: RelayConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Manager holding the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: RelayConfig) -> Self {
        Self {
            config,
            config_path: None,
        }
    }

    /// Load configuration from a JSON, TOML or YAML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {}", e)))?;

        let config: RelayConfig = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| RelayError::Config(format!("Failed to parse JSON config: {}", e)))?,
            Some("toml") => toml::from_str(&content)
                .map_err(|e| RelayError::Config(format!("Failed to parse TOML config: {}", e)))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| RelayError::Config(format!("Failed to parse YAML config: {}", e)))?,
            _ => return Err(RelayError::Config("Unsupported config file format".to_string())),
        };

        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Write the configuration, format chosen by extension
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => self.to_json()?,
            Some("toml") => self.to_toml()?,
            Some("yaml") | Some("yml") => self.to_yaml()?,
            _ => return Err(RelayError::Config("Unsupported config file format".to_string())),
        };

        fs::write(path, content)
            .map_err(|e| RelayError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    pub fn get_config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RelayConfig {
        &mut self.config
    }

    pub fn into_config(self) -> RelayConfig {
        self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Replace the configuration after validating it
    pub fn update_config(&mut self, new_config: RelayConfig) -> Result<()> {
        let validation = self.validate_config(&new_config);
        if !validation.valid {
            return Err(RelayError::Config(format!(
                "Configuration validation failed: {}",
                validation.errors.join(", ")
            )));
        }
        self.config = new_config;
        Ok(())
    }

    /// Re-read the file the configuration was loaded from
    pub fn reload(&mut self) -> Result<()> {
        let path = self
            .config_path
            .clone()
            .ok_or_else(|| RelayError::Config("No config file path set".to_string()))?;
        let new_manager = Self::load_from_file(path)?;
        self.update_config(new_manager.config)
    }

    /// Check a configuration for values the relay cannot run with
    pub fn validate_config(&self, config: &RelayConfig) -> ValidationResult {
        let mut result = ValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        if config.general.name.is_empty() {
            result.errors.push("Daemon name cannot be empty".to_string());
        }

        if config.kernel.family_name.is_empty() {
            result.errors.push("Family name cannot be empty".to_string());
        }

        if config.kernel.resolve_interval_ms == 0 {
            result.errors.push("Family resolve interval cannot be 0".to_string());
        }

        if config.kernel.receive_timeout_ms == 0 {
            result.errors.push("Kernel receive timeout cannot be 0".to_string());
        } else if config.kernel.receive_timeout_ms > 1000 {
            result
                .warnings
                .push("Kernel receive timeout above 1s delays shutdown".to_string());
        }

        if let Err(e) = config.kernel.engine_config() {
            result.errors.push(e.to_string());
        }

        if let Err(e) = config.server.bind_ip() {
            result.errors.push(e.to_string());
        }

        if config.server.port == 0 {
            result
                .warnings
                .push("Server port is 0, an ephemeral port will be used".to_string());
        }

        if config.server.read_timeout_ms == 0 {
            result.errors.push("Peer read timeout cannot be 0".to_string());
        } else if config
            .server
            .read_timeout_ms
            .saturating_mul(crate::MAX_CLIENT as u64)
            > 1000 {
            result
                .warnings
                .push("Peer read timeout is long; a full sweep of all slots exceeds 1s".to_string());
        }

        if config.server.write_timeout_ms == 0 {
            result.errors.push("Peer write timeout cannot be 0".to_string());
        }

        if config.server.recv_buffer_size == 0 {
            result.errors.push("Receive buffer size cannot be 0".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            result.errors.push(format!(
                "Invalid log level '{}', must be one of: {}",
                config.logging.level,
                valid_levels.join(", ")
            ));
        }

        result.valid = result.errors.is_empty();
        result
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.config)
            .map_err(|e| RelayError::Config(format!("Failed to serialize config to JSON: {}", e)))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.config)
            .map_err(|e| RelayError::Config(format!("Failed to serialize config to TOML: {}", e)))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.config)
            .map_err(|e| RelayError::Config(format!("Failed to serialize config to YAML: {}", e)))
    }
}
