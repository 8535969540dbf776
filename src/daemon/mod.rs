//! Relay daemon module
//!
//! This module contains the composition root of the relay: configuration,
//! the peer I/O pump, the daemon that runs the worker threads, and process
//! utilities used by the binary.

pub mod config;
pub mod core;
pub mod io;

// Re-export main types
pub use self::core::{DaemonState, DaemonStats, RelayDaemon};
pub use config::{ConfigManager, RelayConfig, ValidationResult};
pub use io::{IoStats, PeerPump};

use crate::channel::KernelChannel;
use crate::state::RelayState;
use crate::{RelayError, Result};

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Daemon builder for easy configuration
#[derive(Debug, Default)]
pub struct DaemonBuilder {
    config: Option<RelayConfig>,
    port: Option<u16>,
    bind_address: Option<String>,
    family_name: Option<String>,
}

impl DaemonBuilder {
    /// Create new daemon builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set daemon configuration
    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the peer port
    pub fn with_port(mut self, port: Option<u16>) -> Self {
        if port.is_some() {
            self.port = port;
        }
        self
    }

    /// Override the listener address
    pub fn with_bind_address(mut self, bind_address: Option<String>) -> Self {
        if bind_address.is_some() {
            self.bind_address = bind_address;
        }
        self
    }

    /// Override the generic netlink family name
    pub fn with_family(mut self, family_name: Option<String>) -> Self {
        if family_name.is_some() {
            self.family_name = family_name;
        }
        self
    }

    /// Configuration with every override applied
    pub fn resolve_config(&self) -> RelayConfig {
        let mut config = self.config.clone().unwrap_or_default();
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind_address) = &self.bind_address {
            config.server.bind_address = bind_address.clone();
        }
        if let Some(family_name) = &self.family_name {
            config.kernel.family_name = family_name.clone();
        }
        config
    }

    /// Validate the configuration and build the daemon over `channel`
    pub fn build<C: KernelChannel + 'static>(self, channel: C) -> Result<RelayDaemon<C>> {
        let config = self.resolve_config();

        let validation = ConfigManager::new().validate_config(&config);
        for warning in &validation.warnings {
            log::warn!("Config: {}", warning);
        }
        if !validation.valid {
            return Err(RelayError::Config(validation.errors.join(", ")));
        }

        RelayDaemon::new(config, channel)
    }
}

/// Daemon utilities
pub struct DaemonUtils;

impl DaemonUtils {
    /// Check if daemon is running as root
    pub fn is_privileged() -> bool {
        #[cfg(unix)]
        {
            unsafe { libc::geteuid() == 0 }
        }

        #[cfg(not(unix))]
        {
            false
        }
    }

    /// Get daemon process ID
    pub fn get_pid() -> u32 {
        std::process::id()
    }

    /// Create PID file
    pub fn create_pid_file(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", Self::get_pid())?;
        Ok(())
    }

    /// Remove PID file
    pub fn remove_pid_file(path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Check whether the process named in a PID file is alive
    pub fn is_daemon_running(pid_path: &Path) -> Result<bool> {
        if !pid_path.exists() {
            return Ok(false);
        }

        let pid_str = std::fs::read_to_string(pid_path)?;
        let pid = pid_str
            .trim()
            .parse::<u32>()
            .map_err(|_| RelayError::Config("Invalid PID in pid file".to_string()))?;

        Ok(Self::is_process_running(pid))
    }

    /// Check if process is running
    pub fn is_process_running(pid: u32) -> bool {
        #[cfg(unix)]
        {
            unsafe { libc::kill(pid as i32, 0) == 0 }
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            false
        }
    }

    /// Clear the run flag on SIGINT or SIGTERM.
    ///
    /// Signals are consumed on a dedicated thread, which exits after the
    /// first one.
    pub fn setup_signal_handlers(state: Arc<RelayState>) -> Result<JoinHandle<()>> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM])
            .map_err(|e| RelayError::System(format!("Failed to setup signal handler: {}", e)))?;

        std::thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    log::info!("Received signal {}, shutting down...", sig);
                    state.request_stop();
                }
            })
            .map_err(|e| RelayError::System(format!("Failed to spawn signal thread: {}", e)))
    }

    /// Get system information
    pub fn get_system_info() -> SystemInfo {
        SystemInfo {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pid: Self::get_pid(),
            privileged: Self::is_privileged(),
        }
    }
}

/// System information
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub pid: u32,
    pub privileged: bool,
}
