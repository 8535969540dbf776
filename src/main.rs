//! vwifi-relay binary
//!
//! Entry point of the relay daemon. Parses the command line, loads the
//! configuration, sets up logging and signal handling, then runs the relay
//! over the generic netlink socket until SIGINT or SIGTERM.

use clap::{Arg, ArgMatches, Command};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vwifi_relay::daemon::{ConfigManager, DaemonUtils, RelayConfig};
use vwifi_relay::{RelayError, Result};

/// Default configuration file path
const DEFAULT_CONFIG_PATH: &str = "/etc/vwifi-relay/relay.toml";

fn build_cli() -> Command {
    Command::new("vwifi-relay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Relay frames between mac80211_hwsim and TCP peers")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (json, toml or yaml)")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error); overrides the config file"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("TCP port peers connect to")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Address the peer listener binds to"),
        )
        .arg(
            Arg::new("pid-file")
                .long("pid-file")
                .value_name("FILE")
                .help("PID file path"),
        )
        .arg(
            Arg::new("family")
                .long("family")
                .value_name("NAME")
                .help("Generic netlink family of the hwsim driver"),
        )
}

fn main() {
    let matches = build_cli().get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let (config, loaded) = match load_configuration(&config_path) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("vwifi-relay: {}", e);
            process::exit(1);
        }
    };

    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| config.logging.level.clone());
    if let Err(e) = init_logging(&log_level, &config) {
        eprintln!("vwifi-relay: {}", e);
        process::exit(1);
    }

    info!("Starting vwifi-relay v{}", env!("CARGO_PKG_VERSION"));
    if loaded {
        info!("Loaded configuration from {}", config_path.display());
    } else {
        warn!("Configuration file not found: {}, using defaults", config_path.display());
    }

    if let Err(e) = run(&matches, config) {
        error!("vwifi-relay error: {}", e);
        process::exit(1);
    }

    info!("vwifi-relay shutdown complete");
}

/// Initialize logging; `log` records from the library are bridged in
fn init_logging(level: &str, config: &RelayConfig) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| RelayError::Config(format!("Invalid log level '{}': {}", level, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(config.logging.thread_ids)
        .with_file(config.logging.file_lines)
        .with_line_number(config.logging.file_lines)
        .try_init()
        .map_err(|e| RelayError::System(format!("Failed to install logger: {}", e)))
}

/// Load the configuration file; a missing file yields the defaults
fn load_configuration(config_path: &Path) -> Result<(RelayConfig, bool)> {
    if !config_path.exists() {
        return Ok((RelayConfig::default(), false));
    }
    Ok((ConfigManager::load_from_file(config_path)?.into_config(), true))
}

fn run(matches: &ArgMatches, config: RelayConfig) -> Result<()> {
    let system_info = DaemonUtils::get_system_info();
    info!(
        "pid {} on {}/{}, privileged: {}",
        system_info.pid, system_info.os, system_info.arch, system_info.privileged
    );

    if config.general.require_privileges && !system_info.privileged {
        return Err(RelayError::System(
            "root privileges are required to register with the driver".to_string(),
        ));
    }

    let pid_file = matches
        .get_one::<String>("pid-file")
        .map(PathBuf::from)
        .or_else(|| config.general.pid_file.clone());

    if let Some(path) = &pid_file {
        if DaemonUtils::is_daemon_running(path)? {
            return Err(RelayError::System(format!(
                "vwifi-relay is already running (PID file exists: {})",
                path.display()
            )));
        }
        DaemonUtils::create_pid_file(path)?;
    }

    let result = run_daemon(matches, config);

    if let Some(path) = &pid_file {
        if let Err(e) = DaemonUtils::remove_pid_file(path) {
            warn!("Failed to remove PID file: {}", e);
        }
    }

    result
}

#[cfg(target_os = "linux")]
fn run_daemon(matches: &ArgMatches, config: RelayConfig) -> Result<()> {
    use vwifi_relay::channel::GenlSocket;
    use vwifi_relay::daemon::DaemonBuilder;

    let mut daemon = DaemonBuilder::new()
        .with_config(config)
        .with_port(matches.get_one::<u16>("port").copied())
        .with_bind_address(matches.get_one::<String>("bind").cloned())
        .with_family(matches.get_one::<String>("family").cloned())
        .build(GenlSocket::new())?;

    DaemonUtils::setup_signal_handlers(daemon.relay_state())?;

    info!("Waiting for the {} family", daemon.get_config().kernel.family_name);
    daemon.run()
}

#[cfg(not(target_os = "linux"))]
fn run_daemon(_matches: &ArgMatches, _config: RelayConfig) -> Result<()> {
    Err(RelayError::System(
        "mac80211_hwsim is only available on Linux".to_string(),
    ))
}
