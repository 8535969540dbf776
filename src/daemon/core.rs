//! Relay daemon core
//!
//! Wires the frame relay engine to the peer server and runs the worker
//! threads: the driver receive loop, the peer receive loop and the accept
//! loop. All of them stop once the shared run flag clears.

use crate::channel::KernelChannel;
use crate::engine::{EngineStats, FrameRelayEngine};
use crate::frame::RadioFrame;
use crate::hwsim::peer_frame_message;
use crate::peers::ClientBroadcastServer;
use crate::state::RelayState;
use crate::{RelayError, Result};
use super::config::RelayConfig;
use super::io::{IoStats, PeerPump};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often `run` checks the run flag
const RUN_POLL: Duration = Duration::from_millis(100);

/// Daemon state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonState {
    /// Created, not started
    Initializing,
    /// Waiting for the driver and binding the listener
    Starting,
    /// Worker threads running
    Running,
    /// Run flag cleared, joining workers
    Stopping,
    /// All workers joined
    Stopped,
    /// Start failed
    Error,
}

/// Daemon statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonStats {
    /// Seconds since start
    pub uptime: u64,
    /// Connected peers
    pub active_peers: usize,
    /// Driver side counters
    pub engine: EngineStats,
    /// Peer side counters
    pub io: IoStats,
}

/// The relay daemon
#[derive(Debug)]
pub struct RelayDaemon<C: KernelChannel> {
    config: RelayConfig,
    state: Arc<RelayState>,
    engine: Arc<FrameRelayEngine<C>>,
    server: Arc<ClientBroadcastServer>,
    pump: Arc<PeerPump<C>>,
    daemon_state: Mutex<DaemonState>,
    workers: Vec<JoinHandle<()>>,
    started_at: Option<DateTime<Utc>>,
}

impl<C: KernelChannel + 'static> RelayDaemon<C> {
    /// Create a daemon over an unopened kernel channel
    pub fn new(config: RelayConfig, channel: C) -> Result<Self> {
        let state = Arc::new(RelayState::new());

        let engine = Arc::new(FrameRelayEngine::new(
            channel,
            Arc::clone(&state),
            config.kernel.engine_config()?,
        ));

        let mut server = ClientBroadcastServer::new()
            .with_bind_address(config.server.bind_ip()?)
            .with_read_timeout(config.server.read_timeout())
            .with_write_timeout(config.server.write_timeout());
        server.init(config.server.port);
        let server = Arc::new(server);

        let pump = Arc::new(PeerPump::new(
            Arc::clone(&engine),
            Arc::clone(&server),
            Arc::clone(&state),
            config.server.recv_buffer_size,
        ));

        Ok(Self {
            config,
            state,
            engine,
            server,
            pump,
            daemon_state: Mutex::new(DaemonState::Initializing),
            workers: Vec::new(),
            started_at: None,
        })
    }

    fn set_state(&self, next: DaemonState) {
        *self.daemon_state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
    }

    pub fn get_state(&self) -> DaemonState {
        *self.daemon_state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get_config(&self) -> &RelayConfig {
        &self.config
    }

    /// Shared flags; clearing the run flag stops the daemon
    pub fn relay_state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    pub fn engine(&self) -> &Arc<FrameRelayEngine<C>> {
        &self.engine
    }

    pub fn server(&self) -> &Arc<ClientBroadcastServer> {
        &self.server
    }

    pub fn get_stats(&self) -> DaemonStats {
        DaemonStats {
            uptime: self
                .started_at
                .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
                .unwrap_or(0),
            active_peers: self.server.client_count(),
            engine: self.engine.stats(),
            io: self.pump.stats(),
        }
    }

    /// Register with the driver, open the listener and spawn the workers.
    ///
    /// Blocks until the driver family appears or the run flag is cleared.
    pub fn start(&mut self) -> Result<()> {
        log::info!("Starting {}", self.config.general.name);
        self.set_state(DaemonState::Starting);
        self.state.set_running(true);

        if let Err(e) = self.bring_up() {
            log::error!("Start failed: {}", e);
            self.state.request_stop();
            self.join_workers();
            self.set_state(DaemonState::Error);
            return Err(e);
        }

        self.started_at = Some(Utc::now());
        self.set_state(DaemonState::Running);
        log::info!("{} running", self.config.general.name);
        Ok(())
    }

    fn bring_up(&mut self) -> Result<()> {
        self.engine.initialize()?;
        self.engine.send_registration()?;

        if !self.server.listen() {
            return Err(RelayError::System(format!(
                "cannot listen on {}:{}",
                self.config.server.bind_address, self.config.server.port
            )));
        }

        let family = self.engine.family_id().ok_or(RelayError::NotRegistered)?;
        let server = Arc::clone(&self.server);
        self.engine.set_frame_sink(move |frame: &RadioFrame| {
            let reached = server.broadcast(&peer_frame_message(family, frame).encode());
            log::trace!("{} sent to {} peers", frame, reached);
            Ok(())
        });

        let engine = Arc::clone(&self.engine);
        self.spawn_worker("kernel-rx", move || {
            if let Err(e) = engine.receive_loop() {
                log::error!("Driver receive loop failed: {}", e);
            }
        })?;

        let pump = Arc::clone(&self.pump);
        self.spawn_worker("peer-rx", move || pump.run())?;

        let server = Arc::clone(&self.server);
        let state = Arc::clone(&self.state);
        let interval = self.config.server.accept_interval();
        self.spawn_worker("peer-accept", move || accept_loop(&server, &state, interval))?;

        Ok(())
    }

    fn spawn_worker<F>(&mut self, name: &str, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(work)
            .map_err(|e| RelayError::System(format!("cannot spawn {} thread: {}", name, e)))?;
        self.workers.push(handle);
        Ok(())
    }

    fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log::error!("{} thread panicked", name);
            }
        }
    }

    /// Clear the run flag, join the workers and drop every peer
    pub fn stop(&mut self) -> Result<()> {
        log::info!("Stopping {}", self.config.general.name);
        self.set_state(DaemonState::Stopping);

        self.state.request_stop();
        self.join_workers();
        self.server.close_all();

        self.set_state(DaemonState::Stopped);
        log::info!("{} stopped", self.config.general.name);
        Ok(())
    }

    /// Start, block until the run flag clears, then stop
    pub fn run(&mut self) -> Result<()> {
        self.start()?;

        while self.state.is_running() {
            thread::sleep(RUN_POLL);
        }

        self.stop()
    }
}

/// Admit peers until the run flag clears
fn accept_loop(server: &ClientBroadcastServer, state: &RelayState, interval: Duration) {
    log::info!("Accept loop started");
    while state.is_running() {
        match server.try_accept() {
            Ok(Some(_)) => {}
            Ok(None) => thread::sleep(interval),
            // already logged, connection shut down
            Err(RelayError::CapacityExceeded { .. }) => {}
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                thread::sleep(interval);
            }
        }
    }
    log::info!("Accept loop stopped");
}
