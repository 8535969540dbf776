//! Peer-side I/O for the relay daemon
//!
//! The peer pump services every occupied slot from one thread. Bytes read
//! from a peer are reassembled into netlink messages; each frame message is
//! fanned out to the other peers and injected into the local driver.

use crate::channel::KernelChannel;
use crate::engine::FrameRelayEngine;
use crate::frame::RadioFrame;
use crate::hwsim::{FrameMessage, HwsimCommand};
use crate::peers::{ClientBroadcastServer, PeerInfo};
use crate::state::RelayState;
use crate::wire::{NetlinkMessage, StreamDecoder};
use crate::{RelayError, MAX_CLIENT};

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Sleep between sweeps while no peer is connected
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Peer I/O statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoStats {
    /// Bytes read from peers
    pub bytes_received: u64,
    /// Complete messages decoded
    pub messages_received: u64,
    /// Frame messages passed to other peers
    pub frames_fanned_out: u64,
    /// Frames injected into the driver
    pub frames_injected: u64,
    /// Messages that were not frames or could not be decoded
    pub messages_dropped: u64,
    /// Peers dropped after a hang-up or a broken stream
    pub peers_disconnected: u64,
}

/// Per-slot reassembly state
#[derive(Debug, Default)]
struct PeerLink {
    /// Peer the buffered bytes belong to
    owner: Option<PeerInfo>,
    decoder: StreamDecoder,
}

impl PeerLink {
    fn reset(&mut self, owner: Option<PeerInfo>) {
        self.owner = owner;
        self.decoder.clear();
    }
}

/// Moves frames from peers to the other peers and the driver
#[derive(Debug)]
pub struct PeerPump<C: KernelChannel> {
    engine: Arc<FrameRelayEngine<C>>,
    server: Arc<ClientBroadcastServer>,
    state: Arc<RelayState>,
    buffer_size: usize,
    stats: Mutex<IoStats>,
}

impl<C: KernelChannel> PeerPump<C> {
    pub fn new(
        engine: Arc<FrameRelayEngine<C>>,
        server: Arc<ClientBroadcastServer>,
        state: Arc<RelayState>,
        buffer_size: usize,
    ) -> Self {
        Self {
            engine,
            server,
            state,
            buffer_size: buffer_size.max(1),
            stats: Mutex::new(IoStats::default()),
        }
    }

    pub fn stats(&self) -> IoStats {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn record(&self, update: impl FnOnce(&mut IoStats)) {
        update(&mut self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
    }

    /// Service peers until the run flag clears
    pub fn run(&self) {
        log::info!("Peer receive loop started");

        let mut links: Vec<PeerLink> = (0..MAX_CLIENT).map(|_| PeerLink::default()).collect();
        let mut buf = vec![0u8; self.buffer_size];

        while self.state.is_running() {
            let slots = self.server.occupied_slots();
            if slots.is_empty() {
                thread::sleep(IDLE_POLL);
                continue;
            }
            for slot in slots {
                if !self.state.is_running() {
                    break;
                }
                self.service_slot(slot, &mut links[slot], &mut buf);
            }
        }

        log::info!("Peer receive loop stopped");
    }

    /// Read once from a slot and handle every message that completed
    fn service_slot(&self, slot: usize, link: &mut PeerLink, buf: &mut [u8]) {
        let owner = self.server.peer_info(slot);
        if link.owner != owner {
            link.reset(owner);
        }

        let read = match self.server.receive_from(slot, buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(RelayError::InvalidSlot(_)) => {
                link.reset(None);
                return;
            }
            Err(RelayError::ConnectionClosed(_)) => {
                log::debug!("Peer on slot {} hung up", slot);
                self.disconnect(slot, link);
                return;
            }
            Err(e) => {
                log::warn!("Read from slot {} failed: {}", slot, e);
                self.disconnect(slot, link);
                return;
            }
        };

        self.record(|s| s.bytes_received += read as u64);
        link.decoder.push(&buf[..read]);

        loop {
            match link.decoder.next_message() {
                Ok(Some(message)) => {
                    self.record(|s| s.messages_received += 1);
                    self.handle_peer_message(slot, message);
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Dropping peer on slot {}: {}", slot, e);
                    self.disconnect(slot, link);
                    break;
                }
            }
        }
    }

    fn disconnect(&self, slot: usize, link: &mut PeerLink) {
        if let Err(e) = self.server.close(slot) {
            log::warn!("Closing slot {} failed: {}", slot, e);
        }
        link.reset(None);
        self.record(|s| s.peers_disconnected += 1);
    }

    /// Relay one message received from a peer
    pub fn handle_peer_message(&self, slot: usize, message: NetlinkMessage) {
        let msg = match message {
            NetlinkMessage::Genl(msg) if HwsimCommand::from(msg.command) == HwsimCommand::Frame => msg,
            other => {
                log::trace!("Ignoring message type {} from slot {}", other.msg_type(), slot);
                self.record(|s| s.messages_dropped += 1);
                return;
            }
        };

        let frame = match FrameMessage::parse(&msg).and_then(|parsed| {
            let payload = parsed.frame.ok_or_else(|| {
                RelayError::MalformedMessage("frame message without frame".to_string())
            })?;
            let mut frame = RadioFrame::from_payload(payload, parsed.frequency)?;
            frame.receiver = parsed.receiver;
            Ok(frame)
        }) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping message from slot {}: {}", slot, e);
                self.record(|s| s.messages_dropped += 1);
                return;
            }
        };

        log::debug!("Peer {} sent {}", slot, frame);

        let reached = self.server.broadcast_except(slot, &msg.encode());
        if reached > 0 {
            self.record(|s| s.frames_fanned_out += 1);
        }

        match self.engine.inject_frame(&frame) {
            Ok(()) => self.record(|s| s.frames_injected += 1),
            Err(e) => log::warn!("Injecting {} failed: {}", frame, e),
        }
    }
}
