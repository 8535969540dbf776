//! Frame relay engine
//!
//! Owns the conversation with the hwsim driver: resolves and registers with
//! the family, acknowledges every frame the driver hands over, and passes the
//! frame on to a sink bound at setup time. Frames coming back from peers are
//! injected into the driver through [`FrameRelayEngine::inject_frame`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{ChannelEvent, KernelChannel};
use crate::frame::{MacAddr, RadioFrame};
use crate::hwsim::{self, AckEnvelope, FrameMessage, HwsimCommand, ACK_SIGNAL};
use crate::rate::{build_ack_table, DeliveryPolicy, FullAttemptPolicy};
use crate::state::RelayState;
use crate::wire::NetlinkMessage;
use crate::{RelayError, Result, HWSIM_FAMILY_NAME};

/// Pause after a failed receive before trying again
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Destination for frames extracted from driver messages
pub type FrameSink = Arc<dyn Fn(&RadioFrame) -> Result<()> + Send + Sync>;

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Channel not opened yet
    Uninitialized,
    /// Waiting for the driver family to appear
    Registering,
    /// Family resolved, channel ready
    Registered,
    /// Receive loop running
    Relaying,
    /// Stopped by the run flag; a new `initialize` starts over
    Stopped,
}

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Not addressed to the hwsim family
    NotMine,
    /// Kernel error report carrying this code
    DriverError(i32),
    /// hwsim command the relay does not handle
    Ignored,
    /// Frame message that could not be relayed
    Dropped,
    /// Frame acknowledged and handed to the sink
    Relayed(RadioFrame),
}

/// Engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Messages read from the channel
    pub messages_received: u64,
    /// Frames handed to the sink
    pub frames_relayed: u64,
    /// Acknowledgements sent to the driver
    pub acks_sent: u64,
    /// Frame messages dropped as malformed
    pub messages_dropped: u64,
    /// Error reports received from the kernel
    pub driver_errors: u64,
    /// Sends rejected by the channel
    pub send_failures: u64,
    /// Sink calls that failed
    pub forward_failures: u64,
    /// Frames injected into the driver
    pub frames_injected: u64,
    /// Failed receive calls
    pub receive_errors: u64,
}

/// Engine parameters
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Generic netlink family to register with
    pub family_name: String,
    /// Delay between family lookups while the driver is not loaded
    pub resolve_interval: Duration,
    /// Bound on each channel receive
    pub receive_timeout: Duration,
    /// Signal reported in acknowledgements
    pub ack_signal: i32,
    /// Rate index reported for injected frames
    pub rx_rate: u32,
    /// Signal reported for injected frames
    pub rx_signal: i32,
    /// Local radio to deliver injected frames to; the frame's own
    /// destination is used when unset
    pub radio_address: Option<MacAddr>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            family_name: HWSIM_FAMILY_NAME.to_string(),
            resolve_interval: Duration::from_secs(1),
            receive_timeout: Duration::from_secs(1),
            ack_signal: ACK_SIGNAL,
            rx_rate: 1,
            rx_signal: -50,
            radio_address: None,
        }
    }
}

/// The frame relay engine
pub struct FrameRelayEngine<C: KernelChannel> {
    config: EngineConfig,
    channel: C,
    state: Arc<RelayState>,
    lifecycle: Mutex<EngineState>,
    family_id: Mutex<Option<u16>>,
    policy: Box<dyn DeliveryPolicy>,
    sink: Mutex<Option<FrameSink>>,
    stats: Mutex<EngineStats>,
}

impl<C: KernelChannel> std::fmt::Debug for FrameRelayEngine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRelayEngine")
            .field("config", &self.config)
            .field("lifecycle", &self.engine_state())
            .field("family_id", &self.family_id())
            .field("sink", &self.lock_sink().is_some())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<C: KernelChannel> FrameRelayEngine<C> {
    /// Create an engine over an unopened channel
    pub fn new(channel: C, state: Arc<RelayState>, config: EngineConfig) -> Self {
        Self {
            config,
            channel,
            state,
            lifecycle: Mutex::new(EngineState::Uninitialized),
            family_id: Mutex::new(None),
            policy: Box::new(FullAttemptPolicy),
            sink: Mutex::new(None),
            stats: Mutex::new(EngineStats::default()),
        }
    }

    /// Replace the delivery policy used to build acknowledgements
    pub fn with_policy(mut self, policy: impl DeliveryPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Bind the destination for relayed frames
    pub fn set_frame_sink<F>(&self, sink: F)
    where
        F: Fn(&RadioFrame) -> Result<()> + Send + Sync + 'static,
    {
        *self.lock_sink() = Some(Arc::new(sink));
    }

    fn lock_sink(&self) -> MutexGuard<'_, Option<FrameSink>> {
        lock(&self.sink)
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn relay_state(&self) -> &Arc<RelayState> {
        &self.state
    }

    pub fn engine_state(&self) -> EngineState {
        *lock(&self.lifecycle)
    }

    fn set_engine_state(&self, next: EngineState) {
        let mut current = lock(&self.lifecycle);
        if *current != next {
            log::debug!("Engine state {:?} -> {:?}", *current, next);
            *current = next;
        }
    }

    /// Resolved family id, once registered
    pub fn family_id(&self) -> Option<u16> {
        *lock(&self.family_id)
    }

    fn registered_family(&self) -> Result<u16> {
        match self.engine_state() {
            EngineState::Registered | EngineState::Relaying => {
                self.family_id().ok_or(RelayError::NotRegistered)
            }
            _ => Err(RelayError::NotRegistered),
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> EngineStats {
        lock(&self.stats).clone()
    }

    fn record(&self, update: impl FnOnce(&mut EngineStats)) {
        update(&mut lock(&self.stats));
    }

    /// Open the channel and wait for the driver family.
    ///
    /// Lookups repeat every `resolve_interval` for as long as the run flag is
    /// set; the driver may be loaded at any time. Returns immediately when
    /// already registered.
    pub fn initialize(&self) -> Result<()> {
        if matches!(self.engine_state(), EngineState::Registered | EngineState::Relaying) {
            return Ok(());
        }

        self.set_engine_state(EngineState::Registering);

        if let Err(e) = self.channel.connect() {
            self.set_engine_state(EngineState::Uninitialized);
            return Err(RelayError::ChannelUnavailable(format!(
                "could not open kernel channel: {}",
                e
            )));
        }

        let family = loop {
            match self.channel.resolve_family(&self.config.family_name) {
                Ok(Some(id)) => break id,
                Ok(None) => {}
                Err(e) => log::warn!("Family lookup for {} failed: {}", self.config.family_name, e),
            }

            if !self.state.is_running() {
                self.set_engine_state(EngineState::Stopped);
                return Err(RelayError::ChannelUnavailable(format!(
                    "family {} not registered before shutdown",
                    self.config.family_name
                )));
            }

            log::debug!("Family {} not registered yet", self.config.family_name);
            thread::sleep(self.config.resolve_interval);
        };

        if let Err(e) = self.channel.set_receive_timeout(self.config.receive_timeout) {
            log::warn!("Could not set channel receive timeout: {}", e);
        }

        *lock(&self.family_id) = Some(family);
        self.set_engine_state(EngineState::Registered);
        self.state.set_registered(true);

        log::info!("Resolved family {} (id {})", self.config.family_name, family);
        Ok(())
    }

    /// Tell the driver to route frames to this channel
    pub fn send_registration(&self) -> Result<()> {
        let family = self.registered_family()?;

        self.channel
            .send(&hwsim::register_message(family))
            .map_err(|e| RelayError::SendFailed(format!("registration: {}", e)))?;

        log::info!("Registered with family {}", self.config.family_name);
        Ok(())
    }

    /// Dispatch one message read from the channel
    pub fn handle_inbound_message(&self, message: &NetlinkMessage) -> Dispatch {
        let msg = match message {
            NetlinkMessage::Error { code, .. } => {
                if *code != 0 {
                    log::warn!("Kernel reported error {}", code);
                    self.record(|s| s.driver_errors += 1);
                }
                return Dispatch::DriverError(*code);
            }
            NetlinkMessage::Genl(msg) if Some(msg.family) == self.family_id() => msg,
            _ => return Dispatch::NotMine,
        };

        match HwsimCommand::from(msg.command) {
            HwsimCommand::Frame => {}
            other => {
                log::trace!("Ignoring hwsim command {:?}", other);
                return Dispatch::Ignored;
            }
        }

        let family = msg.family;
        let frame = match FrameMessage::parse(msg) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping frame message: {}", e);
                self.record(|s| s.messages_dropped += 1);
                return Dispatch::Dropped;
            }
        };

        if frame.receiver.is_none() {
            log::warn!("hwsim receiver address is not present");
        }

        self.acknowledge(family, &frame);

        let Some(payload) = frame.frame.clone() else {
            log::warn!("Frame message from {} carries no frame", frame.transmitter);
            self.record(|s| s.messages_dropped += 1);
            return Dispatch::Dropped;
        };

        let (frame_dst, frame_src) = match RadioFrame::embedded_addresses(&payload) {
            Ok(addresses) => addresses,
            Err(e) => {
                log::warn!("Frame from {} not relayed: {}", frame.transmitter, e);
                self.record(|s| s.messages_dropped += 1);
                return Dispatch::Dropped;
            }
        };

        if frame_src != frame.transmitter {
            log::debug!("Updating transmitter {} to frame source {}", frame.transmitter, frame_src);
        }

        let relayed = RadioFrame {
            src: frame_src,
            dst: frame_dst,
            receiver: frame.receiver,
            payload,
            frequency: frame.frequency,
        };

        log::debug!("src: {} frame src: {}", frame.transmitter, frame_src);

        self.forward(&relayed);
        self.record(|s| s.frames_relayed += 1);
        Dispatch::Relayed(relayed)
    }

    /// Report the frame as delivered to the driver
    fn acknowledge(&self, family: u16, frame: &FrameMessage) {
        let attempts = build_ack_table(&frame.tx_info, self.policy.as_ref());
        let mut ack = AckEnvelope::for_frame(frame, attempts);
        ack.signal = self.config.ack_signal;

        match self.channel.send(&ack.to_message(family)) {
            Ok(()) => self.record(|s| s.acks_sent += 1),
            Err(e) => {
                log::warn!("TX info for cookie {} not sent: {}", ack.cookie, e);
                self.record(|s| s.send_failures += 1);
            }
        }
    }

    fn forward(&self, frame: &RadioFrame) {
        let sink = self.lock_sink().clone();
        match sink {
            Some(sink) => {
                if let Err(e) = sink(frame) {
                    log::warn!("Forwarding {} failed: {}", frame, e);
                    self.record(|s| s.forward_failures += 1);
                }
            }
            None => log::debug!("No frame sink bound, {} not forwarded", frame),
        }
    }

    /// Deliver a frame received from a peer to the local radio
    pub fn inject_frame(&self, frame: &RadioFrame) -> Result<()> {
        let family = self.registered_family()?;
        let receiver = self.config.radio_address.unwrap_or(frame.dst);
        let msg = hwsim::cloned_frame_message(
            family,
            receiver,
            frame,
            self.config.rx_rate,
            self.config.rx_signal,
        );

        if let Err(e) = self.channel.send(&msg) {
            self.record(|s| s.send_failures += 1);
            return Err(RelayError::SendFailed(format!("frame for {}: {}", receiver, e)));
        }

        self.record(|s| s.frames_injected += 1);
        Ok(())
    }

    /// Receive and dispatch driver messages until the run flag clears
    pub fn receive_loop(&self) -> Result<()> {
        if !self.state.is_registered() {
            return Err(RelayError::NotRegistered);
        }

        self.set_engine_state(EngineState::Relaying);
        log::info!("Driver receive loop started");

        while self.state.is_running() {
            match self.channel.receive() {
                Ok(ChannelEvent::Message(message)) => {
                    self.record(|s| s.messages_received += 1);
                    let outcome = self.handle_inbound_message(&message);
                    log::trace!("Dispatched message type {}: {:?}", message.msg_type(), outcome);
                }
                Ok(ChannelEvent::Timeout) => {}
                Err(e) => {
                    log::warn!("Channel receive failed: {}", e);
                    self.record(|s| s.receive_errors += 1);
                    thread::sleep(RECEIVE_ERROR_BACKOFF);
                }
            }
        }

        self.state.set_registered(false);
        self.set_engine_state(EngineState::Stopped);
        log::info!("Driver receive loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;
    use crate::hwsim::*;
    use crate::rate::{RateAttempt, RateAttemptTable};
    use crate::wire::{Attribute, GenlMessage, NlMsgHeader};
    use bytes::Bytes;
    use std::time::Instant;

    const FAMILY: u16 = 0x1d;
    const TRANSMITTER: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    const RECEIVER: MacAddr = MacAddr::new([0x42, 0x00, 0x00, 0x00, 0x00, 0x00]);

    fn test_config() -> EngineConfig {
        EngineConfig {
            resolve_interval: Duration::from_millis(5),
            receive_timeout: Duration::from_millis(20),
            ..EngineConfig::default()
        }
    }

    fn engine_with(channel: MockChannel) -> FrameRelayEngine<MockChannel> {
        let state = Arc::new(RelayState::new());
        state.set_running(true);
        FrameRelayEngine::new(channel, state, test_config())
    }

    fn registered_engine() -> FrameRelayEngine<MockChannel> {
        let engine = engine_with(MockChannel::new(HWSIM_FAMILY_NAME, FAMILY));
        engine.initialize().unwrap();
        engine
    }

    /// 802.11 header with addr1 = dst and addr2 = src
    fn payload(dst: MacAddr, src: MacAddr) -> Vec<u8> {
        let mut data = vec![0x08, 0x02, 0x00, 0x00];
        data.extend_from_slice(&dst.octets());
        data.extend_from_slice(&src.octets());
        data.extend_from_slice(&[0x01; 14]);
        data
    }

    fn frame_message(payload: Vec<u8>) -> GenlMessage {
        let table = RateAttemptTable::from_rounds(&[RateAttempt::new(2, 3)]).unwrap();
        GenlMessage::new(FAMILY, HWSIM_CMD_FRAME, VERSION_NR)
            .with_attr(Attribute::mac(HWSIM_ATTR_ADDR_TRANSMITTER, TRANSMITTER))
            .with_attr(Attribute::mac(HWSIM_ATTR_ADDR_RECEIVER, RECEIVER))
            .with_attr(Attribute::new(HWSIM_ATTR_FRAME, payload))
            .with_attr(Attribute::u32(HWSIM_ATTR_FLAGS, 0))
            .with_attr(Attribute::new(HWSIM_ATTR_TX_INFO, table.to_bytes().to_vec()))
            .with_attr(Attribute::u64(HWSIM_ATTR_COOKIE, 42))
    }

    fn capture_sink(engine: &FrameRelayEngine<MockChannel>) -> Arc<Mutex<Vec<RadioFrame>>> {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        engine.set_frame_sink(move |frame: &RadioFrame| {
            sink.lock().unwrap().push(frame.clone());
            Ok(())
        });
        captured
    }

    #[test]
    fn test_initialize_registers() {
        let engine = registered_engine();
        assert_eq!(engine.engine_state(), EngineState::Registered);
        assert_eq!(engine.family_id(), Some(FAMILY));
        assert!(engine.relay_state().is_registered());
        assert!(engine.channel().is_connected());
        assert_eq!(engine.channel().receive_timeout(), Duration::from_millis(20));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let engine = registered_engine();
        engine.initialize().unwrap();
        assert_eq!(engine.channel().resolve_calls(), 1);
    }

    #[test]
    fn test_initialize_waits_for_family() {
        let engine = engine_with(MockChannel::with_family_delay(HWSIM_FAMILY_NAME, FAMILY, 3));
        engine.initialize().unwrap();
        assert_eq!(engine.channel().resolve_calls(), 4);
        assert_eq!(engine.engine_state(), EngineState::Registered);
    }

    #[test]
    fn test_initialize_gives_up_on_stop() {
        let engine = engine_with(MockChannel::unavailable(HWSIM_FAMILY_NAME));
        let state = Arc::clone(engine.relay_state());

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            state.request_stop();
        });

        let result = engine.initialize();
        stopper.join().unwrap();

        assert!(matches!(result, Err(RelayError::ChannelUnavailable(_))));
        assert_eq!(engine.engine_state(), EngineState::Stopped);
        assert!(!engine.relay_state().is_registered());
    }

    #[test]
    fn test_send_registration() {
        let engine = registered_engine();
        engine.send_registration().unwrap();

        let sent = engine.channel().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, HWSIM_CMD_REGISTER);
        assert_eq!(sent[0].family, FAMILY);
    }

    #[test]
    fn test_send_registration_requires_registered() {
        let engine = engine_with(MockChannel::new(HWSIM_FAMILY_NAME, FAMILY));
        assert!(matches!(engine.send_registration(), Err(RelayError::NotRegistered)));
    }

    #[test]
    fn test_send_registration_failure() {
        let engine = registered_engine();
        engine.channel().set_fail_sends(true);
        assert!(matches!(engine.send_registration(), Err(RelayError::SendFailed(_))));
    }

    #[test]
    fn test_ack_and_forward_scenario() {
        let engine = registered_engine();
        let captured = capture_sink(&engine);

        let frame_src = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x01, 0x00]);
        let raw = payload(MacAddr::BROADCAST, frame_src);
        let outcome = engine.handle_inbound_message(&NetlinkMessage::Genl(frame_message(raw.clone())));

        let sent = engine.channel().sent();
        assert_eq!(sent.len(), 1);
        let ack = AckEnvelope::parse(&sent[0]).unwrap();
        assert_eq!(sent[0].command, HWSIM_CMD_TX_INFO_FRAME);
        assert_eq!(ack.transmitter, TRANSMITTER);
        assert!(ack.flags & HWSIM_TX_STAT_ACK != 0);
        assert_eq!(ack.cookie, 42);
        assert_eq!(ack.signal, ACK_SIGNAL);
        assert_eq!(ack.tx_info[0], RateAttempt::new(2, 3));
        for i in 1..crate::rate::MAX_RATES_PER_TX {
            assert_eq!(ack.tx_info[i], RateAttempt::UNUSED);
        }

        let frames = captured.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, Bytes::from(raw));
        assert_eq!(frames[0].src, frame_src);
        assert_eq!(frames[0].dst, MacAddr::BROADCAST);
        assert_eq!(frames[0].receiver, Some(RECEIVER));
        assert!(matches!(outcome, Dispatch::Relayed(_)));
    }

    #[test]
    fn test_matching_source_kept() {
        let engine = registered_engine();
        let outcome = engine.handle_inbound_message(&NetlinkMessage::Genl(frame_message(payload(
            RECEIVER,
            TRANSMITTER,
        ))));
        match outcome {
            Dispatch::Relayed(frame) => assert_eq!(frame.src, TRANSMITTER),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_missing_transmitter_dropped() {
        let engine = registered_engine();
        let captured = capture_sink(&engine);

        let msg = GenlMessage::new(FAMILY, HWSIM_CMD_FRAME, VERSION_NR)
            .with_attr(Attribute::mac(HWSIM_ATTR_ADDR_RECEIVER, RECEIVER))
            .with_attr(Attribute::new(HWSIM_ATTR_FRAME, payload(RECEIVER, TRANSMITTER)))
            .with_attr(Attribute::u64(HWSIM_ATTR_COOKIE, 7));

        assert_eq!(engine.handle_inbound_message(&NetlinkMessage::Genl(msg)), Dispatch::Dropped);
        assert_eq!(engine.channel().sent_count(), 0);
        assert!(captured.lock().unwrap().is_empty());
        assert_eq!(engine.stats().messages_dropped, 1);
    }

    #[test]
    fn test_missing_receiver_accepted() {
        let engine = registered_engine();
        let table = RateAttemptTable::from_rounds(&[RateAttempt::new(0, 1)]).unwrap();
        let msg = GenlMessage::new(FAMILY, HWSIM_CMD_FRAME, VERSION_NR)
            .with_attr(Attribute::mac(HWSIM_ATTR_ADDR_TRANSMITTER, TRANSMITTER))
            .with_attr(Attribute::new(HWSIM_ATTR_FRAME, payload(RECEIVER, TRANSMITTER)))
            .with_attr(Attribute::new(HWSIM_ATTR_TX_INFO, table.to_bytes().to_vec()))
            .with_attr(Attribute::u64(HWSIM_ATTR_COOKIE, 9));

        match engine.handle_inbound_message(&NetlinkMessage::Genl(msg)) {
            Dispatch::Relayed(frame) => assert!(frame.receiver.is_none()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(engine.stats().acks_sent, 1);
    }

    #[test]
    fn test_short_frame_acked_not_forwarded() {
        let engine = registered_engine();
        let captured = capture_sink(&engine);
        let outcome = engine.handle_inbound_message(&NetlinkMessage::Genl(frame_message(vec![0u8; 8])));

        assert_eq!(outcome, Dispatch::Dropped);
        assert_eq!(engine.channel().sent_count(), 1);
        assert!(captured.lock().unwrap().is_empty());
    }

    #[test]
    fn test_foreign_family_not_mine() {
        let engine = registered_engine();
        let mut msg = frame_message(payload(RECEIVER, TRANSMITTER));
        msg.family = FAMILY + 1;
        assert_eq!(engine.handle_inbound_message(&NetlinkMessage::Genl(msg)), Dispatch::NotMine);
        assert_eq!(engine.handle_inbound_message(&NetlinkMessage::Done), Dispatch::NotMine);
        assert_eq!(engine.channel().sent_count(), 0);
    }

    #[test]
    fn test_error_message_code() {
        let engine = registered_engine();
        let msg = NetlinkMessage::Error {
            code: -22,
            header: NlMsgHeader::default(),
        };
        assert_eq!(engine.handle_inbound_message(&msg), Dispatch::DriverError(-22));
        assert_eq!(engine.stats().driver_errors, 1);
    }

    #[test]
    fn test_non_frame_command_ignored() {
        let engine = registered_engine();
        let msg = GenlMessage::new(FAMILY, HWSIM_CMD_TX_INFO_FRAME, VERSION_NR);
        assert_eq!(engine.handle_inbound_message(&NetlinkMessage::Genl(msg)), Dispatch::Ignored);
    }

    #[test]
    fn test_sink_failure_not_fatal() {
        let engine = registered_engine();
        engine.set_frame_sink(|_frame: &RadioFrame| Err(RelayError::SendFailed("peer gone".to_string())));

        let outcome = engine.handle_inbound_message(&NetlinkMessage::Genl(frame_message(payload(
            RECEIVER,
            TRANSMITTER,
        ))));
        assert!(matches!(outcome, Dispatch::Relayed(_)));
        assert_eq!(engine.stats().forward_failures, 1);
    }

    #[test]
    fn test_ack_send_failure_still_forwards() {
        let engine = registered_engine();
        let captured = capture_sink(&engine);
        engine.channel().set_fail_sends(true);

        engine.handle_inbound_message(&NetlinkMessage::Genl(frame_message(payload(RECEIVER, TRANSMITTER))));
        assert_eq!(engine.stats().send_failures, 1);
        assert_eq!(captured.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_custom_policy() {
        let first_attempt = |_round: usize, _rate: RateAttempt, _attempt: u8| true;
        let engine = engine_with(MockChannel::new(HWSIM_FAMILY_NAME, FAMILY)).with_policy(first_attempt);
        engine.initialize().unwrap();

        engine.handle_inbound_message(&NetlinkMessage::Genl(frame_message(payload(RECEIVER, TRANSMITTER))));
        let ack = AckEnvelope::parse(&engine.channel().sent()[0]).unwrap();
        assert_eq!(ack.tx_info[0], RateAttempt::new(2, 1));
    }

    #[test]
    fn test_inject_frame() {
        let engine = registered_engine();
        let frame = RadioFrame::from_payload(Bytes::from(payload(RECEIVER, TRANSMITTER)), 2412).unwrap();
        engine.inject_frame(&frame).unwrap();

        let sent = engine.channel().sent();
        assert_eq!(sent[0].command, HWSIM_CMD_FRAME);
        assert_eq!(sent[0].attrs.get_mac(HWSIM_ATTR_ADDR_RECEIVER), Some(RECEIVER));
        assert_eq!(sent[0].attrs.get_u32(HWSIM_ATTR_FREQ), Some(2412));
        assert_eq!(engine.stats().frames_injected, 1);
    }

    #[test]
    fn test_inject_requires_registration() {
        let engine = engine_with(MockChannel::new(HWSIM_FAMILY_NAME, FAMILY));
        let frame = RadioFrame::from_payload(Bytes::from(payload(RECEIVER, TRANSMITTER)), 0).unwrap();
        assert!(matches!(engine.inject_frame(&frame), Err(RelayError::NotRegistered)));
    }

    #[test]
    fn test_receive_loop_requires_registration() {
        let engine = engine_with(MockChannel::new(HWSIM_FAMILY_NAME, FAMILY));
        assert!(matches!(engine.receive_loop(), Err(RelayError::NotRegistered)));
    }

    #[test]
    fn test_receive_loop_dispatches_and_stops() {
        let engine = Arc::new(registered_engine());
        let captured = capture_sink(&engine);

        engine
            .channel()
            .inject_genl(frame_message(payload(RECEIVER, TRANSMITTER)));

        let worker = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.receive_loop())
        };

        assert!(engine.channel().wait_for_sent(1, Duration::from_secs(2)));
        let stop_requested = Instant::now();
        engine.relay_state().request_stop();
        worker.join().unwrap().unwrap();

        assert!(stop_requested.elapsed() < Duration::from_secs(1));
        assert_eq!(captured.lock().unwrap().len(), 1);
        assert_eq!(engine.engine_state(), EngineState::Stopped);
        assert!(!engine.relay_state().is_registered());
        assert_eq!(engine.stats().messages_received, 1);
    }
}
