//! mac80211_hwsim generic netlink protocol
//!
//! Commands, attributes and TX status flags of the hwsim family, and the
//! typed messages the relay exchanges with the driver and with its peers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use crate::frame::{MacAddr, RadioFrame};
use crate::rate::RateAttemptTable;
use crate::wire::{Attribute, GenlMessage};
use crate::{RelayError, Result};

/// Generic netlink family version spoken by the driver
pub const VERSION_NR: u8 = 1;

pub const HWSIM_CMD_REGISTER: u8 = 1;
pub const HWSIM_CMD_FRAME: u8 = 2;
pub const HWSIM_CMD_TX_INFO_FRAME: u8 = 3;

pub const HWSIM_ATTR_ADDR_RECEIVER: u16 = 1;
pub const HWSIM_ATTR_ADDR_TRANSMITTER: u16 = 2;
pub const HWSIM_ATTR_FRAME: u16 = 3;
pub const HWSIM_ATTR_FLAGS: u16 = 4;
pub const HWSIM_ATTR_RX_RATE: u16 = 5;
pub const HWSIM_ATTR_SIGNAL: u16 = 6;
pub const HWSIM_ATTR_TX_INFO: u16 = 7;
pub const HWSIM_ATTR_COOKIE: u16 = 8;
pub const HWSIM_ATTR_FREQ: u16 = 19;

/// Driver asks for a TX status report
pub const HWSIM_TX_CTL_REQ_TX_STATUS: u32 = 1 << 0;
/// Frame was acknowledged
pub const HWSIM_TX_STAT_ACK: u32 = 1 << 2;

/// Signal reported in acknowledgements; this side has no measured signal
pub const ACK_SIGNAL: i32 = -10;

/// hwsim command kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HwsimCommand {
    Register,
    Frame,
    TxInfoFrame,
    Unknown(u8),
}

impl From<u8> for HwsimCommand {
    fn from(value: u8) -> Self {
        match value {
            HWSIM_CMD_REGISTER => Self::Register,
            HWSIM_CMD_FRAME => Self::Frame,
            HWSIM_CMD_TX_INFO_FRAME => Self::TxInfoFrame,
            other => Self::Unknown(other),
        }
    }
}

/// Registration request; makes the driver route frames to this socket
pub fn register_message(family: u16) -> GenlMessage {
    GenlMessage::new(family, HWSIM_CMD_REGISTER, VERSION_NR)
}

/// Decoded HWSIM_CMD_FRAME message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMessage {
    /// Radio that transmitted the frame
    pub transmitter: MacAddr,
    /// Receiver attribute, optional metadata
    pub receiver: Option<MacAddr>,
    pub flags: u32,
    /// Rate rounds proposed by the driver
    pub tx_info: RateAttemptTable,
    /// Correlation token to echo in the acknowledgement
    pub cookie: u64,
    /// Raw 802.11 frame
    pub frame: Option<Bytes>,
    /// Frequency in MHz, 0 when absent
    pub frequency: u32,
}

impl FrameMessage {
    /// Decode the attributes of a frame message.
    ///
    /// The transmitter attribute is mandatory; everything else falls back to
    /// an empty value.
    pub fn parse(msg: &GenlMessage) -> Result<Self> {
        let transmitter = msg
            .attrs
            .get_mac(HWSIM_ATTR_ADDR_TRANSMITTER)
            .ok_or_else(|| RelayError::MalformedMessage("missing transmitter attribute".to_string()))?;

        Ok(Self {
            transmitter,
            receiver: msg.attrs.get_mac(HWSIM_ATTR_ADDR_RECEIVER),
            flags: msg.attrs.get_u32(HWSIM_ATTR_FLAGS).unwrap_or(0),
            tx_info: msg
                .attrs
                .get(HWSIM_ATTR_TX_INFO)
                .map(|blob| RateAttemptTable::from_bytes(blob))
                .unwrap_or_default(),
            cookie: msg.attrs.get_u64(HWSIM_ATTR_COOKIE).unwrap_or(0),
            frame: msg.attrs.get(HWSIM_ATTR_FRAME).cloned(),
            frequency: msg.attrs.get_u32(HWSIM_ATTR_FREQ).unwrap_or(0),
        })
    }
}

/// TX status report sent back to the driver for a relayed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckEnvelope {
    /// Transmitter the driver expects, unmodified
    pub transmitter: MacAddr,
    pub flags: u32,
    pub signal: i32,
    pub tx_info: RateAttemptTable,
    pub cookie: u64,
}

impl AckEnvelope {
    /// Build the acknowledgement for a frame, marking it as acked
    pub fn for_frame(frame: &FrameMessage, tx_info: RateAttemptTable) -> Self {
        Self {
            transmitter: frame.transmitter,
            flags: frame.flags | HWSIM_TX_STAT_ACK,
            signal: ACK_SIGNAL,
            tx_info,
            cookie: frame.cookie,
        }
    }

    pub fn is_acked(&self) -> bool {
        self.flags & HWSIM_TX_STAT_ACK != 0
    }

    /// Encode as an HWSIM_CMD_TX_INFO_FRAME message
    pub fn to_message(&self, family: u16) -> GenlMessage {
        GenlMessage::new(family, HWSIM_CMD_TX_INFO_FRAME, VERSION_NR)
            .with_attr(Attribute::mac(HWSIM_ATTR_ADDR_TRANSMITTER, self.transmitter))
            .with_attr(Attribute::u32(HWSIM_ATTR_FLAGS, self.flags))
            .with_attr(Attribute::u32(HWSIM_ATTR_SIGNAL, self.signal as u32))
            .with_attr(Attribute::new(HWSIM_ATTR_TX_INFO, self.tx_info.to_bytes().to_vec()))
            .with_attr(Attribute::u64(HWSIM_ATTR_COOKIE, self.cookie))
    }

    /// Decode an HWSIM_CMD_TX_INFO_FRAME message
    pub fn parse(msg: &GenlMessage) -> Result<Self> {
        let missing = |name: &str| RelayError::MalformedMessage(format!("ack without {} attribute", name));
        Ok(Self {
            transmitter: msg
                .attrs
                .get_mac(HWSIM_ATTR_ADDR_TRANSMITTER)
                .ok_or_else(|| missing("transmitter"))?,
            flags: msg.attrs.get_u32(HWSIM_ATTR_FLAGS).ok_or_else(|| missing("flags"))?,
            signal: msg.attrs.get_u32(HWSIM_ATTR_SIGNAL).ok_or_else(|| missing("signal"))? as i32,
            tx_info: RateAttemptTable::from_bytes(
                msg.attrs.get(HWSIM_ATTR_TX_INFO).ok_or_else(|| missing("tx info"))?,
            ),
            cookie: msg.attrs.get_u64(HWSIM_ATTR_COOKIE).ok_or_else(|| missing("cookie"))?,
        })
    }
}

/// Encode a relayed frame in the format peers exchange: a FRAME message with
/// the (corrected) transmitter, the receiver when known, the frame and its
/// frequency.
pub fn peer_frame_message(family: u16, frame: &RadioFrame) -> GenlMessage {
    let mut msg = GenlMessage::new(family, HWSIM_CMD_FRAME, VERSION_NR)
        .with_attr(Attribute::mac(HWSIM_ATTR_ADDR_TRANSMITTER, frame.src));
    if let Some(receiver) = frame.receiver {
        msg.attrs.push(Attribute::mac(HWSIM_ATTR_ADDR_RECEIVER, receiver));
    }
    msg.attrs.push(Attribute::new(HWSIM_ATTR_FRAME, frame.payload.clone()));
    if frame.frequency != 0 {
        msg.attrs.push(Attribute::u32(HWSIM_ATTR_FREQ, frame.frequency));
    }
    msg
}

/// Encode a frame for delivery to a local radio: the driver matches the
/// receiver attribute against its radios and hands the frame up with the
/// given rate and signal.
pub fn cloned_frame_message(
    family: u16,
    receiver: MacAddr,
    frame: &RadioFrame,
    rx_rate: u32,
    signal: i32,
) -> GenlMessage {
    let mut msg = GenlMessage::new(family, HWSIM_CMD_FRAME, VERSION_NR)
        .with_attr(Attribute::mac(HWSIM_ATTR_ADDR_RECEIVER, receiver))
        .with_attr(Attribute::new(HWSIM_ATTR_FRAME, frame.payload.clone()))
        .with_attr(Attribute::u32(HWSIM_ATTR_RX_RATE, rx_rate))
        .with_attr(Attribute::u32(HWSIM_ATTR_SIGNAL, signal as u32));
    if frame.frequency != 0 {
        msg.attrs.push(Attribute::u32(HWSIM_ATTR_FREQ, frame.frequency));
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::RateAttempt;

    const FAMILY: u16 = 0x1d;

    #[test]
    fn test_command_conversion() {
        assert_eq!(HwsimCommand::from(2), HwsimCommand::Frame);
        assert_eq!(HwsimCommand::from(HWSIM_CMD_REGISTER), HwsimCommand::Register);
        assert_eq!(HwsimCommand::from(HWSIM_CMD_TX_INFO_FRAME), HwsimCommand::TxInfoFrame);
        assert_eq!(HwsimCommand::from(9), HwsimCommand::Unknown(9));
    }

    #[test]
    fn test_register_message() {
        let msg = register_message(FAMILY);
        assert_eq!(msg.command, HWSIM_CMD_REGISTER);
        assert_eq!(msg.version, VERSION_NR);
        assert!(msg.attrs.is_empty());
    }

    #[test]
    fn test_frame_message_requires_transmitter() {
        let msg = GenlMessage::new(FAMILY, HWSIM_CMD_FRAME, VERSION_NR)
            .with_attr(Attribute::new(HWSIM_ATTR_FRAME, vec![0u8; 24]));
        assert!(matches!(FrameMessage::parse(&msg), Err(RelayError::MalformedMessage(_))));
    }

    #[test]
    fn test_frame_message_defaults() {
        let tx = MacAddr::new([2, 0, 0, 0, 0, 0]);
        let msg = GenlMessage::new(FAMILY, HWSIM_CMD_FRAME, VERSION_NR)
            .with_attr(Attribute::mac(HWSIM_ATTR_ADDR_TRANSMITTER, tx));
        let frame = FrameMessage::parse(&msg).unwrap();

        assert_eq!(frame.transmitter, tx);
        assert!(frame.receiver.is_none());
        assert_eq!(frame.flags, 0);
        assert_eq!(frame.tx_info, RateAttemptTable::invalid());
        assert!(frame.frame.is_none());
        assert_eq!(frame.frequency, 0);
    }

    #[test]
    fn test_ack_envelope_encoding() {
        let frame = FrameMessage {
            transmitter: MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            receiver: None,
            flags: HWSIM_TX_CTL_REQ_TX_STATUS,
            tx_info: RateAttemptTable::invalid(),
            cookie: 42,
            frame: None,
            frequency: 0,
        };
        let table = RateAttemptTable::from_rounds(&[RateAttempt::new(2, 3)]).unwrap();
        let ack = AckEnvelope::for_frame(&frame, table);
        assert!(ack.is_acked());
        assert_eq!(ack.flags, HWSIM_TX_CTL_REQ_TX_STATUS | HWSIM_TX_STAT_ACK);

        let msg = ack.to_message(FAMILY);
        assert_eq!(msg.command, HWSIM_CMD_TX_INFO_FRAME);
        assert_eq!(msg.attrs.get_u32(HWSIM_ATTR_SIGNAL), Some((-10i32) as u32));

        let decoded = AckEnvelope::parse(&msg).unwrap();
        assert_eq!(decoded, ack);
    }

    #[test]
    fn test_peer_frame_message() {
        let frame = RadioFrame {
            src: MacAddr::new([2, 0, 0, 0, 1, 0]),
            dst: MacAddr::BROADCAST,
            receiver: None,
            payload: Bytes::from_static(&[0u8; 24]),
            frequency: 2437,
        };
        let msg = peer_frame_message(FAMILY, &frame);
        assert_eq!(msg.command, HWSIM_CMD_FRAME);
        assert_eq!(msg.attrs.get_mac(HWSIM_ATTR_ADDR_TRANSMITTER), Some(frame.src));
        assert!(!msg.attrs.contains(HWSIM_ATTR_ADDR_RECEIVER));
        assert_eq!(msg.attrs.get_u32(HWSIM_ATTR_FREQ), Some(2437));
    }

    #[test]
    fn test_cloned_frame_without_frequency() {
        let frame = RadioFrame {
            src: MacAddr::new([2, 0, 0, 0, 1, 0]),
            dst: MacAddr::new([2, 0, 0, 0, 2, 0]),
            receiver: None,
            payload: Bytes::from_static(&[0u8; 24]),
            frequency: 0,
        };
        let msg = cloned_frame_message(FAMILY, frame.dst, &frame, 1, -50);
        assert_eq!(msg.attrs.get_mac(HWSIM_ATTR_ADDR_RECEIVER), Some(frame.dst));
        assert_eq!(msg.attrs.get_u32(HWSIM_ATTR_RX_RATE), Some(1));
        assert!(!msg.attrs.contains(HWSIM_ATTR_FREQ));
    }
}
