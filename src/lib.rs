//! # vwifi-relay
//!
//! User-space bridge between the `mac80211_hwsim` virtual radio driver and a
//! set of TCP peers. Frames the driver transmits arrive over generic netlink,
//! are acknowledged back to the driver with a synthetic rate-retry table and
//! are fanned out to every connected peer. Frames arriving from a peer are
//! fanned out to the other peers and injected back into the driver.
//!
//! ## Architecture
//!
//! - `frame`: MAC addresses and the relayed radio frame
//! - `rate`: rate/attempt tables and the acknowledgement builder
//! - `wire`: generic netlink message and attribute codec
//! - `hwsim`: hwsim family commands, attributes and message builders
//! - `channel`: the kernel channel abstraction and its implementations
//! - `state`: shared run/registered flags
//! - `engine`: the frame relay engine (registration, dispatch, acks)
//! - `peers`: the fixed-slot broadcast server
//! - `daemon`: configuration and the composition root

pub mod channel;
pub mod engine;
pub mod frame;
pub mod hwsim;
pub mod peers;
pub mod rate;
pub mod state;
pub mod wire;

pub mod daemon;

pub use crate::{
    engine::{Dispatch, EngineState, EngineStats, FrameRelayEngine},
    frame::{MacAddr, RadioFrame},
    peers::{ClientBroadcastServer, PeerInfo},
    rate::{RateAttempt, RateAttemptTable},
    state::RelayState,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Kernel channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("All {max} client slots are occupied")]
    CapacityExceeded { max: usize },

    #[error("Invalid client slot: {0}")]
    InvalidSlot(usize),

    #[error("Connection closed on slot {0}")]
    ConnectionClosed(usize),

    #[error("Channel is not registered with the driver")]
    NotRegistered,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("System error: {0}")]
    System(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Maximum number of simultaneously connected peers
pub const MAX_CLIENT: usize = 30;

/// Generic netlink family registered by mac80211_hwsim
pub const HWSIM_FAMILY_NAME: &str = "MAC80211_HWSIM";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(MAX_CLIENT, 30);
        assert_eq!(HWSIM_FAMILY_NAME, "MAC80211_HWSIM");
    }

    #[test]
    fn test_error_display() {
        let err = RelayError::CapacityExceeded { max: MAX_CLIENT };
        assert_eq!(err.to_string(), "All 30 client slots are occupied");
        assert_eq!(RelayError::InvalidSlot(4).to_string(), "Invalid client slot: 4");
    }
}
