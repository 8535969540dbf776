//! Radio frame structures
//!
//! This module contains the MAC address type and the frame record that is
//! relayed between the driver and the peers.

use serde::{Deserialize, Serialize};
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;
use crate::{RelayError, Result};

/// Length of an IEEE 802 MAC address
pub const ETH_ALEN: usize = 6;

/// Offset of the receiver/destination address (addr1) in an 802.11 header
pub const FRAME_DST_OFFSET: usize = 4;

/// Offset of the transmitter/source address (addr2) in an 802.11 header
pub const FRAME_SRC_OFFSET: usize = 10;

/// Minimum payload length carrying both embedded addresses
pub const FRAME_MIN_LEN: usize = FRAME_SRC_OFFSET + ETH_ALEN;

/// IEEE 802 MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; ETH_ALEN]);

impl MacAddr {
    /// Broadcast address
    pub const BROADCAST: MacAddr = MacAddr([0xff; ETH_ALEN]);

    /// Create address from raw octets
    pub const fn new(octets: [u8; ETH_ALEN]) -> Self {
        Self(octets)
    }

    /// Read an address from the start of a byte slice
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let octets: [u8; ETH_ALEN] = data
            .get(..ETH_ALEN)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| {
                RelayError::MalformedMessage(format!(
                    "MAC address needs {} bytes, got {}",
                    ETH_ALEN,
                    data.len()
                ))
            })?;
        Ok(Self(octets))
    }

    /// Raw octets
    pub fn octets(&self) -> [u8; ETH_ALEN] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; ETH_ALEN];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| RelayError::MalformedMessage(format!("invalid MAC address '{}'", s)))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| RelayError::MalformedMessage(format!("invalid MAC address '{}'", s)))?;
        }
        if parts.next().is_some() {
            return Err(RelayError::MalformedMessage(format!("invalid MAC address '{}'", s)));
        }
        Ok(Self(octets))
    }
}

impl From<[u8; ETH_ALEN]> for MacAddr {
    fn from(octets: [u8; ETH_ALEN]) -> Self {
        Self(octets)
    }
}

/// A frame extracted from a driver message, ready to be relayed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioFrame {
    /// Source address reported for this frame
    pub src: MacAddr,
    /// Destination address embedded in the frame
    pub dst: MacAddr,
    /// Receiver attribute of the outer message, when the driver supplied one
    pub receiver: Option<MacAddr>,
    /// Raw 802.11 frame bytes
    pub payload: Bytes,
    /// Channel frequency in MHz, 0 when unset
    pub frequency: u32,
}

impl RadioFrame {
    /// Build a frame from its raw bytes, taking both addresses from the
    /// embedded link-layer header
    pub fn from_payload(payload: Bytes, frequency: u32) -> Result<Self> {
        let (dst, src) = Self::embedded_addresses(&payload)?;
        Ok(Self {
            src,
            dst,
            receiver: None,
            payload,
            frequency,
        })
    }

    /// Destination (offset 4) and source (offset 10) addresses of a raw frame
    pub fn embedded_addresses(payload: &[u8]) -> Result<(MacAddr, MacAddr)> {
        if payload.len() < FRAME_MIN_LEN {
            return Err(RelayError::MalformedMessage(format!(
                "frame too short for link-layer header: {} bytes",
                payload.len()
            )));
        }
        let dst = MacAddr::from_slice(&payload[FRAME_DST_OFFSET..])?;
        let src = MacAddr::from_slice(&payload[FRAME_SRC_OFFSET..])?;
        Ok((dst, src))
    }

    /// Frame length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl fmt::Display for RadioFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {} -> {}, len={}", self.src, self.dst, self.payload.len())?;
        if self.frequency != 0 {
            write!(f, ", freq={}MHz", self.frequency)?;
        }
        Ok(())
    }
}
