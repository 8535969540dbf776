//! Kernel channel abstraction
//!
//! The relay talks to the hwsim driver through a generic netlink socket.
//! This module defines the narrow interface the engine needs from it, so the
//! engine can run against the real socket or an in-memory channel.

use std::time::Duration;

use crate::wire::{GenlMessage, NetlinkMessage};
use crate::Result;

pub mod mock;

#[cfg(target_os = "linux")]
pub mod genl;

pub use mock::MockChannel;

#[cfg(target_os = "linux")]
pub use genl::GenlSocket;

/// Outcome of a bounded receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A message arrived
    Message(NetlinkMessage),
    /// The receive timeout elapsed with nothing to read
    Timeout,
}

/// Family-scoped kernel message channel
///
/// All methods take `&self`: the engine receives on one thread while the
/// peer side sends on another.
pub trait KernelChannel: Send + Sync {
    /// Open the underlying socket; calling it again is a no-op
    fn connect(&self) -> Result<()>;

    /// Look up a family id by name; `None` while the family is not registered
    fn resolve_family(&self, name: &str) -> Result<Option<u16>>;

    /// Bound every subsequent `receive` by `timeout`
    fn set_receive_timeout(&self, timeout: Duration) -> Result<()>;

    /// Send one message to the kernel
    fn send(&self, message: &GenlMessage) -> Result<()>;

    /// Block for the next message or until the receive timeout elapses
    fn receive(&self) -> Result<ChannelEvent>;
}
