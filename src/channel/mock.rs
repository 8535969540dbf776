//! In-memory kernel channel
//!
//! Stands in for the generic netlink socket in tests and loopback setups:
//! messages injected with [`MockChannel::inject`] are returned by `receive`,
//! and every message the relay sends is recorded.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::{ChannelEvent, KernelChannel};
use crate::wire::{GenlMessage, NetlinkMessage};
use crate::{RelayError, Result};

/// Receive timeout used until one is configured
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct MockInner {
    connected: bool,
    family_name: String,
    family_id: Option<u16>,
    /// Resolve attempts that still report the family as missing
    pending_resolves: u32,
    resolve_calls: u32,
    timeout: Duration,
    fail_sends: bool,
    inbound: VecDeque<NetlinkMessage>,
    sent: Vec<GenlMessage>,
}

/// In-memory [`KernelChannel`]
#[derive(Debug)]
pub struct MockChannel {
    inner: Mutex<MockInner>,
    inbound_ready: Condvar,
    sent_ready: Condvar,
}

impl MockChannel {
    /// Channel on which `family_name` resolves to `family_id` immediately
    pub fn new(family_name: &str, family_id: u16) -> Self {
        Self::with_inner(MockInner {
            connected: false,
            family_name: family_name.to_string(),
            family_id: Some(family_id),
            pending_resolves: 0,
            resolve_calls: 0,
            timeout: DEFAULT_TIMEOUT,
            fail_sends: false,
            inbound: VecDeque::new(),
            sent: Vec::new(),
        })
    }

    /// Channel on which the family appears only after `attempts` failed lookups
    pub fn with_family_delay(family_name: &str, family_id: u16, attempts: u32) -> Self {
        let channel = Self::new(family_name, family_id);
        channel.lock().pending_resolves = attempts;
        channel
    }

    /// Channel on which the family never appears
    pub fn unavailable(family_name: &str) -> Self {
        let channel = Self::new(family_name, 0);
        channel.lock().family_id = None;
        channel
    }

    fn with_inner(inner: MockInner) -> Self {
        Self {
            inner: Mutex::new(inner),
            inbound_ready: Condvar::new(),
            sent_ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a message for `receive`
    pub fn inject(&self, message: NetlinkMessage) {
        self.lock().inbound.push_back(message);
        self.inbound_ready.notify_all();
    }

    /// Queue a generic netlink message for `receive`
    pub fn inject_genl(&self, message: GenlMessage) {
        self.inject(NetlinkMessage::Genl(message));
    }

    /// Make subsequent sends fail (or succeed again)
    pub fn set_fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    /// Messages sent so far, in order
    pub fn sent(&self) -> Vec<GenlMessage> {
        self.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.lock().sent.len()
    }

    /// Wait until at least `count` messages were sent
    pub fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .sent_ready
            .wait_timeout_while(guard, timeout, |inner| inner.sent.len() < count)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.sent.len() >= count
    }

    /// Messages queued and not yet received
    pub fn pending_inbound(&self) -> usize {
        self.lock().inbound.len()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn resolve_calls(&self) -> u32 {
        self.lock().resolve_calls
    }

    pub fn receive_timeout(&self) -> Duration {
        self.lock().timeout
    }
}

impl KernelChannel for MockChannel {
    fn connect(&self) -> Result<()> {
        self.lock().connected = true;
        Ok(())
    }

    fn resolve_family(&self, name: &str) -> Result<Option<u16>> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(RelayError::ChannelUnavailable("channel not connected".to_string()));
        }
        inner.resolve_calls += 1;
        if name != inner.family_name {
            return Ok(None);
        }
        if inner.pending_resolves > 0 {
            inner.pending_resolves -= 1;
            return Ok(None);
        }
        Ok(inner.family_id)
    }

    fn set_receive_timeout(&self, timeout: Duration) -> Result<()> {
        self.lock().timeout = timeout;
        Ok(())
    }

    fn send(&self, message: &GenlMessage) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_sends {
            return Err(RelayError::SendFailed("mock channel rejects sends".to_string()));
        }
        inner.sent.push(message.clone());
        drop(inner);
        self.sent_ready.notify_all();
        Ok(())
    }

    fn receive(&self) -> Result<ChannelEvent> {
        let guard = self.lock();
        let timeout = guard.timeout;
        let (mut guard, _) = self
            .inbound_ready
            .wait_timeout_while(guard, timeout, |inner| inner.inbound.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        Ok(match guard.inbound.pop_front() {
            Some(message) => ChannelEvent::Message(message),
            None => ChannelEvent::Timeout,
        })
    }
}
