//! Relay state management
//!
//! The two flags shared between the worker threads of a relay.

use std::sync::{Mutex, MutexGuard};

/// Shared run/registered flags.
///
/// Each flag has its own lock; accessors hold it only for the read or write
/// itself.
#[derive(Debug, Default)]
pub struct RelayState {
    /// Channel completed the registration handshake
    registered: Mutex<bool>,
    /// Daemon loops should keep running
    running: Mutex<bool>,
}

fn lock(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    // a poisoned bool is still a valid bool
    flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RelayState {
    /// Create state with both flags cleared
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self) -> bool {
        *lock(&self.registered)
    }

    pub fn set_registered(&self, value: bool) {
        *lock(&self.registered) = value;
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.running)
    }

    pub fn set_running(&self, value: bool) {
        *lock(&self.running) = value;
    }

    /// Clear the run flag; loops observe it within one timeout interval
    pub fn request_stop(&self) {
        self.set_running(false);
    }
}
