//! Rate/attempt tables
//!
//! The driver proposes a table of (rate index, maximum attempts) rounds with
//! every frame. The relay answers with the attempts it actually spent, which
//! is what the driver feeds back into its rate control.

use serde::{Deserialize, Serialize};
use std::ops::Index;
use crate::{RelayError, Result};

/// Number of rate rounds the driver carries per frame (IEEE80211_TX_MAX_RATES)
pub const MAX_RATES_PER_TX: usize = 4;

/// Encoded size of one round on the wire
pub const RATE_ATTEMPT_LEN: usize = 2;

/// Encoded size of a full table
pub const RATE_TABLE_LEN: usize = MAX_RATES_PER_TX * RATE_ATTEMPT_LEN;

/// One round of the rate table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateAttempt {
    /// Rate index, -1 marks an unused round
    pub idx: i8,
    /// Number of attempts at this rate
    pub count: u8,
}

impl RateAttempt {
    /// Marker for an unused round
    pub const UNUSED: RateAttempt = RateAttempt { idx: -1, count: 0 };

    pub const fn new(idx: i8, count: u8) -> Self {
        Self { idx, count }
    }

    /// Whether this round carries a rate
    pub fn is_valid(&self) -> bool {
        self.idx != -1
    }
}

impl Default for RateAttempt {
    fn default() -> Self {
        Self::UNUSED
    }
}

/// Fixed-size table of rate rounds
///
/// Always fully populated: trailing rounds the driver did not use are
/// explicitly `(-1, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateAttemptTable {
    rounds: [RateAttempt; MAX_RATES_PER_TX],
}

impl RateAttemptTable {
    /// Table with every round marked unused
    pub fn invalid() -> Self {
        Self {
            rounds: [RateAttempt::UNUSED; MAX_RATES_PER_TX],
        }
    }

    /// Build a table from leading rounds; the rest stay unused
    pub fn from_rounds(rounds: &[RateAttempt]) -> Result<Self> {
        if rounds.len() > MAX_RATES_PER_TX {
            return Err(RelayError::MalformedMessage(format!(
                "rate table holds at most {} rounds, got {}",
                MAX_RATES_PER_TX,
                rounds.len()
            )));
        }
        let mut table = Self::invalid();
        table.rounds[..rounds.len()].copy_from_slice(rounds);
        Ok(table)
    }

    /// Decode the packed `{ i8 idx, u8 count }` wire form.
    ///
    /// A shorter blob leaves the missing rounds unused; bytes past the last
    /// round are ignored.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut table = Self::invalid();
        for (round, chunk) in table
            .rounds
            .iter_mut()
            .zip(data.chunks_exact(RATE_ATTEMPT_LEN))
        {
            *round = RateAttempt::new(chunk[0] as i8, chunk[1]);
        }
        table
    }

    /// Encode to the packed wire form
    pub fn to_bytes(&self) -> [u8; RATE_TABLE_LEN] {
        let mut out = [0u8; RATE_TABLE_LEN];
        for (chunk, round) in out.chunks_exact_mut(RATE_ATTEMPT_LEN).zip(self.rounds.iter()) {
            chunk[0] = round.idx as u8;
            chunk[1] = round.count;
        }
        out
    }

    pub fn rounds(&self) -> &[RateAttempt; MAX_RATES_PER_TX] {
        &self.rounds
    }

    /// Number of leading rounds carrying a rate
    pub fn valid_rounds(&self) -> usize {
        self.rounds.iter().take_while(|r| r.is_valid()).count()
    }

    /// Sum of attempts over all rounds
    pub fn total_attempts(&self) -> u32 {
        self.rounds.iter().map(|r| r.count as u32).sum()
    }
}

impl Default for RateAttemptTable {
    fn default() -> Self {
        Self::invalid()
    }
}

impl Index<usize> for RateAttemptTable {
    type Output = RateAttempt;

    fn index(&self, index: usize) -> &RateAttempt {
        &self.rounds[index]
    }
}

/// Decides whether an attempt got the frame through
pub trait DeliveryPolicy: Send + Sync {
    /// Called after each attempt; `attempt` starts at 1 within a round
    fn delivered(&self, round: usize, rate: RateAttempt, attempt: u8) -> bool;
}

/// Never reports an early delivery, so every proposed attempt is spent
#[derive(Debug, Clone, Copy, Default)]
pub struct FullAttemptPolicy;

impl DeliveryPolicy for FullAttemptPolicy {
    fn delivered(&self, _round: usize, _rate: RateAttempt, _attempt: u8) -> bool {
        false
    }
}

impl<F> DeliveryPolicy for F
where
    F: Fn(usize, RateAttempt, u8) -> bool + Send + Sync,
{
    fn delivered(&self, round: usize, rate: RateAttempt, attempt: u8) -> bool {
        self(round, rate, attempt)
    }
}

/// Build the acknowledgement table for a proposed table.
///
/// Rounds are walked in order until an unused round is reached, the policy
/// reports a delivery, or the table ends. Each visited round copies its rate
/// index and records the running attempt count.
pub fn build_ack_table(proposed: &RateAttemptTable, policy: &dyn DeliveryPolicy) -> RateAttemptTable {
    let mut attempts = RateAttemptTable::invalid();
    let mut delivered = false;

    for (round, rate) in proposed.rounds.iter().enumerate() {
        if !rate.is_valid() || delivered {
            break;
        }

        attempts.rounds[round].idx = rate.idx;

        for attempt in 1..=rate.count {
            attempts.rounds[round].count = attempt;
            if policy.delivered(round, *rate, attempt) {
                delivered = true;
                break;
            }
        }
    }

    attempts
}
