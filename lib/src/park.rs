//! Park/wake bridge between synchronous callers and the protocol engine.
//!
//! A caller whose request cannot complete yet (no datagram, handshake in
//! flight) is **parked** under its session key and told to retry. When the
//! engine later makes progress for that key it **wakes** the caller: the wake
//! token is queued for the runtime, which re-delivers the original request.
//!
//! # Design
//!
//! Modeled after a fixed-capacity wait queue, keyed by session instead of by
//! task:
//! - At most one waiter per key; re-parking returns the existing token.
//! - Wake is single-fire: the first wake records an outcome and queues the
//!   token, later wakes are no-ops until the outcome is consumed.
//! - Deadlines are counted down by `tick()`; expiry records a one-shot
//!   `TimedOut` outcome ("poison pill").
//! - `cancel()` records a one-shot `Cancelled` outcome so that a caller
//!   retrying after its session was closed gets an explicit answer.
//!
//! # Usage
//!
//! ```rust,ignore
//! // Request side:
//! match table.take_outcome(ssid) {
//!     Some(WaitOutcome::TimedOut) => return Err(TimedOut),
//!     _ => {}
//! }
//! if !ready() {
//!     let token = table.park(ssid, Some(timeout_ms))?;
//!     return Ok(Retry(token));
//! }
//!
//! // Engine side:
//! table.wake(ssid);
//! ```

use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// Maximum number of simultaneously parked callers.
pub const PARK_CAPACITY: usize = 64;

/// Handle given to a parked caller; the runtime re-delivers the request
/// carrying it once the waiter is woken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WakeToken {
    pub key: u32,
    pub generation: u32,
}

/// Why a parked caller was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The engine signalled progress.
    Woken,
    /// The deadline passed before any progress.
    TimedOut,
    /// The session was closed while the caller was parked.
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParkError {
    /// Every waiter slot is in use.
    Full,
}

#[derive(Clone, Copy, Debug)]
struct Waiter {
    token: WakeToken,
    remaining_ms: Option<u32>,
    outcome: Option<WaitOutcome>,
}

/// Table of parked callers.
pub struct ParkTable {
    waiters: Vec<Waiter>,
    woken: VecDeque<WakeToken>,
    /// Monotonic counter stamped into each new token.
    generation: u32,
}

impl Default for ParkTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ParkTable {
    pub const fn new() -> Self {
        Self {
            waiters: Vec::new(),
            woken: VecDeque::new(),
            generation: 0,
        }
    }

    fn find(&self, key: u32) -> Option<usize> {
        self.waiters.iter().position(|w| w.token.key == key)
    }

    /// Park the caller identified by `key`.
    ///
    /// If `key` is already parked and not yet released the existing token is
    /// returned and its deadline is left running. `timeout_ms == None` waits
    /// without a deadline.
    pub fn park(&mut self, key: u32, timeout_ms: Option<u32>) -> Result<WakeToken, ParkError> {
        if let Some(idx) = self.find(key) {
            let waiter = &mut self.waiters[idx];
            if waiter.outcome.is_none() {
                return Ok(waiter.token);
            }
            // Unconsumed outcome from an earlier wait; start over.
            self.waiters.swap_remove(idx);
        }
        if self.waiters.len() >= PARK_CAPACITY {
            return Err(ParkError::Full);
        }
        self.generation = self.generation.wrapping_add(1);
        let token = WakeToken {
            key,
            generation: self.generation,
        };
        self.waiters.push(Waiter {
            token,
            remaining_ms: timeout_ms.filter(|&ms| ms > 0),
            outcome: None,
        });
        Ok(token)
    }

    fn release(&mut self, key: u32, outcome: WaitOutcome) -> bool {
        let Some(idx) = self.find(key) else {
            return false;
        };
        let waiter = &mut self.waiters[idx];
        if waiter.outcome.is_some() {
            return false;
        }
        waiter.outcome = Some(outcome);
        waiter.remaining_ms = None;
        self.woken.push_back(waiter.token);
        true
    }

    /// Wake the caller parked under `key`. Returns `true` if this call
    /// released it; waking an unparked or already released key is a no-op.
    pub fn wake(&mut self, key: u32) -> bool {
        self.release(key, WaitOutcome::Woken)
    }

    /// Release a parked caller because its session went away.
    pub fn cancel(&mut self, key: u32) -> bool {
        self.release(key, WaitOutcome::Cancelled)
    }

    /// Advance every running deadline by `elapsed_ms`. Returns the number of
    /// waiters that timed out.
    pub fn tick(&mut self, elapsed_ms: u32) -> usize {
        let mut expired = 0;
        for waiter in self.waiters.iter_mut() {
            let Some(remaining) = waiter.remaining_ms else {
                continue;
            };
            let left = remaining.saturating_sub(elapsed_ms);
            if left == 0 {
                waiter.remaining_ms = None;
                waiter.outcome = Some(WaitOutcome::TimedOut);
                self.woken.push_back(waiter.token);
                expired += 1;
            } else {
                waiter.remaining_ms = Some(left);
            }
        }
        expired
    }

    /// Consume the outcome recorded for `key`, if it has been released.
    /// A still-parked key keeps its slot and yields `None`.
    pub fn take_outcome(&mut self, key: u32) -> Option<WaitOutcome> {
        let idx = self.find(key)?;
        let outcome = self.waiters[idx].outcome?;
        self.waiters.swap_remove(idx);
        Some(outcome)
    }

    pub fn peek_outcome(&self, key: u32) -> Option<WaitOutcome> {
        self.find(key).and_then(|idx| self.waiters[idx].outcome)
    }

    /// `true` if `key` is parked and not yet released.
    pub fn is_parked(&self, key: u32) -> bool {
        self.find(key)
            .is_some_and(|idx| self.waiters[idx].outcome.is_none())
    }

    /// Drop any state held for `key` without waking it.
    pub fn forget(&mut self, key: u32) {
        if let Some(idx) = self.find(key) {
            self.waiters.swap_remove(idx);
        }
    }

    /// Hand every queued wake token to `f`, in wake order.
    pub fn drain_woken(&mut self, mut f: impl FnMut(WakeToken)) -> usize {
        let mut n = 0;
        while let Some(token) = self.woken.pop_front() {
            f(token);
            n += 1;
        }
        n
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.iter().filter(|w| w.outcome.is_none()).count()
    }

    /// Token generation counter (for debugging / testing).
    pub fn generation(&self) -> u32 {
        self.generation
    }
}
