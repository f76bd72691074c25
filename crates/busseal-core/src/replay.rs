//! Replay protection for secured data.
//!
//! Frames on the bus arrive in order or not at all, so a strictly monotonic
//! counter is enough: a frame is fresh only if its counter is greater than
//! every counter accepted before. No window is kept.
//!
//! A session holds one guard per peer member and a new session starts with
//! new guards.
//!
//! Checking and committing are separate steps. A counter is committed only
//! after the frame's tag verified, so a forged frame carrying a huge counter
//! cannot lock out the legitimate sender.

use crate::error::{Error, Result};

/// Strictly monotonic replay guard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayGuard {
    last_accepted: u32,
}

impl ReplayGuard {
    /// Create a guard that accepts any counter above zero.
    #[must_use]
    pub const fn new() -> Self {
        Self { last_accepted: 0 }
    }

    /// Test whether `counter` is fresh without changing state.
    ///
    /// # Errors
    ///
    /// Returns `Error::ReplayedOrStale` if `counter` is not greater than the
    /// last accepted counter.
    pub fn check(&self, counter: u32) -> Result<()> {
        if counter > self.last_accepted {
            Ok(())
        } else {
            Err(Error::ReplayedOrStale {
                counter,
                last_accepted: self.last_accepted,
            })
        }
    }

    /// Commit `counter` as accepted.
    ///
    /// # Errors
    ///
    /// Returns `Error::ReplayedOrStale` if `counter` is not fresh; state is
    /// left unchanged.
    pub fn accept(&mut self, counter: u32) -> Result<()> {
        self.check(counter)?;
        self.last_accepted = counter;
        Ok(())
    }

    /// Highest counter accepted so far (zero before the first).
    #[must_use]
    pub const fn last_accepted(&self) -> u32 {
        self.last_accepted
    }
}
