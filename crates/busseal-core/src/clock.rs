//! Time source abstraction.
//!
//! The protocol reads the clock in one place only: checking a handshake
//! response against the configured timeout. Tests substitute a manual clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current time as a duration since an arbitrary fixed epoch.
///
/// Implementations are expected to be monotonic. A reading earlier than the
/// request time counts as an expired response.
pub trait Clock: Send + Sync {
    /// Current time, or `None` if the clock cannot be read.
    fn now(&self) -> Option<std::time::Duration>;
}

/// Wall clock measured from the Unix epoch.
///
/// Not monotonic: a clock step backwards expires a pending response, and a
/// step forwards may do the same early.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Option<std::time::Duration> {
        SystemTime::now().duration_since(UNIX_EPOCH).ok()
    }
}

impl<T: Clock + ?Sized> Clock for std::sync::Arc<T> {
    fn now(&self) -> Option<std::time::Duration> {
        (**self).now()
    }
}
