//! Random number sources.
//!
//! Production code draws from the operating system CSPRNG through
//! [`OsRandom`]. [`RngSource`] adapts any `rand_core` generator so tests and
//! simulations can run with seeded, reproducible randomness.

use crate::CryptoError;
use rand_core::{CryptoRng, RngCore};
use std::sync::Mutex;

/// A fallible source of cryptographically secure random bytes.
///
/// Takes `&self` so one source can be shared by every session of a node.
pub trait RandomSource: Send + Sync {
    /// Fill `buf` entirely with random bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the source cannot deliver.
    fn try_fill(&self, buf: &mut [u8]) -> Result<(), CryptoError>;
}

/// Operating system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn try_fill(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        getrandom::getrandom(buf).map_err(|_| CryptoError::RandomFailed)
    }
}

/// Adapter exposing a `rand_core` RNG as a [`RandomSource`].
pub struct RngSource<R> {
    rng: Mutex<R>,
}

impl<R: RngCore + CryptoRng + Send> RngSource<R> {
    /// Wrap an RNG.
    pub fn new(rng: R) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }
}

impl<R: RngCore + CryptoRng + Send> RandomSource for RngSource<R> {
    fn try_fill(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        let mut rng = self.rng.lock().map_err(|_| CryptoError::RandomFailed)?;
        rng.try_fill_bytes(buf)
            .map_err(|_| CryptoError::RandomFailed)
    }
}

impl<T: RandomSource + ?Sized> RandomSource for std::sync::Arc<T> {
    fn try_fill(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        (**self).try_fill(buf)
    }
}

/// Draw a random fixed-size array.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the source fails.
pub fn random_array<const N: usize, S: RandomSource + ?Sized>(
    source: &S,
) -> Result<[u8; N], CryptoError> {
    let mut buf = [0u8; N];
    source.try_fill(&mut buf)?;
    Ok(buf)
}

/// Draw a non-zero random byte, retrying up to `attempts` times.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the source fails, or
/// [`CryptoError::NonZeroRandomFailed`] if every draw came back zero.
pub fn random_nonzero_u8<S: RandomSource + ?Sized>(
    source: &S,
    attempts: usize,
) -> Result<u8, CryptoError> {
    for _ in 0..attempts {
        let [byte] = random_array::<1, S>(source)?;
        if byte != 0 {
            return Ok(byte);
        }
    }
    Err(CryptoError::NonZeroRandomFailed { attempts })
}
