//! Session configuration

use crate::frame::HeaderType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of draws when picking a non-zero session identifier
pub const DEFAULT_SESSION_ID_ATTEMPTS: usize = 8;

/// Per-node session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Width of the group identifier in frame headers
    pub header_type: HeaderType,

    /// Reject handshake responses older than this, measured from the request.
    /// `None` disables the check and the clock is never read.
    #[serde(with = "opt_millis")]
    pub handshake_timeout: Option<Duration>,

    /// Highest send counter a session may use before a new handshake is needed
    pub max_counter: u32,

    /// Draws allowed when picking a non-zero session identifier
    pub session_id_attempts: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            header_type: HeaderType::Extended,
            handshake_timeout: None,
            max_counter: u32::MAX,
            session_id_attempts: DEFAULT_SESSION_ID_ATTEMPTS,
        }
    }
}

impl SessionConfig {
    /// Set the header layout
    #[must_use]
    pub fn with_header_type(mut self, header_type: HeaderType) -> Self {
        self.header_type = header_type;
        self
    }

    /// Enable the handshake response timeout
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Lower the send counter limit
    #[must_use]
    pub fn with_max_counter(mut self, max_counter: u32) -> Self {
        self.max_counter = max_counter;
        self
    }
}

/// Optional durations as integer milliseconds.
mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => ser.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(de)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.header_type, HeaderType::Extended);
        assert!(config.handshake_timeout.is_none());
        assert_eq!(config.max_counter, u32::MAX);
    }

    #[test]
    fn test_builders() {
        let config = SessionConfig::default()
            .with_header_type(HeaderType::Compact)
            .with_handshake_timeout(Duration::from_millis(500))
            .with_max_counter(3);
        assert_eq!(config.header_type, HeaderType::Compact);
        assert_eq!(config.handshake_timeout, Some(Duration::from_millis(500)));
        assert_eq!(config.max_counter, 3);
    }
}
