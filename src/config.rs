//! Stack-level construction knobs (spec section 3's ambient "Configuration"
//! concern). [`HubConfig`] lives beside the hub it configures
//! (`hub::HubConfig`); this module holds the counterpart for everything a
//! single stack needs that isn't hub-wide — the teacher's
//! `ListenerConfig { tls, http_port, https_port }` pattern, generalized.

use std::time::Duration;

use bytes::Bytes;

use crate::filters::ack::DEFAULT_SENTINEL;

/// Per-stack handshake knobs: ACK sentinel and the shared handshaking
/// deadline used by both the ACK and connection-header filters.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Bytes exchanged by the ACK filter. Defaults to `b"ACK"` (spec.md 6).
    pub ack_sentinel: Bytes,
    /// Deadline for the ACK exchange, the header exchange, and a
    /// refusal's BYE confirmation, each measured from when that phase
    /// starts.
    pub handshaking_timeout: Duration,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            ack_sentinel: Bytes::from_static(DEFAULT_SENTINEL),
            handshaking_timeout: Duration::from_secs(30),
        }
    }
}

impl StackConfig {
    /// Start from the defaults and override the sentinel.
    pub fn with_ack_sentinel(mut self, sentinel: Bytes) -> Self {
        self.ack_sentinel = sentinel;
        self
    }

    /// Start from the defaults and override the handshaking deadline.
    pub fn with_handshaking_timeout(mut self, timeout: Duration) -> Self {
        self.handshaking_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_wire_sentinel() {
        let cfg = StackConfig::default();
        assert_eq!(&cfg.ack_sentinel[..], DEFAULT_SENTINEL);
        assert_eq!(cfg.handshaking_timeout, Duration::from_secs(30));
    }

    #[test]
    fn builder_overrides_are_independent() {
        let cfg = StackConfig::default().with_handshaking_timeout(Duration::from_secs(5));
        assert_eq!(cfg.handshaking_timeout, Duration::from_secs(5));
        assert_eq!(&cfg.ack_sentinel[..], DEFAULT_SENTINEL);
    }
}
