//! Crate-wide error taxonomy.
//!
//! Every failure a layer, the stack, or the hub can report collapses into one
//! of the kinds below (spec section 7). `Error` is `Clone`: unwinding a
//! close needs to hand the same cause to more than one listener (the
//! stack's `onClosed` and, potentially, a position further up the chain),
//! so causes that aren't `Clone` upstream (`io::Error`, `rustls::Error`) are
//! carried behind an `Arc`.

use std::fmt;
use std::io;
use std::sync::Arc;

/// The crate's error type.
#[derive(Clone, thiserror::Error)]
pub enum Error {
    /// The transport has gone away, or `doCloseSend`/`doCloseRecv` already ran.
    #[error("transport closed")]
    TransportClosed,

    /// Malformed wire data: unparsable header text, unexpected content
    /// length, an unrecognized header response line.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer (transient) or we (via the accept/reject listener) refused
    /// the connection during handshake, or the peer's ACK sentinel didn't
    /// match ours (spec §7/§8 scenario 2: a mismatched ACK surfaces as a
    /// refusal, not a bare protocol violation).
    #[error("connection refused: {reason}")]
    Refused {
        /// `true` for a `FATAL:` refusal, `false` for `ERROR:`.
        permanent: bool,
        /// Human-readable reason, echoed on the wire.
        reason: String,
    },

    /// A TLS engine failure, or a general-security cause it wrapped.
    #[error("tls failure: {0}")]
    Tls(#[from] Arc<rustls::Error>),

    /// The handshaking deadline elapsed while waiting for ACK, header, or
    /// abort confirmation.
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    /// An unexpected runtime failure, typically from a caller-supplied
    /// listener throwing something other than a refusal.
    #[error("internal error: {0}")]
    Internal(String),

    /// Transport-boundary I/O failure.
    #[error("io error: {0}")]
    Io(#[from] Arc<io::Error>),
}

impl Error {
    /// Build a protocol-violation error from a `Display`-able detail.
    pub fn protocol(detail: impl fmt::Display) -> Self {
        Error::Protocol(detail.to_string())
    }

    /// Build a transient refusal, as raised by a header-filter listener.
    pub fn refused(reason: impl Into<String>) -> Self {
        Error::Refused {
            permanent: false,
            reason: reason.into(),
        }
    }

    /// Build a permanent (fatal) refusal.
    pub fn refused_permanent(reason: impl Into<String>) -> Self {
        Error::Refused {
            permanent: true,
            reason: reason.into(),
        }
    }

    /// `true` if this error should ultimately surface as a closed-channel
    /// error to a late caller rather than be re-reported each time.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::TransportClosed | Error::Refused { .. })
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(Arc::new(e))
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
