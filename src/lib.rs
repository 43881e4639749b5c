//! A composable, authenticated transport stack over a single TCP
//! connection: an I/O hub multiplexes readiness events and scheduled
//! work, a protocol stack links a network layer through zero or more
//! handshake filters up to an application layer, and the bundled filters
//! (ACK exchange, connection-header negotiation, TLS) compose to produce
//! the same stack shape a coordinator and a worker each drive from their
//! own end of the wire.
//!
//! Build a stack from the bottom up: pick a network layer
//! ([`net::NonBlockingNetworkLayer`] registered against an [`hub::IoHub`],
//! or [`net::BlockingNetworkLayer`] with its own reader/writer threads),
//! stack filters on top ([`filters::ack::AckFilter`],
//! [`filters::header::HeaderFilter`], [`filters::tls::TlsFilter`]), cap
//! it with an [`app::ApplicationLayer`], then hand the ordered layers to
//! [`stack::Stack::build`].

pub mod app;
pub mod buffer;
pub mod config;
pub mod error;
pub mod filters;
pub mod hub;
pub mod net;
pub mod stack;

pub use error::{Error, Result};
