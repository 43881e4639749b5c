//! Handshake filter layers: ACK exchange, connection-header negotiation,
//! and TLS wrap/unwrap (spec.md 4.4-4.6).

pub mod ack;
pub mod header;
pub mod tls;
