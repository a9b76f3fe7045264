//! Uniform send/receive over a UDP datagram socket or a shared TCP stream.
//!
//! The abstraction presents `send`/`close` plus an inbound [`FrameSink`]
//! callback the connection registers once at construction time. On I/O
//! error during send, the operation fails with [`EngineError::Transport`];
//! the connection state machine decides whether to retry or close.

pub mod tcp;
pub mod udp;

pub use tcp::{StreamRegistry, TcpTransport};
pub use udp::UdpTransport;

use crate::error::EngineError;
use crate::wire::Header;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportKind {
    Udp,
    Tcp,
}

/// Callback invoked for every complete inbound frame this connection should
/// see: the decoded header, the frame's body, and (for UDP) the datagram's
/// source address. TCP transports report the registered stream's peer via
/// their own bookkeeping and pass `0.0.0.0:0` here, since the peer is
/// implied by the (shared) stream rather than carried per-frame.
pub type FrameSink = Arc<dyn Fn(Header, &[u8], Ipv4Addr, u16) + Send + Sync>;

pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;
    fn send(&self, bytes: &[u8], destination: Option<SocketAddrV4>) -> Result<(), EngineError>;
    /// Stops receiving and releases this connection's claim on the
    /// transport. UDP closes its own socket; TCP only unregisters, since
    /// the stream is shared and owned elsewhere (§5).
    fn close(&self);
    /// Notifies the transport that the server has assigned `channel_id`.
    /// A no-op for UDP; a TCP transport re-keys its stream registration
    /// from the pending slot to the real channel ID.
    fn on_channel_assigned(&self, _channel_id: u8) {}
}
