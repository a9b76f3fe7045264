use super::{FrameSink, Transport, TransportKind};
use crate::error::EngineError;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// The shared stream a TCP transport delegates to. One implementor
/// multiplexes a single `std::net::TcpStream` across every connection
/// registered on it, dispatching inbound frames to the connection whose
/// channel ID matches (§4.2, §4.5).
///
/// Channel ID `0` is reserved as the "pending" key: a connection registers
/// under `0` before it has a server-assigned channel ID (there is no other
/// way to route a CONNECT_RES, which precedes channel assignment) and the
/// registry re-keys it to the real channel ID via [`promote`] once the
/// connect response arrives.
pub trait StreamRegistry: Send + Sync {
    fn register(&self, channel_id: u8, sink: FrameSink);
    fn promote(&self, pending_channel_id: u8, channel_id: u8);
    fn unregister(&self, channel_id: u8);
    fn send(&self, bytes: &[u8]) -> Result<(), EngineError>;
}

pub struct TcpTransport {
    registry: Arc<dyn StreamRegistry>,
    channel_id: AtomicU8,
}

impl TcpTransport {
    /// Registers this connection's interest on `registry` under the pending
    /// key. The connection must not close the shared stream itself, only
    /// register/unregister (§5).
    pub fn new(registry: Arc<dyn StreamRegistry>, on_frame: FrameSink) -> TcpTransport {
        registry.register(0, on_frame);
        TcpTransport {
            registry,
            channel_id: AtomicU8::new(0),
        }
    }

    /// Re-keys this transport's registration from the pending key to the
    /// server-assigned channel ID once a successful CONNECT_RES arrives.
    pub fn promote(&self, channel_id: u8) {
        let pending = self.channel_id.swap(channel_id, Ordering::AcqRel);
        self.registry.promote(pending, channel_id);
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn send(&self, bytes: &[u8], _destination: Option<SocketAddrV4>) -> Result<(), EngineError> {
        self.registry.send(bytes)
    }

    fn close(&self) {
        let id = self.channel_id.load(Ordering::Acquire);
        self.registry.unregister(id);
    }

    fn on_channel_assigned(&self, channel_id: u8) {
        self.promote(channel_id);
    }
}
